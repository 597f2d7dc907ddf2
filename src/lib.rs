//! TCP/IP for the xv6 kernel: packet buffers, Ethernet/ARP/IPv4/UDP framing and a TCP
//! connection state machine.
//!
//! The kernel creates one [`NetStack`] per interface, passing it a [`Kernel`] that provides
//! the clock, sleep/wakeup and the NIC. Processes reach the stack through [`Socket`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod kernel;
pub mod mbuf;
pub mod net;
pub mod param;
mod spinlock;
mod timer;

#[cfg(test)]
mod testutil;

pub use error::{NetError, Result};
pub use kernel::Kernel;
pub use mbuf::MBuf;
pub use net::{NetConfig, NetStack, SockAddr, Socket};
