use core::{
    convert::TryFrom,
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use alloc::{boxed::Box, sync::Arc};

use crate::{
    kernel::Kernel,
    mbuf::MBuf,
    param::{LOCAL_IP_ADDR, LOCAL_MAC_ADDR, TCP_FIRST_ISS},
    timer::Timers,
};

mod arp;
mod checksum;
mod ethernet;
mod ip;
mod port;
mod socket;
pub(crate) mod tcp;
mod udp;

pub use checksum::in_cksum;
pub use ethernet::ETHERNET_MAC_ADDR_BROADCAST;
pub use socket::Socket;
pub use tcp::{TcpFlags, TcpState};

/// A fixed-layout wire header. All multi-byte fields travel most-significant byte first.
pub trait Header: Sized {
    const SIZE: usize;
    /// `b` is exactly `SIZE` bytes long.
    fn decode(b: &[u8]) -> Self;
    fn encode(&self, b: &mut [u8]);
}

// network byte order accessors used by the header codecs.

fn get_u16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

fn get_u32(b: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn put_u16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_u32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

/// dotted-quad formatting for log messages.
pub struct Ipv4(pub u32);

impl fmt::Display for Ipv4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0.to_be_bytes();
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

/// Addresses the stack answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetConfig {
    pub ip: u32,
    pub mac: [u8; 6],
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            ip: LOCAL_IP_ADDR,
            mac: LOCAL_MAC_ADDR,
        }
    }
}

/// The network stack: every socket, connection and timer of one interface.
pub struct NetStack {
    config: NetConfig,
    kernel: Arc<dyn Kernel>,
    pub(crate) tcp: tcp::Registry,
    pub(crate) udp: udp::Table,
    pub(crate) timers: Timers,
    iss: AtomicU32,
}

impl NetStack {
    pub fn new(config: NetConfig, kernel: Arc<dyn Kernel>) -> Arc<Self> {
        Arc::new(Self {
            config,
            kernel,
            tcp: tcp::Registry::new(),
            udp: udp::Table::new(),
            timers: Timers::new(),
            iss: AtomicU32::new(TCP_FIRST_ISS),
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub(crate) fn kernel(&self) -> &dyn Kernel {
        &*self.kernel
    }

    /// called by the NIC driver for every received frame.
    pub fn rx(&self, m: Box<MBuf>) {
        ethernet::rx(self, m);
    }

    /// called by the kernel on every timer interrupt; runs expired protocol timers.
    pub fn tick(&self) {
        self.timers.run_expired(self, self.kernel.ticks());
    }

    /// a fresh initial send sequence number.
    pub(crate) fn alloc_iss(&self) -> u32 {
        self.iss.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SAFamily {
    UNSPEC = 0,
    LOCAL = 1,
    INET = 2,
}

impl TryFrom<u16> for SAFamily {
    type Error = &'static str;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::UNSPEC),
            1 => Ok(Self::LOCAL),
            2 => Ok(Self::INET),
            _ => Err("undefined address family"),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddr {
    pub family: SAFamily,
    pub port: u16,
    pub addr: u32,
}

impl SockAddr {
    pub fn inet(addr: u32, port: u16) -> Self {
        Self {
            family: SAFamily::INET,
            port,
            addr,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream = 1,
    Datagram = 2,
}

impl TryFrom<u8> for SocketType {
    type Error = &'static str;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Stream),
            2 => Ok(Self::Datagram),
            _ => Err("undefined socket type"),
        }
    }
}
