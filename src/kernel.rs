//! Services the network stack borrows from the rest of the kernel.
//!
//! The stack itself never touches the scheduler, the clock or the NIC. A kernel hands an
//! implementation of [`Kernel`] to [`crate::net::NetStack::new`]; the e1000 driver's interrupt
//! handler feeds received frames to `NetStack::rx`, and the timer interrupt calls
//! `NetStack::tick`.

use alloc::boxed::Box;

use crate::mbuf::MBuf;

pub trait Kernel: Send + Sync {
    /// monotonic clock, incremented by every timer interrupt.
    fn ticks(&self) -> u64;

    /// whether the calling process has been marked for termination.
    fn killed(&self) -> bool;

    /// parks the calling process on `chan` until `wakeup(chan)` or the next scheduling round.
    /// Callers always re-check their condition, so returning early is fine.
    fn sleep(&self, chan: usize);

    /// makes every process sleeping on `chan` runnable.
    fn wakeup(&self, chan: usize);

    /// hands a complete ethernet frame to the device. The mbuf is consumed either way.
    fn transmit(&self, m: Box<MBuf>) -> Result<(), &'static str>;
}
