//! Spinlocks protect data that is touched both by processes in system calls and by the receive
//! path running out of the e1000 interrupt handler.
//!
//! The lock is a smart pointer: the protected data is only reachable through the guard returned
//! by `lock()`, and dropping the guard releases the lock. The network stack never holds a
//! spinlock while it blocks; a process that has to wait for a connection to change hands its
//! guard to a [`WaitQueue`], which releases it, sleeps, and re-acquires it on wakeup.
//!
//! Lock order inside the stack: connection -> parent connection -> tcp registry -> udp table ->
//! udp receive queue. The timer list lock is never held while a handler runs.

use core::{
    cell::UnsafeCell,
    fmt,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{
    error::{NetError, Result},
    kernel::Kernel,
};

pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str, // for debugging
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            inner: &self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    fn acquire(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

impl<T: ?Sized> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("locked", &self.lock.load(Ordering::Relaxed))
            .finish()
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    inner: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// releases the lock but remembers which lock it was, so that it can be taken again.
    pub fn weak(self) -> SpinLockWeakGuard<'a, T> {
        SpinLockWeakGuard { inner: self.inner }
    }
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.inner.release();
    }
}

pub struct SpinLockWeakGuard<'a, T: ?Sized> {
    inner: &'a SpinLock<T>,
}

impl<'a, T: ?Sized> SpinLockWeakGuard<'a, T> {
    pub fn lock(self) -> SpinLockGuard<'a, T> {
        self.inner.lock()
    }
}

/// A condition variable for processes blocked on one connection.
///
/// Every `notify_all` bumps a generation counter. A waiter samples the counter while it still
/// holds the connection's lock, so a notification issued after the lock is dropped is never
/// lost even if it races with the waiter going to sleep.
pub struct WaitQueue {
    generation: AtomicUsize,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            generation: AtomicUsize::new(0),
        }
    }

    /// the sleep channel handed to the kernel: the queue's own address.
    fn chan(&self) -> usize {
        self as *const Self as usize
    }

    pub fn notify_all(&self, kernel: &dyn Kernel) {
        self.generation.fetch_add(1, Ordering::Release);
        kernel.wakeup(self.chan());
    }

    /// releases `guard`, sleeps until the next `notify_all` and takes the lock again.
    /// Fails with `Killed` (without the lock) if the process is marked for termination.
    pub fn wait<'a, T: ?Sized>(
        &self,
        guard: SpinLockGuard<'a, T>,
        kernel: &dyn Kernel,
    ) -> Result<SpinLockGuard<'a, T>> {
        let seen = self.generation.load(Ordering::Acquire);
        let weak = guard.weak();
        loop {
            if kernel.killed() {
                return Err(NetError::Killed);
            }
            if self.generation.load(Ordering::Acquire) != seen {
                break;
            }
            kernel.sleep(self.chan());
        }
        Ok(weak.lock())
    }
}
