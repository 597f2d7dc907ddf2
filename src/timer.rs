//! one-shot protocol timers driven by the kernel's clock interrupt.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use log::trace;

use crate::{net::NetStack, spinlock::SpinLock};

type Handler = Box<dyn FnOnce(&NetStack) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

struct Timer {
    id: TimerId,
    expires: u64,
    handler: Handler,
}

pub struct Timers {
    next_id: AtomicU64,
    list: SpinLock<Vec<Timer>>,
}

impl Timers {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            list: SpinLock::new(Vec::new(), "timers"),
        }
    }

    /// arranges for `handler` to run once `expire` ticks after `now`.
    /// Returns None if the deadline does not fit the clock.
    pub fn add<F>(&self, now: u64, expire: u64, handler: F) -> Option<TimerId>
    where
        F: FnOnce(&NetStack) + Send + 'static,
    {
        let expires = now.checked_add(expire)?;
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.list.lock().push(Timer {
            id,
            expires,
            handler: Box::new(handler),
        });
        Some(id)
    }

    /// drops a timer that has not fired yet.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut list = self.list.lock();
        match list.iter().position(|t| t.id == id) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.list.lock().len()
    }

    /// runs every timer due at `now`. Handlers run without the list lock held, so they may
    /// add new timers.
    pub fn run_expired(&self, stack: &NetStack, now: u64) {
        let due: Vec<Timer> = {
            let mut list = self.list.lock();
            let mut due = Vec::new();
            let mut i = 0;
            while i < list.len() {
                if list[i].expires <= now {
                    due.push(list.remove(i));
                } else {
                    i += 1;
                }
            }
            due
        };

        for timer in due {
            trace!("timer {:?} fired at {}", timer.id, now);
            (timer.handler)(stack);
        }
    }
}
