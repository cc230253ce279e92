//! Coarse mutual exclusion between merges and local writes.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct ExchangeLock {
    busy: Mutex<bool>,
    released: Condvar,
}

impl ExchangeLock {
    /// Block until the flag can be flipped from false to true.
    pub(crate) fn acquire(self: &Arc<Self>) -> ExchangeGuard {
        let mut busy = self.busy.lock();
        while *busy {
            self.released.wait(&mut busy);
        }
        *busy = true;
        ExchangeGuard { lock: self.clone() }
    }

    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<ExchangeGuard> {
        let mut busy = self.busy.lock();
        if *busy {
            return None;
        }
        *busy = true;
        Some(ExchangeGuard { lock: self.clone() })
    }

    pub(crate) fn is_held(&self) -> bool {
        *self.busy.lock()
    }

    fn release(&self) {
        *self.busy.lock() = false;
        self.released.notify_one();
    }
}

/// Proof that the holder owns the repository's exchange lock.
/// The lock is released when the guard is dropped.
#[must_use = "the exchange lock is released as soon as the guard is dropped"]
pub struct ExchangeGuard {
    lock: Arc<ExchangeLock>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl std::fmt::Debug for ExchangeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExchangeGuard")
    }
}
