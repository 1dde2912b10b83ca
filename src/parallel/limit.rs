//! Concurrency limits for parallel operations

use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;

/// Default number of operations allowed to run at once across the process
pub const DEFAULT_PARALLEL_LIMIT: usize = 64;

/// Counting semaphore
#[derive(Debug)]
pub struct Semaphore {
    available: Mutex<usize>,
    released: Condvar,
    capacity: usize,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            available: Mutex::new(capacity),
            released: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until a permit is free. The permit is returned when the guard drops.
    pub fn acquire(self: &Arc<Self>) -> Permit {
        let mut available = self.available.lock();
        while *available == 0 {
            self.released.wait(&mut available);
        }
        *available -= 1;
        Permit {
            semaphore: Arc::clone(self),
        }
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut available = self.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(Permit {
            semaphore: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut available = self.available.lock();
        *available += 1;
        self.released.notify_one();
    }
}

/// A held semaphore permit
#[derive(Debug)]
pub struct Permit {
    semaphore: Arc<Semaphore>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Limit shared by every parallel run in the process.
///
/// Re-setting the limit installs a fresh semaphore; permits already handed
/// out keep referring to the old one.
#[derive(Debug)]
pub struct GlobalLimit {
    limiter: RwLock<Arc<Semaphore>>,
}

impl GlobalLimit {
    pub fn new(value: usize) -> Self {
        Self {
            limiter: RwLock::new(Arc::new(Semaphore::new(value))),
        }
    }

    /// Replace the limiter. `None` restores the default.
    pub fn set(&self, value: Option<usize>) {
        let value = value.unwrap_or(DEFAULT_PARALLEL_LIMIT);
        tracing::debug!(limit = value, "Setting global parallel limit");
        *self.limiter.write() = Arc::new(Semaphore::new(value));
    }

    pub fn current(&self) -> Arc<Semaphore> {
        Arc::clone(&self.limiter.read())
    }

    pub fn value(&self) -> usize {
        self.limiter.read().capacity()
    }
}

impl Default for GlobalLimit {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLEL_LIMIT)
    }
}

/// Limit local to a single run; unlimited unless a value is given
#[derive(Debug, Clone, Default)]
pub struct LocalLimit(Option<Arc<Semaphore>>);

impl LocalLimit {
    pub fn new(limit: Option<usize>) -> Self {
        Self(limit.map(|n| Arc::new(Semaphore::new(n))))
    }

    pub fn acquire(&self) -> Option<Permit> {
        self.0.as_ref().map(|semaphore| semaphore.acquire())
    }
}
