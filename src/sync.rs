//! A bounded admission counter built on a mutex and a condition variable.
//!
//! [`Permits`] hands out at most `max` [`Permit`]s at a time; further callers of
//! [`Permits::acquire`] block until a permit is dropped. It bounds both the number of live
//! sessions and the number of running backups.
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct Counter {
    active: usize,
    peak: usize,
}

#[derive(Debug)]
struct Inner {
    max: usize,
    counter: Mutex<Counter>,
    changed: Condvar,
}

/// A counter of outstanding permits, bounded by `max`
#[derive(Debug, Clone)]
pub struct Permits {
    inner: Arc<Inner>,
}

impl Permits {
    /// creates a counter that allows `max` permits to be held at once
    pub fn new(max: usize) -> Self {
        Permits {
            inner: Arc::new(Inner {
                max,
                counter: Mutex::new(Counter { active: 0, peak: 0 }),
                changed: Condvar::new(),
            }),
        }
    }

    /// takes a permit, blocking while `max` permits are held
    pub fn acquire(&self) -> Permit {
        let mut counter = self.inner.counter.lock();
        while counter.active >= self.inner.max {
            self.inner.changed.wait(&mut counter);
        }
        self.grant(&mut counter)
    }

    /// takes a permit, giving up after `timeout` if `max` permits are still held
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<Permit> {
        let deadline = Instant::now() + timeout;
        let mut counter = self.inner.counter.lock();
        while counter.active >= self.inner.max {
            if self.inner.changed.wait_until(&mut counter, deadline).timed_out()
                && counter.active >= self.inner.max
            {
                return None;
            }
        }
        Some(self.grant(&mut counter))
    }

    /// takes a permit only if one is available right now
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut counter = self.inner.counter.lock();
        if counter.active >= self.inner.max {
            return None;
        }
        Some(self.grant(&mut counter))
    }

    fn grant(&self, counter: &mut Counter) -> Permit {
        counter.active += 1;
        counter.peak = counter.peak.max(counter.active);
        Permit {
            inner: Arc::clone(&self.inner),
        }
    }

    /// blocks until no permit is held
    pub fn wait_idle(&self) {
        let mut counter = self.inner.counter.lock();
        while counter.active > 0 {
            self.inner.changed.wait(&mut counter);
        }
    }

    /// Blocks until no permit is held or `timeout` elapses. Returns `true` if the counter is
    /// idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut counter = self.inner.counter.lock();
        while counter.active > 0 {
            if self.inner.changed.wait_until(&mut counter, deadline).timed_out() {
                return counter.active == 0;
            }
        }
        true
    }

    /// number of permits currently held
    pub fn active(&self) -> usize {
        self.inner.counter.lock().active
    }

    /// the largest number of permits that were ever held at the same time
    pub fn peak(&self) -> usize {
        self.inner.counter.lock().peak
    }

    /// the bound of this counter
    pub fn max(&self) -> usize {
        self.inner.max
    }
}

/// An admission ticket. Dropping it returns it to its [`Permits`].
#[derive(Debug)]
pub struct Permit {
    inner: Arc<Inner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut counter = self.inner.counter.lock();
        counter.active -= 1;
        // wakes both acquirers and wait_idle callers
        self.inner.changed.notify_all();
    }
}
