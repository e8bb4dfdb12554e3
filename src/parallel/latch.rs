//! Resettable countdown latch joining split work

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct Latch {
    count: AtomicUsize,
    lock: Mutex<()>,
    zero: Condvar,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
            lock: Mutex::new(()),
            zero: Condvar::new(),
        }
    }

    /// Must not be called while threads are still waiting on the latch
    pub fn reset(&self, count: usize) {
        self.count.store(count, Ordering::Release);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Returns true when this call released the latch
    fn decrement(&self) -> bool {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "latch counted below zero");
        if previous == 1 {
            // Taking the lock orders the wakeup after any waiter's check
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.zero.notify_all();
            return true;
        }
        false
    }

    pub fn count_down(&self) {
        self.decrement();
    }

    pub fn wait(&self) {
        if self.count.load(Ordering::Acquire) == 0 {
            return;
        }
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.count.load(Ordering::Acquire) != 0 {
            guard = self
                .zero
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn count_down_and_wait(&self) {
        if !self.decrement() {
            self.wait();
        }
    }
}
