//! Counting semaphore used to park work pool threads

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            permits: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    fn permits(&self) -> MutexGuard<'_, usize> {
        // Permit counts stay consistent even if a holder panicked
        self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a permit is available and takes it
    pub fn lock(&self) {
        let mut permits = self.permits();
        // Spurious wakeups loop back without consuming anything
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    pub fn try_lock(&self) -> bool {
        let mut permits = self.permits();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn unlock(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut permits = self.permits();
        *permits += count;
        drop(permits);

        if count == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }

    /// Takes a permit, waiting at most `timeout`. Returns false on timeout.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let permits = self.permits();
        let (mut permits, result) = self
            .available
            .wait_timeout_while(permits, timeout, |p| *p == 0)
            .unwrap_or_else(PoisonError::into_inner);

        if result.timed_out() && *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Drains every permit currently available.
    ///
    /// Only meaningful once producers have stopped posting.
    pub fn reset(&self) {
        while self.try_lock() {}
    }

    pub fn available(&self) -> usize {
        *self.permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn unlock_releases_blocked_threads() {
        let sem = Arc::new(Semaphore::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sem = sem.clone();
                thread::spawn(move || sem.lock())
            })
            .collect();

        sem.unlock(4);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn timed_wait_expires_without_permits() {
        let sem = Semaphore::new(0);
        assert!(!sem.timed_wait(Duration::from_millis(10)));
        sem.unlock(1);
        assert!(sem.timed_wait(Duration::from_millis(10)));
    }

    #[test]
    fn reset_drains_permits() {
        let sem = Semaphore::new(3);
        assert!(sem.try_lock());
        sem.reset();
        assert!(!sem.try_lock());
    }
}
