/// Synchronization Primitives
///
/// The runtime's locking discipline is deliberately small: one mutex (the
/// airlock's) held for bounded time, with two counting semaphores governing
/// flow control. parking_lot supplies the mutex and condvar underneath.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A counting semaphore.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Semaphore {
        Semaphore { permits: Mutex::new(permits), available: Condvar::new() }
    }

    /// Blocks until a permit is available.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Takes a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Blocks until a permit is available or the timeout passes.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            self.available.wait_for(&mut permits, timeout);
        }
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_release() {
        let sem = Semaphore::new(1);
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert!(sem.try_acquire());
    }

    #[test]
    fn test_cross_thread_release() {
        let sem = Arc::new(Semaphore::new(0));
        let releaser = sem.clone();
        let handle = std::thread::spawn(move || releaser.release());
        sem.acquire();
        handle.join().unwrap();
    }

    #[test]
    fn test_acquire_timeout_expires() {
        let sem = Semaphore::new(0);
        assert!(!sem.acquire_timeout(Duration::from_millis(10)));
    }
}
