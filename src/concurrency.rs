//! Concurrency primitives for bounding insert parallelism.

use crate::{Result, TidemarkError};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counting semaphore with timed acquisition. Permits are returned through
/// the guard's drop.
pub struct Semaphore {
    available: Mutex<usize>,
    released: Condvar,
    capacity: usize,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        let capacity = permits.max(1);
        Self {
            available: Mutex::new(capacity),
            released: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_permits(&self) -> usize {
        *self.available.lock()
    }

    /// Acquires one permit, waiting up to `timeout`.
    pub fn try_acquire_for(&self, timeout: Duration) -> Result<SemaphoreGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut available = self.available.lock();

        loop {
            if *available > 0 {
                *available -= 1;
                return Ok(SemaphoreGuard { semaphore: self });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timeout_error(timeout));
            }
            if self.released.wait_for(&mut available, remaining).timed_out() && *available == 0 {
                return Err(self.timeout_error(timeout));
            }
        }
    }

    /// Acquires every permit, draining all concurrent holders within the
    /// timeout. Used to quiesce writers at close.
    pub fn acquire_all(&self, timeout: Duration) -> Result<Vec<SemaphoreGuard<'_>>> {
        let deadline = Instant::now() + timeout;
        let mut guards = Vec::with_capacity(self.capacity);
        for _ in 0..self.capacity {
            let remaining = deadline.saturating_duration_since(Instant::now());
            guards.push(self.try_acquire_for(remaining)?);
        }
        Ok(guards)
    }

    fn release(&self) {
        let mut available = self.available.lock();
        *available += 1;
        self.released.notify_one();
    }

    fn timeout_error(&self, timeout: Duration) -> TidemarkError {
        TidemarkError::WriteTimeout {
            timeout_ms: timeout.as_millis() as u64,
            workers: self.capacity,
        }
    }
}

/// Holds one semaphore permit for its lifetime.
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn permits_are_counted_and_returned() {
        let semaphore = Semaphore::new(2);
        let first = semaphore.try_acquire_for(Duration::ZERO).unwrap();
        let _second = semaphore.try_acquire_for(Duration::ZERO).unwrap();
        assert_eq!(semaphore.available_permits(), 0);

        assert!(matches!(
            semaphore.try_acquire_for(Duration::from_millis(10)),
            Err(TidemarkError::WriteTimeout { .. })
        ));

        drop(first);
        assert_eq!(semaphore.available_permits(), 1);
        let _third = semaphore.try_acquire_for(Duration::ZERO).unwrap();
    }

    #[test]
    fn waiter_is_woken_by_release() {
        let semaphore = Arc::new(Semaphore::new(1));
        let guard = semaphore.try_acquire_for(Duration::ZERO).unwrap();

        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            thread::spawn(move || {
                semaphore
                    .try_acquire_for(Duration::from_secs(5))
                    .map(|_| ())
            })
        };

        thread::sleep(Duration::from_millis(20));
        drop(guard);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn acquire_all_times_out_while_a_permit_is_held() {
        let semaphore = Semaphore::new(2);
        let _held = semaphore.try_acquire_for(Duration::ZERO).unwrap();

        assert!(matches!(
            semaphore.acquire_all(Duration::from_millis(20)),
            Err(TidemarkError::WriteTimeout { .. })
        ));
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let semaphore = Semaphore::new(0);
        assert_eq!(semaphore.capacity(), 1);
        let _guard = semaphore.try_acquire_for(Duration::ZERO).unwrap();
    }
}
