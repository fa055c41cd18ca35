//! Free list of recycled protocol sessions.
//!
//! Like the worker buffer pool it reuses objects instead of reallocating
//! them, but it is shared by every worker thread, so the free list sits
//! behind a mutex.

use std::sync::{Mutex, PoisonError};

/// Bounded pool of idle session objects.
pub struct HandlerPool<T> {
    free: Mutex<Vec<T>>,
    /// Maximum number of idle objects kept; extras are dropped.
    max_idle: usize,
}

impl<T> HandlerPool<T> {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            max_idle,
        }
    }

    /// Take an idle object, or build one with `make` if none is pooled.
    pub fn acquire(&self, make: impl FnOnce() -> T) -> T {
        let pooled = self.lock().pop();
        pooled.unwrap_or_else(make)
    }

    /// Return an object. Callers must reset its state first.
    ///
    /// Returns `false` if the pool was full and the object was dropped.
    pub fn release(&self, item: T) -> bool {
        let mut free = self.lock();
        if free.len() >= self.max_idle {
            return false;
        }
        free.push(item);
        true
    }

    /// Number of idle objects.
    #[cfg(test)]
    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_reuses_released() {
        let pool = HandlerPool::new(2);
        let mut built = 0;

        let a = pool.acquire(|| {
            built += 1;
            vec![1u8]
        });
        assert!(pool.release(a));
        assert_eq!(pool.idle(), 1);

        let b = pool.acquire(|| {
            built += 1;
            Vec::new()
        });
        assert_eq!(b, vec![1u8]);
        assert_eq!(built, 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_release_beyond_capacity_drops() {
        let pool = HandlerPool::new(1);
        assert!(pool.release(1));
        assert!(!pool.release(2));
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.acquire(|| 0), 1);
    }
}
