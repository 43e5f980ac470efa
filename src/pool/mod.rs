// Object state pool
// Bounded stack of pre-constructed connection states, recycled across checkouts

use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// States that can be reset to a fresh checkout
pub trait Reinitialize {
    fn reinitialize(&self);
}

/// Pool of reusable connection states
///
/// An instance is either on the stack or held by exactly one owner. Releasing
/// an instance that is already pooled is ignored, so a redundant close can
/// never hand the same state to two connections.
pub struct ObjectStatePool<T: Reinitialize> {
    /// Label used in logs and errors
    kind: &'static str,

    /// Available instances
    stack: Mutex<Vec<Arc<T>>>,

    /// Number of instances created up front
    capacity: usize,

    /// Releases that were rejected as duplicates
    duplicate_releases: AtomicU64,
}

impl<T: Reinitialize> ObjectStatePool<T> {
    /// Create a pool pre-filled with `capacity` instances
    pub fn with_capacity<F>(kind: &'static str, capacity: usize, mut factory: F) -> Self
    where
        F: FnMut() -> T,
    {
        let stack = (0..capacity).map(|_| Arc::new(factory())).collect();
        debug!(kind = kind, capacity = capacity, "State pool pre-filled");

        Self {
            kind,
            stack: Mutex::new(stack),
            capacity,
            duplicate_releases: AtomicU64::new(0),
        }
    }

    /// Pop and reinitialize an instance
    pub fn acquire(&self) -> Result<Arc<T>> {
        let instance = self
            .stack
            .lock()
            .pop()
            .ok_or(EngineError::PoolEmpty(self.kind))?;
        instance.reinitialize();
        Ok(instance)
    }

    /// Push an instance back unless it is already pooled
    pub fn release(&self, instance: Arc<T>) {
        let mut stack = self.stack.lock();

        if stack.iter().any(|pooled| Arc::ptr_eq(pooled, &instance)) {
            self.duplicate_releases.fetch_add(1, Ordering::Relaxed);
            warn!(kind = self.kind, "Ignoring duplicate release of pooled state");
            return;
        }

        if stack.len() >= self.capacity {
            warn!(kind = self.kind, "Ignoring release into a full pool");
            return;
        }

        stack.push(instance);
    }

    /// Instances currently available
    pub fn available(&self) -> usize {
        self.stack.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn duplicate_releases(&self) -> u64 {
        self.duplicate_releases.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct Probe {
        resets: AtomicUsize,
        checked_out: AtomicBool,
    }

    impl Reinitialize for Probe {
        fn reinitialize(&self) {
            self.resets.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_acquire_reinitializes() {
        let pool = ObjectStatePool::with_capacity("probe", 1, Probe::default);
        let probe = pool.acquire().unwrap();
        assert_eq!(probe.resets.load(Ordering::Relaxed), 1);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_empty_pool_reports_exhaustion() {
        let pool = ObjectStatePool::with_capacity("probe", 1, Probe::default);
        let _held = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(EngineError::PoolEmpty("probe"))));
    }

    #[test]
    fn test_checked_out_instances_are_exclusive() {
        let pool = ObjectStatePool::with_capacity("probe", 3, Probe::default);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&b, &c));
        assert!(!Arc::ptr_eq(&a, &c));

        let a_ptr = Arc::as_ptr(&a);
        pool.release(a);
        let again = pool.acquire().unwrap();
        assert_eq!(Arc::as_ptr(&again), a_ptr);
    }

    #[test]
    fn test_double_release_is_ignored() {
        let pool = ObjectStatePool::with_capacity("probe", 2, Probe::default);
        let a = pool.acquire().unwrap();
        pool.release(a.clone());
        pool.release(a);

        assert_eq!(pool.available(), 2);
        assert_eq!(pool.duplicate_releases(), 1);

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_concurrent_checkout_never_shares() {
        let pool = Arc::new(ObjectStatePool::with_capacity("probe", 8, Probe::default));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        if let Ok(state) = pool.acquire() {
                            assert!(!state.checked_out.swap(true, Ordering::SeqCst));
                            state.checked_out.store(false, Ordering::SeqCst);
                            pool.release(state);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.available(), 8);
        assert_eq!(pool.duplicate_releases(), 0);
    }
}
