use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};

/// The number of live connections (idle + in use), bounded by a resizable maximum.
pub(in crate::pool) struct PoolSize {
    size: AtomicU32,
    max_size: AtomicU32,
}

/// Capacity reserved by [`PoolSize::try_increase`]; released again unless committed.
pub(in crate::pool) struct IncreaseGuard<'a> {
    size: &'a PoolSize,
}

impl PoolSize {
    pub fn new(max_size: u32) -> Self {
        PoolSize {
            size: AtomicU32::new(0),
            max_size: AtomicU32::new(max_size),
        }
    }

    pub fn current(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub fn max(&self) -> u32 {
        self.max_size.load(Ordering::Acquire)
    }

    pub fn set_max(&self, max_size: u32) {
        self.max_size.store(max_size, Ordering::Release);
    }

    pub fn is_full(&self) -> bool {
        self.current() >= self.max()
    }

    pub fn is_over_max(&self) -> bool {
        self.current() > self.max()
    }

    pub fn try_increase(&self) -> Option<IncreaseGuard<'_>> {
        let mut size = self.current();

        // we want to stop at size == max_size
        while size < self.max() {
            match self.size.compare_exchange_weak(
                size,
                size + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(IncreaseGuard { size: self }),
                Err(actual) => size = actual,
            }
        }

        None
    }

    /// Releases the capacity held by one destroyed connection.
    pub fn decrease(&self) {
        // never wraps below zero, even if a destroy races a failed reservation
        let _ = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                size.checked_sub(1)
            });
    }
}

impl IncreaseGuard<'_> {
    /// Keeps the reserved capacity; it is now owned by a live connection.
    pub fn commit(self) {
        mem::forget(self);
    }
}

impl Drop for IncreaseGuard<'_> {
    fn drop(&mut self) {
        self.size.decrease();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn increase_stops_at_max() {
        let size = PoolSize::new(2);

        size.try_increase().expect("capacity available").commit();
        size.try_increase().expect("capacity available").commit();

        assert!(size.try_increase().is_none());
        assert_eq!(size.current(), 2);
        assert!(size.is_full());
    }

    #[test]
    fn dropped_guard_releases_capacity() {
        let size = PoolSize::new(1);

        {
            let _guard = size.try_increase();
            assert_eq!(size.current(), 1);
        }

        assert_eq!(size.current(), 0);
    }

    #[test]
    fn decrease_saturates_at_zero() {
        let size = PoolSize::new(1);
        size.decrease();
        assert_eq!(size.current(), 0);
    }

    #[test]
    fn shrinking_max_reports_overflow() {
        let size = PoolSize::new(3);
        for _ in 0..3 {
            size.try_increase().expect("capacity available").commit();
        }

        size.set_max(1);
        assert!(size.is_over_max());
        assert!(size.try_increase().is_none());
    }

    #[test]
    fn concurrent_increases_never_exceed_max() {
        let size = Arc::new(PoolSize::new(5));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let size = size.clone();
                thread::spawn(move || {
                    let mut won = 0;
                    for _ in 0..100 {
                        if let Some(guard) = size.try_increase() {
                            guard.commit();
                            won += 1;
                        }
                    }
                    won
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(total, 5);
        assert_eq!(size.current(), 5);
    }
}
