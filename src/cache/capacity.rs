//! Capacity accounting for bounded tiers
//!
//! A store reserves its bytes here before the entry becomes visible, so
//! concurrent stores can never push `used` past `max`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free byte budget of one bounded tier
#[derive(Debug)]
pub struct CapacityLedger {
    max_bytes: u64,
    used_bytes: AtomicU64,
}

impl CapacityLedger {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            used_bytes: AtomicU64::new(0),
        }
    }

    /// Reserve `size` bytes if they fit; never overshoots `max_bytes`
    pub fn try_reserve(&self, size: u64) -> bool {
        self.used_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= self.max_bytes)
            })
            .is_ok()
    }

    /// Give back bytes of a removed entry or a failed store
    pub fn release(&self, size: u64) {
        let _ = self
            .used_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(size))
            });
    }

    pub fn reset(&self) {
        self.used_bytes.store(0, Ordering::Release);
    }

    #[inline]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn available_bytes(&self) -> u64 {
        self.max_bytes.saturating_sub(self.used_bytes())
    }

    /// Whether an object of this size could ever fit
    pub fn can_ever_fit(&self, size: u64) -> bool {
        size <= self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reserve_and_release() {
        let ledger = CapacityLedger::new(100);

        assert!(ledger.try_reserve(60));
        assert!(!ledger.try_reserve(41));
        assert!(ledger.try_reserve(40));
        assert_eq!(ledger.available_bytes(), 0);

        ledger.release(60);
        assert_eq!(ledger.used_bytes(), 40);

        // Never underflows
        ledger.release(1000);
        assert_eq!(ledger.used_bytes(), 0);
        assert!(!ledger.can_ever_fit(101));
    }

    #[test]
    fn test_concurrent_reservations_never_overshoot() {
        let ledger = Arc::new(CapacityLedger::new(1000));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || (0..100).filter(|_| ledger.try_reserve(7)).count())
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted as u64 * 7, ledger.used_bytes());
        assert!(ledger.used_bytes() <= 1000);
    }
}
