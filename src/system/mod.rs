//! Lock-free primitives shared across the daemon.

use std::sync::atomic::{AtomicU64, Ordering};

/// Wrapper around AtomicU64 for the hot `connections` counter (§5): callers
/// must never take a lock to read or mutate this.
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    pub fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// Saturating decrement: never underflows past zero even if called more
    /// times than `increment` (defensive against a mismatched guard).
    pub fn decrement(&self) -> u64 {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            })
            .unwrap_or(0)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrement_never_underflows() {
        let counter = AtomicCounter::new(0);
        counter.decrement();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn increment_then_decrement_round_trips() {
        let counter = AtomicCounter::new(0);
        counter.increment();
        counter.increment();
        counter.decrement();
        assert_eq!(counter.get(), 1);
    }
}
