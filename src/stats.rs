//! Get-and-reset counters for playback statistics.
//!
//! Counters are written by whichever thread owns the operation they count and
//! read by statistics pollers. The snapshot is approximate by design: a
//! concurrent increment may land on either side of the reset.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the current value, zeroing it when `reset` is set.
    pub fn get(&self, reset: bool) -> u64 {
        if reset {
            self.0.swap(0, Ordering::Relaxed)
        } else {
            self.0.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_reset() {
        let c = Counter::new();
        c.incr();
        c.incr();
        c.add(3);
        assert_eq!(c.get(false), 5);
        assert_eq!(c.get(true), 5);
        assert_eq!(c.get(false), 0);
    }
}
