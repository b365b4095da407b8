//! Process-wide unique, strictly increasing nanosecond timestamps.
//!
//! Entry identities and store touch stamps are both drawn from here, so two
//! values handed out by [`UniqueTimestamp::next`] never compare equal.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

static LAST_ISSUED: AtomicU64 = AtomicU64::new(0);

/// Generator for unique nanosecond timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueTimestamp;

impl UniqueTimestamp {
    /// Nanoseconds since the Unix epoch, bumped past the last issued value
    /// whenever the wall clock did not advance.
    #[must_use]
    pub fn next() -> u64 {
        let now = wall_clock_nanos();
        let mut last = LAST_ISSUED.load(Ordering::Relaxed);
        loop {
            let candidate = if now > last { now } else { last + 1 };
            match LAST_ISSUED.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}

fn wall_clock_nanos() -> u64 {
    // Out of i64 range only after the year 2262.
    Utc::now().timestamp_nanos_opt().map_or(0, |nanos| u64::try_from(nanos).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_strictly_increasing() {
        let mut previous = UniqueTimestamp::next();
        for _ in 0..10_000 {
            let current = UniqueTimestamp::next();
            assert!(current > previous);
            previous = current;
        }
    }

    #[test]
    fn test_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| (0..1_000).map(|_| UniqueTimestamp::next()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(seen.insert(value), "duplicate timestamp {value}");
            }
        }
        assert_eq!(seen.len(), 4_000);
    }
}
