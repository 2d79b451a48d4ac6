use std::sync::atomic::{AtomicU64, Ordering};

/// Tag name carrying a message's logical clock value: `["lamport", "<u64>"]`.
pub const LAMPORT_TAG: &str = "lamport";

/// Largest value accepted from a remote message. Anything above it is treated
/// as if the tag were absent, which leaves `2^63` local ticks of headroom.
pub const MAX_OBSERVED: u64 = i64::MAX as u64;

/// Process-wide logical clock.
///
/// `now()` always returns a value strictly greater than anything it returned
/// before and anything accepted by `set()`. The stored value never wraps.
#[derive(Debug, Default)]
pub struct LamportClock {
    value: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value.min(MAX_OBSERVED)),
        }
    }

    /// Advance for a locally authored message and return the new value.
    ///
    /// Saturates at `u64::MAX` instead of wrapping.
    pub fn now(&self) -> u64 {
        match self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_add(1))
        {
            Ok(prev) => prev + 1,
            Err(stuck) => {
                tracing::error!(value = stuck, "lamport clock exhausted");
                stuck
            }
        }
    }

    /// Raise the clock to an observed remote value. Lower values are ignored,
    /// and so is anything above [`MAX_OBSERVED`]. Returns whether the value was
    /// accepted.
    pub fn set(&self, observed: u64) -> bool {
        if observed > MAX_OBSERVED {
            tracing::warn!(observed, "ignoring out of range lamport value");
            return false;
        }
        self.value.fetch_max(observed, Ordering::SeqCst);
        true
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_strictly_increasing() {
        let clock = LamportClock::new();
        let a = clock.now();
        let b = clock.now();
        let c = clock.now();
        assert!(a < b && b < c);
    }

    #[test]
    fn set_raises_but_never_lowers() {
        let clock = LamportClock::new();
        clock.set(41);
        assert_eq!(clock.now(), 42);

        clock.set(10);
        assert_eq!(clock.now(), 43);
    }

    #[test]
    fn now_exceeds_every_observed_value() {
        let clock = LamportClock::starting_at(5);
        let mut seen = vec![clock.now()];
        for observed in [3, 100, 7, 100, 250] {
            clock.set(observed);
            let next = clock.now();
            assert!(next > observed);
            assert!(seen.iter().all(|prev| next > *prev));
            seen.push(next);
        }
    }

    #[test]
    fn hostile_values_cannot_wrap_the_clock() {
        let clock = LamportClock::new();
        clock.set(500);
        assert!(!clock.set(u64::MAX));
        assert!(!clock.set(MAX_OBSERVED + 1));
        let a = clock.now();
        let b = clock.now();
        assert_eq!(a, 501);
        assert!(b > a);

        assert!(clock.set(MAX_OBSERVED));
        let c = clock.now();
        let d = clock.now();
        assert!(c > MAX_OBSERVED && d > c);
    }

    #[test]
    fn now_saturates_instead_of_wrapping() {
        let clock = LamportClock {
            value: AtomicU64::new(u64::MAX - 1),
        };
        assert_eq!(clock.now(), u64::MAX);
        assert_eq!(clock.now(), u64::MAX);
        assert_eq!(clock.current(), u64::MAX);
    }

    #[test]
    fn concurrent_now_never_repeats() {
        let clock = std::sync::Arc::new(LamportClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || (0..250).map(|_| clock.now()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }
}
