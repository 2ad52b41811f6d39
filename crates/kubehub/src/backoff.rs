//! Jittered delays on top of [`kestrel_core::Backoff`].

use std::time::Duration;

use kestrel_core::Backoff;
use uuid::Uuid;

/// Uniform sample in `[0.0, 1.0)` from a v4 UUID's low 53 bits.
pub fn jitter_unit() -> f64 {
    let bits = (Uuid::new_v4().as_u128() & ((1u128 << 53) - 1)) as u64;
    bits as f64 / (1u64 << 53) as f64
}

/// Delay before retry `attempt` with ±25% jitter, capped at `backoff.max`.
pub fn jittered(backoff: &Backoff, attempt: u32) -> Duration { backoff.delay_with_jitter(attempt, jitter_unit()) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_unit_in_range() {
        for _ in 0..256 {
            let j = jitter_unit();
            assert!((0.0..1.0).contains(&j));
        }
    }

    #[test]
    fn jittered_delay_bounded_by_cap() {
        let b = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        for attempt in 0..20 {
            let d = jittered(&b, attempt);
            assert!(d <= b.max, "attempt {attempt}: {d:?}");
            assert!(d >= Duration::from_millis(750));
        }
    }
}
