//! Runtime configuration read from `KESTREL_*` environment variables.

use std::time::Duration;

/// Capped exponential backoff: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// `None` retries for as long as the caller awaits.
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_secs(1), max: Duration::from_secs(30), max_attempts: None }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max, max_attempts: None } }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Same as [`Backoff::delay`], scaled by `jitter` in `[0.0, 1.0)` to ±25%
    /// and never above `max`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let capped = self.delay(attempt).as_secs_f64();
        let factor = 0.75 + 0.5 * jitter.clamp(0.0, 1.0);
        Duration::from_secs_f64(capped * factor).min(self.max)
    }

    pub fn exhausted(&self, attempt: u32) -> bool { self.max_attempts.map(|m| attempt >= m).unwrap_or(false) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Transport retry policy for transient failures.
    pub retry: Backoff,
    /// Watch reconnection policy.
    pub watch: Backoff,
    /// Capacity of each store's change broadcast.
    pub event_cap: usize,
    /// Server-side watch timeout; the stream is re-opened after it.
    pub watch_timeout_secs: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { retry: Backoff::default(), watch: Backoff::default(), event_cap: 2048, watch_timeout_secs: 290 }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let num = |k: &str| get(k).and_then(|s| s.trim().parse::<u64>().ok());
        let d = Self::default();
        let retry = Backoff {
            base: num("KESTREL_RETRY_BASE_MS").map(Duration::from_millis).unwrap_or(d.retry.base),
            max: num("KESTREL_RETRY_MAX_SECS").map(Duration::from_secs).unwrap_or(d.retry.max),
            max_attempts: num("KESTREL_RETRY_MAX_ATTEMPTS").map(|v| v.min(u64::from(u32::MAX)) as u32),
        };
        let watch = Backoff {
            base: retry.base,
            max: num("KESTREL_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.watch.max),
            max_attempts: None,
        };
        Self {
            retry,
            watch,
            event_cap: num("KESTREL_EVENT_CAP").map(|v| v.max(1) as usize).unwrap_or(d.event_cap),
            watch_timeout_secs: num("KESTREL_WATCH_TIMEOUT_SECS").map(|v| v.min(u64::from(u32::MAX)) as u32).unwrap_or(d.watch_timeout_secs),
        }
    }

    /// Millisecond-scale backoff for tests and demos.
    pub fn fast() -> Self {
        let b = Backoff::new(Duration::from_millis(5), Duration::from_millis(40));
        Self { retry: b.clone(), watch: b, ..Self::default() }
    }
}
