//! Retry and window policies: the tunable knobs of a session.
//!
//! Timeouts back off exponentially per consecutive miss:
//!   attempt 0: base timeout
//!   attempt n: base × multiplier^n, capped at `max_timeout`
//!
//! Credit is extended once the remaining window falls below
//! `window × low_water_ratio`, and always when it is exhausted.

use std::time::Duration;

use spool_core::config::TransferSettings;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub max_timeout: Duration,
}

impl RetryPolicy {
    /// Time to wait for the peer after `attempt` consecutive misses.
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let base = self.timeout.as_secs_f64();
        let cap = self.max_timeout.as_secs_f64().max(base);
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
        let scaled = (base * factor).min(cap);
        if scaled.is_finite() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max_timeout.max(self.timeout)
        }
    }

    /// True once `attempts` consecutive misses exceed the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts > self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&TransferSettings::default())
    }
}

impl From<&TransferSettings> for RetryPolicy {
    fn from(s: &TransferSettings) -> Self {
        Self {
            timeout: s.session_timeout(),
            max_retries: s.max_retries,
            backoff_multiplier: s.backoff_multiplier,
            max_timeout: s.max_backoff(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowPolicy {
    /// Credit granted per advertisement. Never zero.
    pub window_bytes: u32,
    pub max_chunk_size: u32,
    pub low_water_ratio: f64,
    /// Pacing requested from the transmitter.
    pub min_delay: Duration,
}

impl WindowPolicy {
    /// Whether a receiver with `remaining` bytes of credit left should
    /// extend its window.
    pub fn should_extend(&self, remaining: u64) -> bool {
        remaining == 0 || (remaining as f64) < f64::from(self.window_bytes) * self.low_water_ratio
    }
}

impl From<&TransferSettings> for WindowPolicy {
    fn from(s: &TransferSettings) -> Self {
        Self {
            window_bytes: s.window_bytes.max(1),
            max_chunk_size: s.effective_max_chunk_size().max(1),
            low_water_ratio: s.window_low_water_ratio,
            min_delay: s.min_delay(),
        }
    }
}

/// Everything a session needs to know about its local configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionParams {
    pub window: WindowPolicy,
    pub retry: RetryPolicy,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams::from(&TransferSettings::default())
    }
}

impl From<&TransferSettings> for SessionParams {
    fn from(s: &TransferSettings) -> Self {
        Self {
            window: WindowPolicy::from(s),
            retry: RetryPolicy::from(s),
        }
    }
}
