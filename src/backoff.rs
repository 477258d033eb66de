//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reconnect timing and attempt budget.
///
/// Delay for 0-indexed attempt `n` is `min(base * 2^n, cap) + jitter`, with
/// jitter drawn uniformly from `0..=max_jitter_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
    /// Automatic attempts before the connection is declared offline.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
            max_jitter_ms: 1_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Deterministic part of the delay for `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delay including random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_jitter_ms)
        };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }

    /// True once `attempts` automatic retries have been used up.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
