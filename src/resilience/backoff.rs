//! Exponential backoff with optional jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetransmitConfig;

/// Calculate the delay before retry number `attempt` (1-based).
///
/// The delay is `base_ms * factor^(attempt - 1)`, capped at `max_ms`, plus a
/// random extra of up to `jitter_ratio` of that value.
pub fn calculate_backoff(attempt: u32, base_ms: u64, factor: u32, max_ms: u64, jitter_ratio: f64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let multiplier = u64::from(factor).saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(multiplier);
    let capped_delay = delay_ms.min(max_ms);

    let jitter_range = (capped_delay as f64 * jitter_ratio) as u64;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay.saturating_add(jitter))
}

/// Retransmission schedule derived from [`RetransmitConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetransmitPolicy {
    base_ms: u64,
    factor: u32,
    max_ms: u64,
    jitter_ratio: f64,
}

impl RetransmitPolicy {
    pub fn new(config: &RetransmitConfig) -> Self {
        Self {
            base_ms: config.base_delay_ms,
            factor: config.factor.max(1),
            max_ms: config.max_delay_ms,
            jitter_ratio: config.jitter_ratio,
        }
    }

    /// Delay before retransmission number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_ms, self.factor, self.max_ms, self.jitter_ratio)
    }
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        Self::new(&RetransmitConfig::default())
    }
}
