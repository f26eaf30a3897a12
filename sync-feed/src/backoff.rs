use rand::Rng;
use std::time::Duration;
use sync_core::config::RealtimeConfig;

/// Reconnect policy: `min(base * 2^attempt, max)` with a symmetric jitter band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay used as the jitter band, 0.25 = ±25%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(16000),
            jitter: 0.25,
        }
    }
}

impl From<&RealtimeConfig> for RetryConfig {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            ..Self::default()
        }
    }
}

impl RetryConfig {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match 2u32.checked_pow(attempt) {
            Some(factor) => self.base_delay.saturating_mul(factor),
            None => self.max_delay,
        };
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        self.jittered_delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn jittered_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay_for(attempt);
        let band = self.jitter.clamp(0.0, 0.99);
        if band == 0.0 {
            return delay;
        }
        delay.mul_f64(rng.gen_range((1.0 - band)..=(1.0 + band)))
    }
}
