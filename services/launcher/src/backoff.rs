//! Retry back-off for process starts.

use std::time::Duration;

use rand::Rng;

/// Exponential back-off with symmetric jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound before jitter.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(2),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let offset = if jitter > 0.0 {
            rand::rng().random_range(-1.0..=1.0) * delay * jitter
        } else {
            0.0
        };

        Duration::from_millis((delay + offset).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(base_ms: u64, max_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_doubles_until_capped() {
        let policy = exact(100, 1_000);
        let delays: Vec<_> = (0..6).map(|a| policy.delay(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = BackoffPolicy {
            jitter: 0.5,
            ..exact(400, 10_000)
        };
        for _ in 0..100 {
            let ms = policy.delay(0).as_millis();
            assert!((200..=600).contains(&ms), "{ms}");
        }
    }

    #[test]
    fn test_large_attempts_do_not_overflow() {
        assert_eq!(exact(100, 5_000).delay(u32::MAX), Duration::from_secs(5));
    }
}
