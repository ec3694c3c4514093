use rand::Rng;
use std::time::Duration;

/// Bounded retry with exponential backoff for single-object transfers.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the failed `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_delay_ms, self.max_delay_ms)
    }
}

/// Calculate exponential backoff delay with jitter.
///
/// Formula: `min(base_ms * 2^(attempt-1) + jitter, max_ms)` (0-25% jitter)
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exp_factor = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exp_factor);

    let jitter = if delay_ms > 0 {
        rand::rng().random_range(0..=delay_ms / 4)
    } else {
        0
    };

    Duration::from_millis(delay_ms.saturating_add(jitter).min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff_basic() {
        let d1 = calculate_backoff(1, 500, 60_000);
        assert!(d1.as_millis() >= 500 && d1.as_millis() <= 625);

        let d2 = calculate_backoff(2, 500, 60_000);
        assert!(d2.as_millis() >= 1000 && d2.as_millis() <= 1250);

        let d3 = calculate_backoff(3, 500, 60_000);
        assert!(d3.as_millis() >= 2000 && d3.as_millis() <= 2500);
    }

    #[test]
    fn test_calculate_backoff_respects_max() {
        let d = calculate_backoff(30, 10_000, 10_000);
        assert_eq!(d.as_millis(), 10_000);
    }

    #[test]
    fn test_calculate_backoff_zero_attempt() {
        assert_eq!(calculate_backoff(0, 1000, 60_000), Duration::ZERO);
    }

    #[test]
    fn test_zero_base_never_sleeps() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay_ms: 0,
            max_delay_ms: 0,
        };
        assert_eq!(policy.delay_after(2), Duration::ZERO);
    }
}
