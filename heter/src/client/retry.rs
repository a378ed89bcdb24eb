use std::time::Duration;

use rand::Rng;

/// How hard a client tries to get a request through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt, a request is tried at most `max_retries + 1` times.
    pub max_retries: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first failure.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// The delay before retry number `retry`, counting from 1.
    ///
    /// The delay doubles on every retry up to `max_backoff`, the upper half of it is
    /// randomized so that clients failing together don't retry together.
    pub fn backoff(&self, retry: usize) -> Duration {
        let exp = u32::try_from(retry.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
        let capped = self
            .base_backoff
            .saturating_mul(1 << exp)
            .min(self.max_backoff);

        let half = capped / 2;
        let jitter = rand::rng().random_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(1),
        };

        for _ in 0..32 {
            let first = policy.backoff(1);
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));

            let second = policy.backoff(2);
            assert!(second >= Duration::from_millis(100) && second <= Duration::from_millis(200));

            let late = policy.backoff(30);
            assert!(late >= Duration::from_millis(250) && late <= Duration::from_millis(500));
        }
    }
}
