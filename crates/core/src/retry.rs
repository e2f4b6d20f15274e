use std::{fmt::Display, future::Future, time::Duration};

/// Bounded exponential backoff shared by every backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Final result of a retried operation plus how many retries it took.
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    pub retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub async fn run<T, E, F, Fut>(&self, label: &str, op: F) -> Retried<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_notify(label, op, |_, _, _| {}).await
    }

    /// Like [`RetryPolicy::run`], calling `on_retry(attempt, delay, &error)`
    /// before each backoff sleep.
    pub async fn run_notify<T, E, F, Fut, N>(&self, label: &str, mut op: F, mut on_retry: N) -> Retried<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        N: FnMut(u32, Duration, &E),
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => {
                    return Retried {
                        result: Ok(value),
                        retries,
                    };
                }
                Err(e) if retries < self.max_retries => {
                    retries += 1;
                    let delay = self.delay_for(retries);
                    tracing::warn!(
                        operation = label,
                        attempt = retries,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    on_retry(retries, delay, &e);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    return Retried {
                        result: Err(e),
                        retries,
                    };
                }
            }
        }
    }
}
