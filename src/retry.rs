use std::{
    fmt::Display,
    future::Future,
    time::Duration,
};
use tracing::warn;

/// Bounded retry with exponential backoff, shared by every check that guards against
/// transient RPC instability (chain id, contract code, allowance).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            multiplier: 2,
            max_backoff: Duration::from_secs(8),
        }
    }

    /// Right after a network switch the token contract often looks absent for a few
    /// seconds, so this one tolerates five retries.
    pub const fn contract_code_check() -> Self {
        Self::new(6, Duration::from_millis(500))
    }

    pub const fn chain_id_check() -> Self {
        Self::new(3, Duration::from_millis(250))
    }

    pub const fn allowance_check() -> Self {
        Self::new(4, Duration::from_millis(300))
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails with an error `is_transient` rejects, or the
    /// attempts run out. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        label: &str,
        is_transient: P,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && is_transient(&err) => {
                    let delay = self.backoff_for(attempt - 1);
                    warn!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        ?delay,
                        error = %err,
                        "transient failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::chain_id_check()
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use std::sync::atomic::{
        AtomicU32,
        Ordering,
    };

    #[test]
    fn backoff_for__doubles_and_caps() {
        let policy = RetryPolicy::contract_code_check();
        assert_eq!(policy.backoff_for(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(4000));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn run__retries_transient_errors_until_success() {
        // given
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::contract_code_check();

        // when
        let result: Result<u32, String> = policy
            .run("test", |_| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("flaky {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        // then
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run__gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::contract_code_check();

        let result: Result<(), String> = policy
            .run("test", |_| true, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("still down".to_string()) }
            })
            .await;

        assert_eq!(result, Err("still down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn run__does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::contract_code_check();

        let result: Result<(), String> = policy
            .run("test", |err: &String| err != "rejected", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("rejected".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
