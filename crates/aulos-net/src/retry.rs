use std::future::Future;
use std::time::Instant;

use tokio::time::sleep;
use tracing::debug;

use crate::RetryPolicy;

/// Stateful retry runner.
///
/// Keeps the attempt counter across invocations so long-lived callers (the
/// orchestrator startup path, live manifest refresh) share one retry budget;
/// the counter resets after a quiet period of `policy.reset_delay`.
pub struct Retryer {
    policy: RetryPolicy,
    attempt: u32,
    last_failure: Option<Instant>,
}

impl Retryer {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last_failure: None,
        }
    }

    /// Run `op` until it succeeds or the retry budget is exhausted.
    ///
    /// `should_retry` classifies errors; errors it rejects short-circuit.
    /// `on_retry` observes each scheduled retry (error, attempt number).
    /// `error_selector` maps the terminal error before it is returned,
    /// letting callers wrap budget exhaustion in their own taxonomy.
    pub async fn run<T, E, F, Fut>(
        &mut self,
        mut op: F,
        should_retry: impl Fn(&E) -> bool,
        mut on_retry: impl FnMut(&E, u32),
        error_selector: impl Fn(E, u32) -> E,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            match op().await {
                Ok(value) => {
                    self.attempt = 0;
                    self.last_failure = None;
                    return Ok(value);
                }
                Err(error) => {
                    self.note_failure();
                    if !should_retry(&error) || self.attempt > self.policy.total_retry {
                        return Err(error_selector(error, self.attempt));
                    }
                    on_retry(&error, self.attempt);
                    let delay = self.policy.dithered_delay_for_attempt(self.attempt);
                    debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    sleep(delay).await;
                }
            }
        }
    }

    /// Record a failure, resetting the counter first if the previous one is
    /// older than `reset_delay`.
    fn note_failure(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_failure {
            if now.duration_since(last) >= self.policy.reset_delay {
                self.attempt = 0;
            }
        }
        self.attempt += 1;
        self.last_failure = Some(now);
    }
}

/// One-shot convenience wrapper around [`Retryer`].
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    op: F,
    should_retry: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    Retryer::new(policy.clone())
        .run(op, should_retry, |_, _| {}, |e, _| e)
        .await
}
