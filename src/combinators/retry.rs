//! Retry combinator (spec §4.6): a fixed `retry_delay` between attempts —
//! deliberately not exponential backoff, see `SPEC_FULL.md` — for up to
//! `1 + max_retries` total attempts before surfacing `RetryExhausted`.

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::step::{ArcStep, Step};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

type ShouldRetry = Arc<dyn Fn(&EngineError) -> bool + Send + Sync>;

pub struct Retry {
    name: String,
    description: String,
    step: ArcStep,
    max_retries: u32,
    retry_delay: Duration,
    /// Defaults to "retry any error" (spec §4.6) when unset.
    should_retry: Option<ShouldRetry>,
}

impl Retry {
    pub fn new(name: impl Into<String>, step: ArcStep, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            step,
            max_retries,
            retry_delay,
            should_retry: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Override which errors are worth retrying. Unset means every error is
    /// retried (spec §4.6's default).
    pub fn with_should_retry(mut self, predicate: impl Fn(&EngineError) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    fn retry_worthy(&self, error: &EngineError) -> bool {
        self.should_retry.as_ref().is_none_or(|p| p(error))
    }
}

#[async_trait]
impl Step for Retry {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let total_attempts = 1 + self.max_retries;
        let mut last_error = None;

        for attempt in 1..=total_attempts {
            if ctx.is_cancelled() {
                return Err(ctx.cancellation_error());
            }

            match self.step.run(ctx).await {
                Ok(()) => return Ok(()),
                Err(e) if !self.retry_worthy(&e) => {
                    tracing::warn!(step = self.step.name(), error = %e, "step failed with a non-retryable error");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        step = self.step.name(),
                        attempt,
                        total_attempts,
                        error = %e,
                        "step attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < total_attempts {
                        tokio::select! {
                            _ = tokio::time::sleep(self.retry_delay) => {}
                            _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
                        }
                    }
                }
            }
        }

        Err(EngineError::RetryExhausted {
            attempts: total_attempts,
            last_error: Box::new(last_error.unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::step::step_fn;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("flow", Arc::new(EngineConfig::default()), None)
    }

    #[tokio::test]
    async fn succeeds_on_a_later_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let step = step_fn("flaky", move |_ctx| {
            let attempts2 = attempts2.clone();
            async move {
                let n = attempts2.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(EngineError::network("transient"))
                } else {
                    Ok(())
                }
            }
        });
        let retry = Retry::new("retry", step, 2, Duration::from_millis(1));
        retry.run(&ctx()).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_one_plus_max_retries_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let step = step_fn("always_fails", move |_ctx| {
            let attempts2 = attempts2.clone();
            async move {
                attempts2.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::network("down"))
            }
        });
        let retry = Retry::new("retry", step, 2, Duration::from_millis(1));
        let err = retry.run(&ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::RetryExhausted { attempts: 3, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn uses_fixed_delay_not_exponential_backoff() {
        let step = step_fn("always_fails", |_ctx| async move {
            Err(EngineError::network("down"))
        });
        let retry = Retry::new("retry", step, 2, Duration::from_millis(10));
        let start = Instant::now();
        let _ = retry.run(&ctx()).await;
        // Two inter-attempt delays of 10ms each; exponential backoff would
        // take noticeably longer (10ms + 20ms).
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn should_retry_false_returns_the_raw_error_without_exhausting_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let step = step_fn("validation_fails", move |_ctx| {
            let attempts2 = attempts2.clone();
            async move {
                attempts2.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::validation("bad input"))
            }
        });
        let retry = Retry::new("retry", step, 2, Duration::from_millis(1))
            .with_should_retry(|e| e.retryable());
        let err = retry.run(&ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::Typed { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
