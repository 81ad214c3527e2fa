//! Step execution with bounded retry
//!
//! Drives one provider call for one step. Transient failures are retried
//! within a fixed budget using exponential backoff with jitter; non-transient
//! failures fail immediately. Retries never touch previously completed steps.
//! A cancellation flag or the step deadline aborts the in-flight call, which
//! the state machine folds back as a clean revert to pending.

use crate::config::RetryConfig;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmError, LlmProvider};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Why an execution was abandoned without a definitive result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Caller cancelled (e.g. operator navigated away)
    Requested,
    /// The step deadline elapsed across all attempts
    Timeout,
}

/// Definitive step failure: transient budget exhausted or non-transient error
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub attempts: u32,
    pub error: LlmError,
}

/// Result of executing one step
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Provider returned a response; `attempts` records how many calls it took
    Completed {
        response: CompletionResponse,
        attempts: u32,
    },
    /// Step and pipeline move to error
    Failed(StepFailure),
    /// Step reverts to pending; nothing is recorded
    Cancelled(CancelReason),
}

/// Executes single steps against a provider under a retry budget
#[derive(Debug, Clone)]
pub struct StepExecutor {
    retry: RetryConfig,
    step_timeout: Duration,
}

impl StepExecutor {
    pub fn new(retry: RetryConfig, step_timeout: Duration) -> Self {
        Self {
            retry,
            step_timeout,
        }
    }

    /// Run one step to a definitive outcome, observing the cancel flag and
    /// the step deadline between and during attempts.
    pub async fn execute(
        &self,
        request: CompletionRequest,
        provider: Arc<dyn LlmProvider>,
        cancel: &mut watch::Receiver<bool>,
    ) -> StepOutcome {
        let deadline = Instant::now() + self.step_timeout;

        if *cancel.borrow() {
            return StepOutcome::Cancelled(CancelReason::Requested);
        }

        let mut last_error = None;
        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                let delay = self.backoff_delay(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                if let Some(reason) = self.wait(delay, deadline, cancel).await {
                    return StepOutcome::Cancelled(reason);
                }
            }

            let call = provider.complete(request.clone());
            tokio::pin!(call);
            let result = tokio::select! {
                result = &mut call => result,
                _ = cancelled(cancel) => {
                    debug!(attempt, "Provider call cancelled by caller");
                    return StepOutcome::Cancelled(CancelReason::Requested);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(attempt, "Step deadline elapsed mid-call");
                    return StepOutcome::Cancelled(CancelReason::Timeout);
                }
            };

            match result {
                Ok(response) => {
                    debug!(attempt, model = %response.model, "Provider call succeeded");
                    return StepOutcome::Completed { response, attempts: attempt };
                }
                Err(error) => {
                    warn!(attempt, %error, transient = error.is_transient(), "Provider call failed");
                    if !error.is_transient() {
                        return StepOutcome::Failed(StepFailure {
                            attempts: attempt,
                            error,
                        });
                    }
                    last_error = Some(error);
                }
            }
        }

        StepOutcome::Failed(StepFailure {
            attempts: self.retry.max_attempts,
            error: last_error
                .unwrap_or_else(|| LlmError::Network("All retry attempts failed".to_string())),
        })
    }

    /// Backoff delay before retry `retry_number` (1-based), with jitter
    fn backoff_delay(&self, retry_number: u32) -> Duration {
        let base = self.retry.delay_for_attempt(retry_number);
        if !self.retry.jitter {
            return base;
        }
        // Up to +50% uniform jitter, still capped by max_delay_ms
        let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        Duration::from_millis(
            (base.as_millis() as u64 + extra).min(self.retry.max_delay_ms),
        )
    }

    /// Sleep for `delay`, returning early with a cancel reason if the flag is
    /// raised or the deadline passes first.
    async fn wait(
        &self,
        delay: Duration,
        deadline: Instant,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<CancelReason> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => None,
            _ = cancelled(cancel) => Some(CancelReason::Requested),
            _ = tokio::time::sleep_until(deadline) => Some(CancelReason::Timeout),
        }
    }
}

/// Resolves when cancellation is requested. A closed channel means no sender
/// can ever raise the flag, so the future pends forever rather than firing.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|&c| c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
