// batch_ingestor/src/controller.rs
// Retry and backoff for partially failed batches.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::executor::RequestExecutor;
use crate::item::{Batch, BatchResult, FailureClass, ItemError, ItemOutcome};
use crate::limiter::ConcurrencyLimiter;

/// What to do with a batch after one send.
#[derive(Debug, Clone, PartialEq, Eq,)]
pub enum RetryDecision {
    /// Every outcome is final.
    Complete,
    /// Resend `sequences` after `backoff(retry)`.
    Retry { sequences: Vec<u64,>, retry: u32, },
    /// Retryable failures remain but no attempts are left.
    Exhausted { sequences: Vec<u64,>, },
}

/// Decides the next step from the outcomes of send number `attempt` (1-based).
pub fn classify(outcomes: &BatchResult, attempt: u32, policy: &RetryPolicy,) -> RetryDecision {
    let retryable: Vec<u64,> = outcomes
        .failures()
        .filter(|r| {
            r.outcome
                .error()
                .map(|e| e.class.is_retryable(),)
                .unwrap_or(false,)
        },)
        .map(|r| r.sequence,)
        .collect();

    if retryable.is_empty() {
        RetryDecision::Complete
    } else if attempt < policy.max_attempts {
        RetryDecision::Retry {
            sequences: retryable,
            retry:     attempt - 1,
        }
    } else {
        RetryDecision::Exhausted {
            sequences: retryable,
        }
    }
}

/// `base * 2^retry`, capped at `max_backoff`, without jitter.
pub fn backoff_delay(policy: &RetryPolicy, retry: u32,) -> Duration {
    let factor = 2u32.checked_pow(retry,).unwrap_or(u32::MAX,);
    policy
        .base_backoff
        .checked_mul(factor,)
        .unwrap_or(policy.max_backoff,)
        .min(policy.max_backoff,)
}

/// Shortens `delay` by a fraction in `[0, jitter]` taken from `sample` in `[0, 1)`.
pub fn apply_jitter(delay: Duration, jitter: f64, sample: f64,) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    delay.mul_f64(1.0 - jitter * sample.clamp(0.0, 1.0,),)
}

/// Delay before retry number `retry`, jittered when the policy asks for it.
pub fn backoff(policy: &RetryPolicy, retry: u32,) -> Duration {
    let delay = backoff_delay(policy, retry,);
    if policy.jitter > 0.0 {
        apply_jitter(delay, policy.jitter, rand::thread_rng().r#gen::<f64>(),)
    } else {
        delay
    }
}

/// A batch waiting to resend its failed items.
#[derive(Debug, Clone, Copy,)]
pub struct RetryState {
    /// Sends made so far.
    pub attempt:       u32,
    /// Earliest time the residual batch may be resubmitted.
    pub next_eligible: Instant,
}

/// Drives one logical flush of a batch through sends and retries until every item is final.
pub struct RetryController {
    executor: RequestExecutor,
    limiter:  Arc<ConcurrencyLimiter,>,
    policy:   RetryPolicy,
}

impl RetryController {
    pub fn new(executor: RequestExecutor, limiter: Arc<ConcurrencyLimiter,>, policy: RetryPolicy,) -> Self {
        Self {
            executor,
            limiter,
            policy,
        }
    }

    pub fn policy(&self,) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run(&self, batch: Batch,) -> BatchResult {
        let mut finished = BatchResult::empty();
        let mut state: Option<RetryState,> = None;
        let mut current = batch;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let round = self.send_once(&current, attempt,).await;

            match classify(&round, attempt, &self.policy,) {
                RetryDecision::Complete => {
                    if let Some(s,) = state {
                        info!("Batch settled after {} attempts", s.attempt + 1);
                    }
                    finished.merge(round,);
                    return finished;
                },
                RetryDecision::Exhausted { sequences, } => {
                    warn!(
                        "Giving up on {} items after {} attempts",
                        sequences.len(),
                        attempt
                    );
                    finished.merge(round,);
                    return finished;
                },
                RetryDecision::Retry { sequences, retry, } => {
                    let delay = backoff(&self.policy, retry,);
                    let retrying: BTreeSet<u64,> = sequences.iter().copied().collect();
                    let mut last_errors = BatchResult::empty();
                    for r in round {
                        if retrying.contains(&r.sequence,) {
                            last_errors.insert(r,);
                        } else {
                            finished.insert(r,);
                        }
                    }

                    let Some(residual,) = current.subset(&sequences,) else {
                        finished.merge(last_errors,);
                        return finished;
                    };

                    warn!(
                        "Retrying {} of {} items in {:?} (attempt {} of {})",
                        residual.len(),
                        current.len(),
                        delay,
                        attempt + 1,
                        self.policy.max_attempts
                    );
                    let waiting = RetryState {
                        attempt,
                        next_eligible: Instant::now() + delay,
                    };
                    state = Some(waiting,);

                    if self.limiter.is_closed() {
                        // Nowhere to resend: surface the last error for each item.
                        finished.merge(last_errors,);
                        return finished;
                    }

                    tokio::time::sleep_until(waiting.next_eligible,).await;
                    current = residual;
                },
            }
        }
    }

    async fn send_once(&self, batch: &Batch, attempt: u32,) -> BatchResult {
        let executor = self.executor.clone();
        let submitted = self
            .limiter
            .submit(batch.clone(), move |b| async move { executor.execute(b, attempt,).await },);

        let handle = match submitted {
            Ok(h,) => h,
            Err(e,) => {
                debug!("Limiter refused batch: {}", e);
                let error = ItemError::new(e.to_string(), None, FailureClass::Cancelled,);
                return BatchResult::uniform_error(batch, error, attempt - 1,);
            },
        };

        match handle.await {
            Ok(result,) => result,
            Err(e,) => {
                let error = ItemError::new(e.to_string(), None, FailureClass::Transient,);
                BatchResult::uniform_error(batch, error, attempt,)
            },
        }
    }
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_,>,) -> std::fmt::Result {
        f.debug_struct("RetryController",)
            .field("policy", &self.policy,)
            .finish()
    }
}

/// Counts outcomes by kind. Used for logging summaries.
pub fn summarize(result: &BatchResult,) -> (usize, usize,) {
    let ok = result
        .iter()
        .filter(|r| matches!(r.outcome, ItemOutcome::Success { .. }),)
        .count();
    (ok, result.len() - ok,)
}
