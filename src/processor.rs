//! Bounded-concurrency job runner with deadline-based retry.
//!
//! Jobs are queued with [`JobProcessor::add`] and executed by
//! [`JobProcessor::run`] on a fixed-size pool gated by a semaphore. Each job
//! carries its own retry deadline: retryable failures are retried with
//! exponential backoff and jitter until the job's wall-clock budget (counted
//! from its first attempt) runs out, while non-retryable failures end the
//! job immediately. The first permanent failure in submission order is
//! reported after every job has reached a terminal state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UpdateError;

/// Base delay for the first retry (1 second).
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Maximum backoff delay cap (32 seconds).
const MAX_DELAY: Duration = Duration::from_secs(32);

/// Multiplier applied to the delay each attempt.
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Maximum jitter added to each delay (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

type JobFuture = BoxFuture<'static, Result<(), UpdateError>>;
type JobFn = Box<dyn Fn() -> JobFuture + Send + Sync>;

struct Job {
    edition_id: String,
    run: JobFn,
}

/// Exponential backoff between retry attempts.
///
/// Delay formula: `min(base * multiplier^(attempt - 1), max) + jitter`.
/// Jitter spreads simultaneous retries apart so jobs that failed together
/// do not hammer the service together.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
            multiplier: BACKOFF_MULTIPLIER,
            max_jitter: MAX_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy with custom delays.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
            max_jitter: MAX_JITTER,
        }
    }

    /// Delay before the retry following failed attempt number `attempt`
    /// (1-indexed).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = self.base_delay.as_millis() as f64 * self.multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=max))
    }
}

/// Runs queued jobs on a fixed-size worker pool with per-job retry budgets.
pub struct JobProcessor {
    jobs: Vec<Job>,
    parallelism: usize,
    retry_for: Duration,
    policy: BackoffPolicy,
}

impl JobProcessor {
    /// Creates a processor with `parallelism` workers and a per-job retry
    /// budget of `retry_for`. A budget of zero disables retries.
    #[must_use]
    pub fn new(parallelism: usize, retry_for: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            parallelism: parallelism.max(1),
            retry_for,
            policy: BackoffPolicy::default(),
        }
    }

    /// Replaces the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Queues a job for `edition_id`. The closure is invoked once per
    /// attempt, so it must be re-runnable.
    pub fn add<F, Fut>(&mut self, edition_id: impl Into<String>, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), UpdateError>> + Send + 'static,
    {
        self.jobs.push(Job {
            edition_id: edition_id.into(),
            run: Box::new(move || -> JobFuture { Box::pin(job()) }),
        });
    }

    /// Number of jobs currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no jobs are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Runs every queued job to a terminal state.
    ///
    /// Workers pull jobs in submission order. A job's permanent failure does
    /// not cancel its siblings: their writes are independently durable, so
    /// they are allowed to finish. Cancelling `cancel` stops backoff sleeps
    /// and pending submissions promptly.
    ///
    /// # Errors
    ///
    /// Returns the first permanent failure in submission order, if any job
    /// failed.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), UpdateError> {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let job_count = self.jobs.len();
        let mut handles = Vec::with_capacity(job_count);
        let mut failures: Vec<(usize, UpdateError)> = Vec::new();

        debug!(jobs = job_count, parallelism = self.parallelism, "starting job processor");

        for (index, job) in self.jobs.drain(..).enumerate() {
            if cancel.is_cancelled() {
                failures.push((index, UpdateError::Cancelled));
                continue;
            }

            // Acquire the permit before spawning so jobs start in FIFO
            // submission order.
            let permit = tokio::select! {
                () = cancel.cancelled() => {
                    failures.push((index, UpdateError::Cancelled));
                    continue;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    let Ok(permit) = permit else {
                        // The semaphore is never closed.
                        failures.push((index, UpdateError::Cancelled));
                        continue;
                    };
                    permit
                }
            };

            let cancel = cancel.clone();
            let retry_for = self.retry_for;
            let policy = self.policy.clone();
            handles.push((
                index,
                tokio::spawn(async move {
                    let _permit = permit;
                    run_job_with_retry(&job, retry_for, &policy, &cancel).await
                }),
            ));
        }

        for (index, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => failures.push((index, error)),
                Err(join_error) => {
                    // Task panics are logged but do not take down the run.
                    warn!(error = %join_error, "update job panicked");
                }
            }
        }

        failures.sort_by_key(|(index, _)| *index);
        match failures.into_iter().next() {
            Some((_, error)) => Err(error),
            None => Ok(()),
        }
    }
}

/// Runs one job, retrying retryable failures until the budget is spent.
///
/// The deadline is wall-clock time since this job's first attempt; a retry
/// whose backoff delay would land past the budget is not scheduled. The
/// final error is wrapped with the edition id and attempt count.
async fn run_job_with_retry(
    job: &Job,
    retry_for: Duration,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
) -> Result<(), UpdateError> {
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        debug!(edition_id = %job.edition_id, attempt, "starting update attempt");

        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                return Err(UpdateError::job_failed(
                    &job.edition_id,
                    attempt,
                    UpdateError::Cancelled,
                ));
            }
            outcome = (job.run)() => outcome,
        };

        let error = match outcome {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        if !error.is_retryable() {
            debug!(edition_id = %job.edition_id, error = %error, "failure is not retryable");
            return Err(UpdateError::job_failed(&job.edition_id, attempt, error));
        }

        let delay = policy.delay(attempt);
        if started.elapsed() + delay > retry_for {
            warn!(
                edition_id = %job.edition_id,
                attempt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %error,
                "retry budget exhausted"
            );
            return Err(UpdateError::job_failed(&job.edition_id, attempt, error));
        }

        info!(
            edition_id = %job.edition_id,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying update"
        );

        tokio::select! {
            () = cancel.cancelled() => {
                return Err(UpdateError::job_failed(
                    &job.edition_id,
                    attempt,
                    UpdateError::Cancelled,
                ));
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}
