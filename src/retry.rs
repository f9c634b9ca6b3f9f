//! Retry decorator for any [`AutomatedJob`]
//!
//! A non-zero interval retries until the first `Completed` attempt. A zero
//! interval is a plain repeat: the wrapped job runs exactly `times` times.
//! Every attempt that does not end the loop early, the last one included, is
//! followed by the interval pause and the validation callback.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::RetryConfig;
use crate::context::JobContext;
use crate::job::{execute_guarded, panic_message, AutomatedJob, JobFailure, JobId, JobResult, JobStatus};
use crate::{AutoJobError, Result};

/// Fewest attempts a retry may be configured with
pub const MIN_RETRY: u32 = 2;

/// Verdict of a validation callback run between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validation {
    /// Keep retrying
    Valid,
    /// Abort with a validation failure
    NotValid,
}

type ValidationFn = dyn Fn(&JobContext) -> anyhow::Result<Validation> + Send + Sync;

/// Job re-invoking a wrapped job with interval and validation control
pub struct RetryJob {
    inner: Arc<dyn AutomatedJob>,
    times: u32,
    interval: Duration,
    validation: Option<Arc<ValidationFn>>,
    results: RwLock<Vec<JobResult>>,
    lock: Mutex<()>,
    run_gate: Mutex<()>,
}

impl RetryJob {
    /// Wrap `job`; fails with `OutOfRange` when `times` is below [`MIN_RETRY`]
    pub fn new(job: Arc<dyn AutomatedJob>, times: u32, interval: Duration) -> Result<Self> {
        if times < MIN_RETRY {
            return Err(AutoJobError::OutOfRange(format!(
                "times should always be greater than or equal to {}",
                MIN_RETRY
            )));
        }

        Ok(Self {
            inner: job,
            times,
            interval,
            validation: None,
            results: RwLock::new(Vec::new()),
            lock: Mutex::new(()),
            run_gate: Mutex::new(()),
        })
    }

    /// Wrap `job` with the attempts and interval of `config`
    pub fn from_config(job: Arc<dyn AutomatedJob>, config: &RetryConfig) -> Result<Self> {
        Self::new(job, config.times, config.interval())
    }

    /// Callback run against the wrapped job's context before every retry
    pub fn with_validation<F>(mut self, validation: F) -> Self
    where
        F: Fn(&JobContext) -> anyhow::Result<Validation> + Send + Sync + 'static,
    {
        self.validation = Some(Arc::new(validation));
        self
    }

    /// Maximum attempts per execution
    pub fn times(&self) -> u32 {
        self.times
    }

    /// Pause between attempts
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Results of the most recent execution, in attempt order
    pub fn retry_results(&self) -> Vec<JobResult> {
        self.results.read().clone()
    }

    /// The wrapped job
    pub fn inner(&self) -> &Arc<dyn AutomatedJob> {
        &self.inner
    }

    fn validate(&self, attempt: u32) -> bool {
        let Some(validation) = &self.validation else {
            return true;
        };
        let context = self.inner.context();

        match panic::catch_unwind(AssertUnwindSafe(|| validation(&context))) {
            Ok(Ok(Validation::Valid)) => true,
            Ok(Ok(Validation::NotValid)) => false,
            Ok(Err(err)) => {
                warn!(job = %self.inner.id(), attempt, error = %err, "Validation callback failed");
                false
            }
            Err(payload) => {
                warn!(
                    job = %self.inner.id(),
                    attempt,
                    error = %panic_message(payload.as_ref()),
                    "Validation callback panicked"
                );
                false
            }
        }
    }

    async fn attempt(&self, attempt: u32) -> JobResult {
        match execute_guarded(self.inner.as_ref()).await {
            Ok(result) => result,
            Err(err) => {
                warn!(job = %self.inner.id(), attempt, total = self.times, error = %err, "Attempt failed");
                JobResult::failed(
                    JobFailure::new(self.inner.id().clone())
                        .with_message(format!(
                            "Warning < current retry count: {}, total: {}>.",
                            attempt, self.times
                        ))
                        .with_anyhow(err),
                )
            }
        }
    }
}

#[async_trait]
impl AutomatedJob for RetryJob {
    fn id(&self) -> &JobId {
        self.inner.id()
    }

    fn context(&self) -> Arc<JobContext> {
        self.inner.context()
    }

    async fn set_context(&self, context: Arc<JobContext>) {
        let _guard = self.lock.lock().await;
        self.inner.set_context(context).await;
    }

    fn lock(&self) -> &Mutex<()> {
        &self.lock
    }

    #[instrument(skip(self), fields(job = %self.inner.id(), times = self.times, interval_ms = self.interval.as_millis() as u64))]
    async fn execute(&self) -> anyhow::Result<JobResult> {
        let _inner = self.inner.lock().lock().await;
        let _gate = self.run_gate.lock().await;

        self.results.write().clear();

        for attempt in 1..=self.times {
            let result = self.attempt(attempt).await;
            let status = result.status();
            self.results.write().push(result.clone());
            debug!(attempt, status = %status, "Attempt finished");

            if !self.interval.is_zero() && status == JobStatus::Completed {
                return Ok(result);
            }

            tokio::time::sleep(self.interval).await;

            if !self.validate(attempt) {
                let failed = JobResult::failed(
                    JobFailure::new(self.inner.id().clone())
                        .with_message(format!("Validation Failed on retry attempt: {}", attempt)),
                );
                self.results.write().push(failed.clone());
                return Ok(failed);
            }
            if attempt == self.times {
                return Ok(result);
            }
        }

        // times >= MIN_RETRY, so the loop always returns
        Ok(self
            .results
            .read()
            .last()
            .cloned()
            .unwrap_or_else(|| JobResult::from(JobStatus::NotStarted)))
    }
}

/// Retry combinators for shared jobs
pub trait JobExt {
    /// Retry until the first `Completed` attempt, pausing `interval` between attempts
    fn into_retry(self, times: u32, interval: Duration) -> Result<RetryJob>;

    /// Run exactly `times` times back to back
    fn repeat(self, times: u32) -> Result<RetryJob>;
}

impl JobExt for Arc<dyn AutomatedJob> {
    fn into_retry(self, times: u32, interval: Duration) -> Result<RetryJob> {
        RetryJob::new(self, times, interval)
    }

    fn repeat(self, times: u32) -> Result<RetryJob> {
        RetryJob::new(self, times, Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::AtomicJob;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting(calls: Arc<AtomicU32>, succeed_from: u32) -> Arc<dyn AutomatedJob> {
        Arc::new(AtomicJob::with_status(JobId::generate("flaky"), move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if n >= succeed_from {
                JobStatus::Completed
            } else {
                JobStatus::CompletedWithError
            })
        }))
    }

    #[test]
    fn test_times_below_minimum_is_out_of_range() {
        for interval in [Duration::ZERO, Duration::from_millis(5)] {
            let job: Arc<dyn AutomatedJob> = Arc::new(AtomicJob::noop(JobId::generate("x")));
            assert!(matches!(
                RetryJob::new(job, 1, interval),
                Err(AutoJobError::OutOfRange(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_always_failing_job_runs_every_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = counting(calls.clone(), u32::MAX)
            .into_retry(4, Duration::from_millis(1))
            .unwrap();

        let result = retry.execute().await.unwrap();
        assert_eq!(result.status(), JobStatus::CompletedWithError);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(retry.retry_results().len(), 4);
    }

    #[tokio::test]
    async fn test_first_success_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = counting(calls.clone(), 1)
            .into_retry(5, Duration::from_millis(1))
            .unwrap();

        assert!(retry.execute().await.unwrap().is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retry.retry_results().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_repeats_unconditionally() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = counting(calls.clone(), 1).repeat(3).unwrap();

        assert!(retry.execute().await.unwrap().is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // recorded attempts belong to the latest execution only
        retry.execute().await.unwrap();
        assert_eq!(retry.retry_results().len(), 3);
    }

    #[tokio::test]
    async fn test_unhandled_error_is_recorded_per_attempt() {
        let job: Arc<dyn AutomatedJob> = Arc::new(AtomicJob::without_context(
            JobId::generate("broken"),
            || anyhow::bail!("timeout"),
        ));
        let retry = job.into_retry(2, Duration::from_millis(1)).unwrap();

        let result = retry.execute().await.unwrap();
        let failure = result.error().unwrap();
        assert_eq!(failure.message(), "Warning < current retry count: 2, total: 2>.");
        assert!(failure.cause().unwrap().to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn test_not_valid_aborts_the_loop() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = counting(calls.clone(), u32::MAX)
            .into_retry(5, Duration::from_millis(1))
            .unwrap()
            .with_validation(|_| Ok(Validation::NotValid));

        let result = retry.execute().await.unwrap();
        assert_eq!(result.status(), JobStatus::CompletedWithError);
        assert_eq!(result.error().unwrap().message(), "Validation Failed on retry attempt: 1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retry.retry_results().len(), 2);
    }

    #[tokio::test]
    async fn test_validation_runs_after_final_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let retry = counting(calls.clone(), 1)
            .repeat(3)
            .unwrap()
            .with_validation(move |_| {
                Ok(if seen.load(Ordering::SeqCst) < 3 {
                    Validation::Valid
                } else {
                    Validation::NotValid
                })
            });

        let result = retry.execute().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.status(), JobStatus::CompletedWithError);
        assert_eq!(result.error().unwrap().message(), "Validation Failed on retry attempt: 3");
        assert_eq!(retry.retry_results().len(), 4);
    }

    #[tokio::test]
    async fn test_panicking_validation_counts_as_not_valid() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = counting(calls.clone(), u32::MAX)
            .into_retry(3, Duration::from_millis(1))
            .unwrap()
            .with_validation(|_| panic!("validator bug"));

        let result = retry.execute().await.unwrap();
        assert_eq!(result.status(), JobStatus::CompletedWithError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validation_sees_inner_context() {
        let calls = Arc::new(AtomicU32::new(0));
        let inner = counting(calls.clone(), 3);
        inner.context().set_value(true, "ready").unwrap();

        let retry = inner
            .into_retry(5, Duration::from_millis(1))
            .unwrap()
            .with_validation(|ctx| {
                Ok(if ctx.get_value::<bool>("ready")? {
                    Validation::Valid
                } else {
                    Validation::NotValid
                })
            });

        assert!(retry.execute().await.unwrap().is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_shares_identity_and_context() {
        let inner: Arc<dyn AutomatedJob> = Arc::new(AtomicJob::noop(JobId::generate("wrapped")));
        let retry = inner.clone().repeat(2).unwrap();
        assert_eq!(retry.id(), inner.id());

        let context = Arc::new(JobContext::new(JobId::generate("other")));
        retry.set_context(context.clone()).await;
        assert!(Arc::ptr_eq(&inner.context(), &context));
    }
}
