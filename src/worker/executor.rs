use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::Result;
use crate::metrics::MetricsSink;
use crate::notify::NotificationHub;
use crate::scheduler::job::{AttemptVerdict, Job, ScheduledJob};
use crate::scheduler::registry::JobRegistry;
use crate::store::JobStore;
use crate::worker::backend::{AttemptStatus, ExecutionRequest, ExecutorBackend, SubmissionHandle};

pub const TIMEOUT_MESSAGE: &str = "attempt timeout exceeded";

/// Delay before retry `n` is `base * multiplier^n`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: u32,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            multiplier: 2,
            cap: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_secs(config.base_delay_secs),
            multiplier: config.multiplier,
            cap: Duration::from_secs(config.max_delay_secs),
        }
    }

    /// `retry_count` is the value after incrementing for the failed attempt.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = u64::from(self.multiplier)
            .checked_pow(retry_count)
            .unwrap_or(u64::MAX);
        let millis = u64::try_from(self.base.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(factor);
        Duration::from_millis(millis).min(self.cap)
    }
}

/// How a call to [`Executor::execute`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    /// Retry budget exhausted.
    Failed,
    /// Shutdown interrupted the run; state was left for rehydration.
    Aborted,
    /// The job could not enter `Running` (unknown, or already running).
    NotStarted(String),
}

/// Runs one job through attempts, retries and backoff until it finishes.
pub struct Executor {
    registry: Arc<RwLock<JobRegistry>>,
    backend: Arc<dyn ExecutorBackend>,
    store: Arc<dyn JobStore>,
    notifier: Arc<NotificationHub>,
    metrics: Arc<dyn MetricsSink>,
    backoff: BackoffPolicy,
}

impl Executor {
    pub fn new(
        registry: Arc<RwLock<JobRegistry>>,
        backend: Arc<dyn ExecutorBackend>,
        store: Arc<dyn JobStore>,
        notifier: Arc<NotificationHub>,
        metrics: Arc<dyn MetricsSink>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            registry,
            backend,
            store,
            notifier,
            metrics,
            backoff,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Execute `job_id` until it completes, exhausts its retries, or `abort` fires.
    ///
    /// Every attempt failure is absorbed into the job's state. Each pass of the
    /// loop either returns or spends one retry, so it runs at most
    /// `max_retries + 1` times.
    pub async fn execute(&self, job_id: &str, abort: &CancellationToken) -> ExecutionOutcome {
        loop {
            let scheduled = match self.step(job_id, |job| job.start(Utc::now())).await {
                Ok(((), scheduled)) => scheduled,
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "Job could not start");
                    return ExecutionOutcome::NotStarted(e.to_string());
                }
            };
            self.publish(&scheduled, "Job started").await;

            let request = ExecutionRequest::from_job(&scheduled.job);
            if request.resumes_from_checkpoint() {
                tracing::info!(job_id, attempt = request.attempt, "Resuming from checkpoint");
            }

            let reason = match self.attempt(&request, scheduled.timeout(), abort).await {
                AttemptEnd::Succeeded => return self.finish_success(job_id).await,
                AttemptEnd::Failed(reason) => reason,
                AttemptEnd::Aborted => {
                    tracing::warn!(job_id, "Shutdown interrupted running attempt");
                    return ExecutionOutcome::Aborted;
                }
            };

            let verdict = self
                .step(job_id, |job| job.fail_attempt(reason.clone(), Utc::now()))
                .await;
            match verdict {
                Ok((AttemptVerdict::Retry { retry_count }, scheduled)) => {
                    let delay = self.backoff.delay_for(retry_count);
                    let message = format!(
                        "Job failed, retrying (attempt {}/{}): {}",
                        retry_count,
                        scheduled.job.max_retries(),
                        reason
                    );
                    tracing::warn!(
                        job_id,
                        retry_count,
                        delay_secs = delay.as_secs(),
                        reason = %reason,
                        "Scheduling retry"
                    );
                    self.publish(&scheduled, &message).await;

                    tokio::select! {
                        _ = abort.cancelled() => {
                            tracing::warn!(job_id, "Shutdown interrupted retry backoff");
                            return ExecutionOutcome::Aborted;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Ok((AttemptVerdict::Exhausted, scheduled)) => {
                    let message = format!(
                        "Job failed after {} retries: {}",
                        scheduled.job.max_retries(),
                        reason
                    );
                    tracing::error!(job_id, reason = %reason, "Retry budget exhausted");
                    self.publish(&scheduled, &message).await;
                    self.record_finished(&scheduled.job);
                    return ExecutionOutcome::Failed;
                }
                Err(e) => {
                    tracing::error!(job_id, error = %e, "Failed to record attempt failure");
                    return ExecutionOutcome::NotStarted(e.to_string());
                }
            }
        }
    }

    /// Submit and monitor one attempt. `timeout` bounds both steps together.
    ///
    /// An attempt cut short by the timeout or by `abort` is cancelled in the
    /// backend before this returns, so it never overlaps the next attempt.
    async fn attempt(
        &self,
        request: &ExecutionRequest,
        timeout: Option<Duration>,
        abort: &CancellationToken,
    ) -> AttemptEnd {
        let deadline = timeout.map(|limit| Instant::now() + limit);

        let submitted = tokio::select! {
            _ = abort.cancelled() => return AttemptEnd::Aborted,
            submitted = until(deadline, self.backend.submit(request)) => submitted,
        };
        let handle = match submitted {
            Some(Ok(handle)) => handle,
            Some(Err(e)) => return AttemptEnd::Failed(e.to_string()),
            None => return AttemptEnd::Failed(TIMEOUT_MESSAGE.to_string()),
        };
        tracing::debug!(job_id = %request.job_id, handle = %handle.id, "Attempt submitted");

        let monitored = tokio::select! {
            _ = abort.cancelled() => {
                self.cancel(&handle).await;
                return AttemptEnd::Aborted;
            }
            monitored = until(deadline, self.backend.monitor(&handle)) => monitored,
        };
        match monitored {
            Some(Ok(AttemptStatus::Succeeded)) => AttemptEnd::Succeeded,
            Some(Ok(AttemptStatus::Failed { message, .. })) => AttemptEnd::Failed(message),
            Some(Err(e)) => AttemptEnd::Failed(e.to_string()),
            None => {
                tracing::warn!(job_id = %request.job_id, handle = %handle.id, "Attempt timed out");
                self.cancel(&handle).await;
                AttemptEnd::Failed(TIMEOUT_MESSAGE.to_string())
            }
        }
    }

    async fn cancel(&self, handle: &SubmissionHandle) {
        if let Err(e) = self.backend.cancel(handle).await {
            tracing::error!(
                job_id = %handle.job_id,
                handle = %handle.id,
                error = %e,
                "Failed to cancel attempt"
            );
        }
    }

    async fn finish_success(&self, job_id: &str) -> ExecutionOutcome {
        match self.step(job_id, |job| job.complete(Utc::now())).await {
            Ok(((), scheduled)) => {
                let took = scheduled
                    .job
                    .duration()
                    .and_then(|d| d.to_std().ok())
                    .unwrap_or_default();
                let message = format!(
                    "Training job completed successfully in {}",
                    format_duration(took)
                );
                self.publish(&scheduled, &message).await;
                self.record_finished(&scheduled.job);
                ExecutionOutcome::Completed
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to record completion");
                ExecutionOutcome::NotStarted(e.to_string())
            }
        }
    }

    async fn step<T>(
        &self,
        job_id: &str,
        step: impl FnOnce(&mut Job) -> Result<T>,
    ) -> Result<(T, ScheduledJob)> {
        self.registry.write().await.transition(job_id, step)
    }

    /// Report a transition: metrics, log, notify, then persist.
    async fn publish(&self, scheduled: &ScheduledJob, message: &str) {
        let job = &scheduled.job;
        self.metrics.transition(&job.job_id, job.status());
        tracing::info!(
            job_id = %job.job_id,
            status = %job.status(),
            retry_count = job.retry_count(),
            "{message}"
        );
        self.notifier.notify(job, message).await;
        if let Err(e) = self.store.save(scheduled).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "Failed to persist job state");
        }
    }

    fn record_finished(&self, job: &Job) {
        let took = job
            .duration()
            .and_then(|d| d.to_std().ok())
            .unwrap_or_default();
        self.metrics.run_finished(&job.job_id, job.status(), took);
    }
}

enum AttemptEnd {
    Succeeded,
    Failed(String),
    Aborted,
}

/// `None` if `deadline` passes first.
async fn until<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{}.{:01}s", s, d.subsec_millis() / 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_doubles_from_two_minutes() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for(2), Duration::from_secs(240));
        assert_eq!(policy.delay_for(3), Duration::from_secs(480));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(6), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(60), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn backoff_from_config() {
        let policy = BackoffPolicy::from_config(&RetryConfig {
            base_delay_secs: 5,
            multiplier: 3,
            max_delay_secs: 100,
            default_max_retries: 1,
        });
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(45));
        assert_eq!(policy.delay_for(3), Duration::from_secs(100));
    }

    #[test]
    fn durations_are_human_readable() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(312)), "5m 12s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }
}
