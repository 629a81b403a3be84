//! Passive counters observed by the scheduler and executor.
//!
//! Nothing in the scheduling path reads these back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::scheduler::job::JobStatus;

/// Why a fire or a dequeued entry did not turn into a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Disabled,
    UnknownJob,
    DependenciesNotMet,
    WorkerLimitReached,
    JobConcurrencyLimitReached,
    QueueFull,
    ShuttingDown,
    LockContention,
    LockError,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Disabled => "disabled",
            DropReason::UnknownJob => "unknown_job",
            DropReason::DependenciesNotMet => "dependencies_not_met",
            DropReason::WorkerLimitReached => "worker_limit_reached",
            DropReason::JobConcurrencyLimitReached => "job_concurrency_limit_reached",
            DropReason::QueueFull => "queue_full",
            DropReason::ShuttingDown => "shutting_down",
            DropReason::LockContention => "lock_contention",
            DropReason::LockError => "lock_error",
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn job_registered(&self, job_id: &str);
    fn job_unregistered(&self, job_id: &str);
    fn transition(&self, job_id: &str, to: JobStatus);
    fn run_finished(&self, job_id: &str, status: JobStatus, duration: Duration);
    fn enqueued(&self, job_id: &str, depth: usize);
    fn dequeued(&self, job_id: &str, depth: usize);
    fn dropped(&self, job_id: &str, reason: DropReason);
    fn notification(&self, channel: &str, success: bool);
}

#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn job_registered(&self, _job_id: &str) {}
    fn job_unregistered(&self, _job_id: &str) {}
    fn transition(&self, _job_id: &str, _to: JobStatus) {}
    fn run_finished(&self, _job_id: &str, _status: JobStatus, _duration: Duration) {}
    fn enqueued(&self, _job_id: &str, _depth: usize) {}
    fn dequeued(&self, _job_id: &str, _depth: usize) {}
    fn dropped(&self, _job_id: &str, _reason: DropReason) {}
    fn notification(&self, _channel: &str, _success: bool) {}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_registered: u64,
    pub jobs_unregistered: u64,
    pub runs_started: u64,
    pub retries_scheduled: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub total_run_seconds: f64,
    pub enqueued: u64,
    pub dequeued: u64,
    pub queue_depth: u64,
    pub dropped: BTreeMap<DropReason, u64>,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
}

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

impl MetricsSnapshot {
    /// Render in the Prometheus text exposition format. `job_counts` adds a
    /// `training_jobs{status=...}` gauge per entry.
    pub fn to_prometheus(&self, job_counts: &[(JobStatus, usize)]) -> String {
        let mut out = String::new();
        let mut single = |name: &str, kind: &str, help: &str, value: String| {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"));
        };
        single(
            "training_jobs_registered_total",
            "counter",
            "Jobs registered with the scheduler.",
            self.jobs_registered.to_string(),
        );
        single(
            "training_jobs_unregistered_total",
            "counter",
            "Jobs removed from the scheduler.",
            self.jobs_unregistered.to_string(),
        );
        single(
            "training_job_attempts_started_total",
            "counter",
            "Attempts that entered running.",
            self.runs_started.to_string(),
        );
        single(
            "training_job_retries_total",
            "counter",
            "Failed attempts scheduled for retry.",
            self.retries_scheduled.to_string(),
        );
        single(
            "training_job_runs_completed_total",
            "counter",
            "Runs that completed successfully.",
            self.runs_completed.to_string(),
        );
        single(
            "training_job_runs_failed_total",
            "counter",
            "Runs that exhausted their retry budget.",
            self.runs_failed.to_string(),
        );
        single(
            "training_job_run_seconds_total",
            "counter",
            "Wall-clock seconds spent in finished runs.",
            self.total_run_seconds.to_string(),
        );
        single(
            "training_queue_enqueued_total",
            "counter",
            "Entries accepted by the dispatch queue.",
            self.enqueued.to_string(),
        );
        single(
            "training_queue_dequeued_total",
            "counter",
            "Entries taken by workers.",
            self.dequeued.to_string(),
        );
        single(
            "training_queue_depth",
            "gauge",
            "Dispatch queue depth at the last enqueue or dequeue.",
            self.queue_depth.to_string(),
        );

        out.push_str("# HELP training_dispatch_dropped_total Fires and entries that did not become runs.\n");
        out.push_str("# TYPE training_dispatch_dropped_total counter\n");
        for (reason, count) in &self.dropped {
            out.push_str(&format!(
                "training_dispatch_dropped_total{{reason=\"{}\"}} {count}\n",
                reason.as_str()
            ));
        }

        out.push_str("# HELP training_notifications_total Notification deliveries by result.\n");
        out.push_str("# TYPE training_notifications_total counter\n");
        out.push_str(&format!(
            "training_notifications_total{{result=\"sent\"}} {}\n",
            self.notifications_sent
        ));
        out.push_str(&format!(
            "training_notifications_total{{result=\"failed\"}} {}\n",
            self.notifications_failed
        ));

        if !job_counts.is_empty() {
            out.push_str("# HELP training_jobs Registered jobs by status.\n");
            out.push_str("# TYPE training_jobs gauge\n");
            for (status, count) in job_counts {
                out.push_str(&format!("training_jobs{{status=\"{status}\"}} {count}\n"));
            }
        }
        out
    }
}

/// In-process atomic counters, served on `/metrics`.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    jobs_registered: AtomicU64,
    jobs_unregistered: AtomicU64,
    runs_started: AtomicU64,
    retries_scheduled: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    run_millis: AtomicU64,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    queue_depth: AtomicU64,
    dropped: Mutex<BTreeMap<DropReason, u64>>,
    notifications_sent: AtomicU64,
    notifications_failed: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_registered: self.jobs_registered.load(Ordering::Relaxed),
            jobs_unregistered: self.jobs_unregistered.load(Ordering::Relaxed),
            runs_started: self.runs_started.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            total_run_seconds: self.run_millis.load(Ordering::Relaxed) as f64 / 1000.0,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            dropped: self
                .dropped
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for SchedulerMetrics {
    fn job_registered(&self, _job_id: &str) {
        self.jobs_registered.fetch_add(1, Ordering::Relaxed);
    }

    fn job_unregistered(&self, _job_id: &str) {
        self.jobs_unregistered.fetch_add(1, Ordering::Relaxed);
    }

    fn transition(&self, _job_id: &str, to: JobStatus) {
        match to {
            JobStatus::Running => self.runs_started.fetch_add(1, Ordering::Relaxed),
            JobStatus::Retrying => self.retries_scheduled.fetch_add(1, Ordering::Relaxed),
            JobStatus::Completed => self.runs_completed.fetch_add(1, Ordering::Relaxed),
            JobStatus::Failed => self.runs_failed.fetch_add(1, Ordering::Relaxed),
            JobStatus::Pending => 0,
        };
    }

    fn run_finished(&self, _job_id: &str, _status: JobStatus, duration: Duration) {
        self.run_millis
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    fn enqueued(&self, _job_id: &str, depth: usize) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    fn dequeued(&self, _job_id: &str, depth: usize) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    fn dropped(&self, _job_id: &str, reason: DropReason) {
        *self
            .dropped
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(reason)
            .or_insert(0) += 1;
    }

    fn notification(&self, _channel: &str, success: bool) {
        if success {
            self.notifications_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.notifications_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
