use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Retrying,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// An attempt is in flight or waiting out its backoff.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Retrying)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Retrying => write!(f, "retrying"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "retrying" => Ok(JobStatus::Retrying),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(OrchestratorError::Configuration(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Dispatch priority. Higher values are dequeued first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Priority {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(OrchestratorError::Configuration(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

/// One recurring workload: immutable identity plus the state of its current run.
///
/// Run state is private. It only changes through the transition methods below,
/// each of which rejects moves the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub schedule: String,
    pub checkpoint_path: Option<String>,
    max_retries: u32,
    retry_count: u32,
    status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

/// Where a failed attempt left the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptVerdict {
    /// Budget remains; `retry_count` is the value after incrementing.
    Retry { retry_count: u32 },
    /// Budget exhausted, job is `Failed`.
    Exhausted,
}

impl Job {
    pub fn new(
        job_id: impl Into<String>,
        name: impl Into<String>,
        image: impl Into<String>,
        command: Vec<String>,
        schedule: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            name: name.into(),
            image: image.into(),
            command,
            schedule: schedule.into(),
            checkpoint_path: None,
            max_retries,
            retry_count: 0,
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn with_checkpoint(mut self, path: impl Into<String>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn remaining_retries(&self) -> u32 {
        self.max_retries - self.retry_count
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Changing the budget is only allowed between runs.
    pub fn set_max_retries(&mut self, max_retries: u32) -> Result<()> {
        if self.status.is_active() {
            return Err(OrchestratorError::JobRunning(self.job_id.clone()));
        }
        self.max_retries = max_retries;
        self.retry_count = self.retry_count.min(max_retries);
        Ok(())
    }

    /// Enter `Running`.
    ///
    /// From `Pending`, `Completed` or `Failed` this starts a fresh run with the
    /// full retry budget. From `Retrying` it resumes the current run and keeps
    /// both the retry count and the last failure reason.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            JobStatus::Pending | JobStatus::Completed | JobStatus::Failed => {
                self.retry_count = 0;
                self.error_message = None;
                self.completed_at = None;
            }
            JobStatus::Retrying => {}
            JobStatus::Running => return Err(self.invalid(JobStatus::Running)),
        }
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Running {
            return Err(self.invalid(JobStatus::Completed));
        }
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.error_message = None;
        Ok(())
    }

    /// Record a failed attempt and either consume one retry or fail the job.
    pub fn fail_attempt(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<AttemptVerdict> {
        if self.status != JobStatus::Running {
            return Err(self.invalid(JobStatus::Failed));
        }
        self.error_message = Some(reason.into());
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.status = JobStatus::Retrying;
            Ok(AttemptVerdict::Retry {
                retry_count: self.retry_count,
            })
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            Ok(AttemptVerdict::Exhausted)
        }
    }

    /// Manual retry: back to `Pending` with a clean slate.
    pub fn reset(&mut self) -> Result<()> {
        if !self.status.is_terminal() {
            return Err(self.invalid(JobStatus::Pending));
        }
        self.status = JobStatus::Pending;
        self.retry_count = 0;
        self.started_at = None;
        self.completed_at = None;
        self.error_message = None;
        Ok(())
    }

    /// A run that was `Running` when the process died is resumable, not failed.
    /// The interrupted attempt does not consume a retry.
    pub fn mark_interrupted(&mut self) -> Result<()> {
        match self.status {
            JobStatus::Running => {
                self.status = JobStatus::Retrying;
                Ok(())
            }
            JobStatus::Retrying => Ok(()),
            _ => Err(self.invalid(JobStatus::Retrying)),
        }
    }

    /// Adopt run state from a persisted copy of this job.
    pub fn restore_from(&mut self, persisted: &Job) {
        self.status = persisted.status;
        self.retry_count = persisted.retry_count.min(self.max_retries);
        self.started_at = persisted.started_at;
        self.completed_at = persisted.completed_at;
        self.error_message = persisted.error_message.clone();
    }

    fn invalid(&self, to: JobStatus) -> OrchestratorError {
        OrchestratorError::InvalidTransition {
            job_id: self.job_id.clone(),
            from: self.status,
            to,
        }
    }
}

/// Scheduling metadata around a [`Job`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job: Job,
    pub priority: Priority,
    pub dependencies: BTreeSet<String>,
    pub max_concurrent: usize,
    pub timeout_secs: Option<u64>,
    pub tags: Vec<String>,
    pub enabled: bool,
}

impl ScheduledJob {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            priority: Priority::Normal,
            dependencies: BTreeSet::new(),
            max_concurrent: 1,
            timeout_secs: None,
            tags: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, job_id: impl Into<String>) -> Self {
        self.dependencies.insert(job_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn id(&self) -> &str {
        &self.job.job_id
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn default_max_concurrent() -> usize {
    1
}

fn default_enabled() -> bool {
    true
}

/// Declarative job description, as written in the config file or posted to the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub job_id: String,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub schedule: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub checkpoint_path: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl JobDefinition {
    pub fn into_scheduled(self, default_max_retries: u32) -> ScheduledJob {
        let mut job = Job::new(
            self.job_id,
            self.name,
            self.image,
            self.command,
            self.schedule,
            self.max_retries.unwrap_or(default_max_retries),
        );
        job.checkpoint_path = self.checkpoint_path;
        ScheduledJob {
            job,
            priority: self.priority,
            dependencies: self.dependencies.into_iter().collect(),
            max_concurrent: self.max_concurrent,
            timeout_secs: self.timeout_secs,
            tags: self.tags,
            enabled: self.enabled,
        }
    }
}

/// Partial update. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub image: Option<String>,
    pub command: Option<Vec<String>>,
    pub schedule: Option<String>,
    pub max_retries: Option<u32>,
    pub checkpoint_path: Option<String>,
    pub priority: Option<Priority>,
    pub dependencies: Option<Vec<String>>,
    pub max_concurrent: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub tags: Option<Vec<String>>,
    pub enabled: Option<bool>,
}

impl JobUpdate {
    pub fn apply(self, scheduled: &mut ScheduledJob) -> Result<()> {
        if let Some(max_retries) = self.max_retries {
            scheduled.job.set_max_retries(max_retries)?;
        }
        if let Some(name) = self.name {
            scheduled.job.name = name;
        }
        if let Some(image) = self.image {
            scheduled.job.image = image;
        }
        if let Some(command) = self.command {
            scheduled.job.command = command;
        }
        if let Some(schedule) = self.schedule {
            scheduled.job.schedule = schedule;
        }
        if let Some(path) = self.checkpoint_path {
            scheduled.job.checkpoint_path = Some(path);
        }
        if let Some(priority) = self.priority {
            scheduled.priority = priority;
        }
        if let Some(dependencies) = self.dependencies {
            scheduled.dependencies = dependencies.into_iter().collect();
        }
        if let Some(max_concurrent) = self.max_concurrent {
            scheduled.max_concurrent = max_concurrent;
        }
        if let Some(timeout_secs) = self.timeout_secs {
            scheduled.timeout_secs = Some(timeout_secs);
        }
        if let Some(tags) = self.tags {
            scheduled.tags = tags;
        }
        if let Some(enabled) = self.enabled {
            scheduled.enabled = enabled;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(max_retries: u32) -> Job {
        Job::new(
            "train-001",
            "resnet50-training",
            "trainer:latest",
            vec!["python".to_string(), "train.py".to_string()],
            "0 2 * * *",
            max_retries,
        )
    }

    #[test]
    fn new_job_is_pending() {
        let job = job(3);
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.retry_count(), 0);
        assert!(job.started_at().is_none());
        assert!(job.completed_at().is_none());
    }

    #[test]
    fn start_sets_started_at() {
        let mut job = job(3);
        let now = Utc::now();
        job.start(now).unwrap();
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.started_at(), Some(now));
    }

    #[test]
    fn cannot_start_twice() {
        let mut job = job(3);
        job.start(Utc::now()).unwrap();
        let err = job.start(Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidTransition {
                from: JobStatus::Running,
                ..
            }
        ));
    }

    #[test]
    fn failure_consumes_retry_then_exhausts() {
        let mut job = job(1);
        job.start(Utc::now()).unwrap();
        let verdict = job.fail_attempt("exit 1", Utc::now()).unwrap();
        assert_eq!(verdict, AttemptVerdict::Retry { retry_count: 1 });
        assert_eq!(job.status(), JobStatus::Retrying);
        assert!(job.completed_at().is_none());

        job.start(Utc::now()).unwrap();
        assert_eq!(job.retry_count(), 1);
        assert_eq!(job.error_message(), Some("exit 1"));

        let verdict = job.fail_attempt("exit 2", Utc::now()).unwrap();
        assert_eq!(verdict, AttemptVerdict::Exhausted);
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.retry_count(), 1);
        assert_eq!(job.error_message(), Some("exit 2"));
        assert!(job.completed_at().is_some());
    }

    #[test]
    fn zero_retry_budget_fails_immediately() {
        let mut job = job(0);
        job.start(Utc::now()).unwrap();
        let verdict = job.fail_attempt("boom", Utc::now()).unwrap();
        assert_eq!(verdict, AttemptVerdict::Exhausted);
        assert_eq!(job.retry_count(), 0);
    }

    #[test]
    fn complete_requires_running() {
        let mut job = job(3);
        assert!(job.complete(Utc::now()).is_err());
        job.start(Utc::now()).unwrap();
        job.complete(Utc::now()).unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.completed_at().is_some());
        assert!(job.duration().is_some());
    }

    #[test]
    fn completion_clears_previous_failure() {
        let mut job = job(2);
        job.start(Utc::now()).unwrap();
        job.fail_attempt("oom", Utc::now()).unwrap();
        job.start(Utc::now()).unwrap();
        job.complete(Utc::now()).unwrap();
        assert!(job.error_message().is_none());
        assert_eq!(job.retry_count(), 1);
    }

    #[test]
    fn reset_only_from_terminal() {
        let mut job = job(1);
        assert!(job.reset().is_err());

        job.start(Utc::now()).unwrap();
        assert!(job.reset().is_err());

        job.fail_attempt("a", Utc::now()).unwrap();
        assert!(job.reset().is_err());

        job.start(Utc::now()).unwrap();
        job.fail_attempt("b", Utc::now()).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);

        job.reset().unwrap();
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.retry_count(), 0);
        assert!(job.error_message().is_none());
        assert!(job.started_at().is_none());
        assert!(job.completed_at().is_none());
    }

    #[test]
    fn new_run_after_failure_gets_full_budget() {
        let mut job = job(1);
        job.start(Utc::now()).unwrap();
        job.fail_attempt("a", Utc::now()).unwrap();
        job.start(Utc::now()).unwrap();
        job.fail_attempt("b", Utc::now()).unwrap();

        job.start(Utc::now()).unwrap();
        assert_eq!(job.retry_count(), 0);
        assert!(job.completed_at().is_none());
        assert!(job.error_message().is_none());
    }

    #[test]
    fn interrupted_run_becomes_retrying_without_spending_budget() {
        let mut job = job(2);
        job.start(Utc::now()).unwrap();
        job.mark_interrupted().unwrap();
        assert_eq!(job.status(), JobStatus::Retrying);
        assert_eq!(job.retry_count(), 0);
        assert!(job.clone().mark_interrupted().is_ok());

        let mut done = self::job(2);
        done.start(Utc::now()).unwrap();
        done.complete(Utc::now()).unwrap();
        assert!(done.mark_interrupted().is_err());
    }

    #[test]
    fn lowering_budget_clamps_retry_count() {
        let mut job = job(3);
        job.start(Utc::now()).unwrap();
        job.fail_attempt("a", Utc::now()).unwrap();
        job.start(Utc::now()).unwrap();
        job.fail_attempt("b", Utc::now()).unwrap();
        assert!(matches!(
            job.set_max_retries(1),
            Err(OrchestratorError::JobRunning(_))
        ));

        job.start(Utc::now()).unwrap();
        job.complete(Utc::now()).unwrap();
        job.set_max_retries(1).unwrap();
        assert_eq!(job.retry_count(), 1);
        assert_eq!(job.remaining_retries(), 0);
    }

    #[test]
    fn restore_clamps_persisted_retry_count() {
        let mut persisted = job(5);
        persisted.start(Utc::now()).unwrap();
        for _ in 0..4 {
            persisted.fail_attempt("x", Utc::now()).unwrap();
            persisted.start(Utc::now()).unwrap();
        }
        let mut current = job(2);
        current.restore_from(&persisted);
        assert_eq!(current.status(), JobStatus::Running);
        assert_eq!(current.retry_count(), 2);
    }

    #[test]
    fn priority_ordering_and_parsing() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::Critical.value(), 4);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Retrying).unwrap();
        assert_eq!(json, "\"retrying\"");
        assert_eq!("FAILED".parse::<JobStatus>().unwrap(), JobStatus::Failed);
    }

    #[test]
    fn definition_defaults() {
        let def: JobDefinition = serde_yaml::from_str(
            r#"
job_id: model-training
name: Model Training
image: trainer:latest
command: ["python", "train.py"]
schedule: "0 2 * * *"
dependencies: ["data-preprocessing"]
"#,
        )
        .unwrap();
        let scheduled = def.into_scheduled(3);
        assert_eq!(scheduled.job.max_retries(), 3);
        assert_eq!(scheduled.priority, Priority::Normal);
        assert_eq!(scheduled.max_concurrent, 1);
        assert!(scheduled.enabled);
        assert!(scheduled.dependencies.contains("data-preprocessing"));
    }

    #[test]
    fn update_refused_while_running_budget_change() {
        let mut scheduled = ScheduledJob::new(job(3));
        scheduled.job.start(Utc::now()).unwrap();
        let update = JobUpdate {
            max_retries: Some(1),
            ..Default::default()
        };
        assert!(update.apply(&mut scheduled).is_err());
    }

    #[test]
    fn update_applies_fields() {
        let mut scheduled = ScheduledJob::new(job(3));
        let update = JobUpdate {
            name: Some("renamed".to_string()),
            priority: Some(Priority::High),
            dependencies: Some(vec!["a".to_string(), "b".to_string()]),
            timeout_secs: Some(600),
            enabled: Some(false),
            ..Default::default()
        };
        update.apply(&mut scheduled).unwrap();
        assert_eq!(scheduled.job.name, "renamed");
        assert_eq!(scheduled.priority, Priority::High);
        assert_eq!(scheduled.dependencies.len(), 2);
        assert_eq!(scheduled.timeout(), Some(Duration::from_secs(600)));
        assert!(!scheduled.enabled);
    }
}
