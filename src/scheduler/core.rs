use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, SchedulerConfig};
use crate::error::{OrchestratorError, Result};
use crate::lock::DistributedLock;
use crate::metrics::{DropReason, MetricsSink};
use crate::notify::NotificationHub;
use crate::scheduler::gate;
use crate::scheduler::job::{JobDefinition, JobStatus, JobUpdate, Priority, ScheduledJob};
use crate::scheduler::queue::DispatchQueue;
use crate::scheduler::registry::JobRegistry;
use crate::scheduler::running::RunningSet;
use crate::scheduler::trigger::{parse_schedule, CronTriggerSource, TriggerFire};
use crate::store::JobStore;
use crate::worker::backend::ExecutorBackend;
use crate::worker::executor::{BackoffPolicy, Executor};
use crate::worker::pool::{spawn_pool, WorkerContext};

const FIRE_CHANNEL_CAPACITY: usize = 256;

/// Result of offering one fire to the dispatch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FireDecision {
    Enqueued,
    Disabled,
    UnknownJob,
    DependenciesNotMet,
    WorkerLimitReached,
    JobConcurrencyLimitReached,
    QueueFull,
    ShuttingDown,
}

impl FireDecision {
    pub fn is_enqueued(self) -> bool {
        self == FireDecision::Enqueued
    }

    fn drop_reason(self) -> Option<DropReason> {
        match self {
            FireDecision::Enqueued => None,
            FireDecision::Disabled => Some(DropReason::Disabled),
            FireDecision::UnknownJob => Some(DropReason::UnknownJob),
            FireDecision::DependenciesNotMet => Some(DropReason::DependenciesNotMet),
            FireDecision::WorkerLimitReached => Some(DropReason::WorkerLimitReached),
            FireDecision::JobConcurrencyLimitReached => {
                Some(DropReason::JobConcurrencyLimitReached)
            }
            FireDecision::QueueFull => Some(DropReason::QueueFull),
            FireDecision::ShuttingDown => Some(DropReason::ShuttingDown),
        }
    }
}

/// External services the scheduler drives.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn ExecutorBackend>,
    pub store: Arc<dyn JobStore>,
    pub notifier: Arc<NotificationHub>,
    pub lock: Arc<dyn DistributedLock>,
    pub metrics: Arc<dyn MetricsSink>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobScheduleInfo {
    pub job_id: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub enabled: bool,
    pub next_fire: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub instance_id: String,
    pub running: bool,
    pub scheduled_jobs: usize,
    pub running_jobs: usize,
    pub queue_depth: usize,
    pub workers: usize,
    pub lock_backend: &'static str,
    pub executor_backend: &'static str,
    pub jobs: Vec<JobScheduleInfo>,
}

/// Composition root: owns the registry, queue, running set, trigger source
/// and worker pool, and exposes the job operations used by the API and CLI.
pub struct Scheduler {
    config: SchedulerConfig,
    default_max_retries: u32,
    registry: Arc<RwLock<JobRegistry>>,
    queue: Arc<DispatchQueue>,
    running: Arc<RunningSet>,
    triggers: CronTriggerSource,
    fires: Mutex<Option<mpsc::Receiver<TriggerFire>>>,
    worker_ctx: WorkerContext,
    store: Arc<dyn JobStore>,
    metrics: Arc<dyn MetricsSink>,
    executor_backend: &'static str,
    intake: CancellationToken,
    abort: CancellationToken,
    workers: Mutex<JoinSet<()>>,
    fire_loop: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    accepting: AtomicBool,
}

impl Scheduler {
    pub fn new(config: &AppConfig, collaborators: Collaborators) -> Self {
        let registry = Arc::new(RwLock::new(JobRegistry::new()));
        let queue = Arc::new(DispatchQueue::with_capacity(
            config.scheduler.max_queue_depth,
        ));
        let running = Arc::new(RunningSet::new());
        let (fire_tx, fire_rx) = mpsc::channel(FIRE_CHANNEL_CAPACITY);

        let executor = Arc::new(Executor::new(
            registry.clone(),
            collaborators.backend.clone(),
            collaborators.store.clone(),
            collaborators.notifier.clone(),
            collaborators.metrics.clone(),
            BackoffPolicy::from_config(&config.retry),
        ));

        let worker_ctx = WorkerContext {
            instance_id: config.scheduler.instance_id.clone(),
            registry: registry.clone(),
            queue: queue.clone(),
            running: running.clone(),
            lock: collaborators.lock.clone(),
            executor,
            metrics: collaborators.metrics.clone(),
            lock_ttl: config.scheduler.lock_ttl(),
            max_workers: config.scheduler.max_workers,
        };

        Self {
            config: config.scheduler.clone(),
            default_max_retries: config.retry.default_max_retries,
            registry,
            queue,
            running,
            triggers: CronTriggerSource::new(fire_tx),
            fires: Mutex::new(Some(fire_rx)),
            worker_ctx,
            store: collaborators.store,
            metrics: collaborators.metrics,
            executor_backend: collaborators.backend.name(),
            intake: CancellationToken::new(),
            abort: CancellationToken::new(),
            workers: Mutex::new(JoinSet::new()),
            fire_loop: Mutex::new(None),
            started: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn registry(&self) -> Arc<RwLock<JobRegistry>> {
        self.registry.clone()
    }

    pub fn queue(&self) -> Arc<DispatchQueue> {
        self.queue.clone()
    }

    pub fn running_set(&self) -> Arc<RunningSet> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.accepting.load(Ordering::SeqCst)
    }

    // ---- job management -------------------------------------------------

    pub async fn register_definition(&self, definition: JobDefinition) -> Result<()> {
        self.register(definition.into_scheduled(self.default_max_retries))
            .await
    }

    /// Validate and add a job, then bind its trigger if enabled.
    pub async fn register(&self, scheduled: ScheduledJob) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        validate_shape(&scheduled)?;

        {
            let mut registry = self.registry.write().await;
            if registry.contains(scheduled.id()) {
                return Err(OrchestratorError::JobAlreadyExists(
                    scheduled.id().to_string(),
                ));
            }
            gate::validate_dependencies(&registry, scheduled.id(), &scheduled.dependencies)?;
            registry.insert(scheduled.clone())?;
        }

        if scheduled.enabled {
            if let Err(e) = self
                .triggers
                .schedule(scheduled.id(), &scheduled.job.schedule)
            {
                self.registry.write().await.remove(scheduled.id());
                return Err(e);
            }
        }

        self.metrics.job_registered(scheduled.id());
        // Before start the store still holds the previous process's state;
        // rehydrate persists these jobs once it has been read.
        if self.started.load(Ordering::SeqCst) {
            self.persist(&scheduled).await;
        }
        tracing::info!(
            job_id = %scheduled.id(),
            schedule = %scheduled.job.schedule,
            priority = %scheduled.priority,
            enabled = scheduled.enabled,
            "Job registered"
        );
        Ok(())
    }

    /// Remove a job. Refused while it is running or waiting to retry.
    pub async fn unregister(&self, job_id: &str) -> Result<ScheduledJob> {
        let (removed, dependents) = {
            let mut registry = self.registry.write().await;
            let scheduled = registry
                .get(job_id)
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
            if scheduled.job.status().is_active() || self.running.contains(job_id) {
                return Err(OrchestratorError::JobRunning(job_id.to_string()));
            }
            let dependents = registry.dependents_of(job_id);
            let removed = registry
                .remove(job_id)
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
            (removed, dependents)
        };

        self.triggers.cancel(job_id);
        let dequeued = self.queue.remove_job(job_id);
        if let Err(e) = self.store.delete(job_id).await {
            tracing::warn!(job_id, error = %e, "Failed to delete persisted job");
        }
        self.metrics.job_unregistered(job_id);
        if !dependents.is_empty() {
            tracing::warn!(job_id, ?dependents, "Removed job is still a dependency");
        }
        tracing::info!(job_id, dequeued, "Job unregistered");
        Ok(removed)
    }

    /// Apply a partial update, revalidate, and rebind the trigger.
    pub async fn update(&self, job_id: &str, update: JobUpdate) -> Result<ScheduledJob> {
        let updated = {
            let mut registry = self.registry.write().await;
            let current = registry
                .get(job_id)
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
            if current.job.status().is_active() {
                return Err(OrchestratorError::JobRunning(job_id.to_string()));
            }

            let mut updated = current.clone();
            let dependencies_changed = update.dependencies.is_some();
            update.apply(&mut updated)?;
            validate_shape(&updated)?;
            if dependencies_changed {
                gate::validate_dependencies(&registry, job_id, &updated.dependencies)?;
            }

            if let Some(slot) = registry.get_mut(job_id) {
                *slot = updated.clone();
            }
            updated
        };

        if updated.enabled {
            self.triggers.schedule(job_id, &updated.job.schedule)?;
        } else {
            self.triggers.cancel(job_id);
        }
        self.persist(&updated).await;
        tracing::info!(job_id, "Job updated");
        Ok(updated)
    }

    /// Manual retry of a finished job: reset it and offer it for dispatch at
    /// its own priority.
    pub async fn retry(&self, job_id: &str) -> Result<FireDecision> {
        let ((), snapshot) = self
            .registry
            .write()
            .await
            .transition(job_id, |job| job.reset())?;
        self.metrics.transition(job_id, JobStatus::Pending);
        self.persist(&snapshot).await;
        tracing::info!(job_id, "Job reset for manual retry");
        Ok(self.dispatch(job_id, None, true).await)
    }

    /// Run now at `Critical` priority. Ignores `enabled` but not the
    /// dependency gate or concurrency caps.
    pub async fn trigger_now(&self, job_id: &str) -> Result<FireDecision> {
        if !self.registry.read().await.contains(job_id) {
            return Err(OrchestratorError::JobNotFound(job_id.to_string()));
        }
        Ok(self.dispatch(job_id, Some(Priority::Critical), true).await)
    }

    /// Trigger-source entry point.
    pub async fn handle_fire(&self, job_id: &str) -> FireDecision {
        self.dispatch(job_id, None, false).await
    }

    async fn dispatch(
        &self,
        job_id: &str,
        priority: Option<Priority>,
        manual: bool,
    ) -> FireDecision {
        let decision = self.decide(job_id, priority, manual).await;
        match decision.drop_reason() {
            None => {
                self.metrics.enqueued(job_id, self.queue.len());
                tracing::debug!(job_id, manual, "Job enqueued");
            }
            Some(reason) => {
                self.metrics.dropped(job_id, reason);
                match decision {
                    FireDecision::QueueFull | FireDecision::WorkerLimitReached => {
                        tracing::warn!(job_id, reason = reason.as_str(), "Fire dropped")
                    }
                    _ => tracing::info!(job_id, reason = reason.as_str(), "Fire dropped"),
                }
            }
        }
        decision
    }

    async fn decide(&self, job_id: &str, priority: Option<Priority>, manual: bool) -> FireDecision {
        if !self.accepting.load(Ordering::SeqCst) {
            return FireDecision::ShuttingDown;
        }

        let priority = {
            let registry = self.registry.read().await;
            let Some(scheduled) = registry.get(job_id) else {
                return FireDecision::UnknownJob;
            };
            if !manual && !scheduled.enabled {
                return FireDecision::Disabled;
            }
            let unmet = gate::unmet_dependencies(&registry, scheduled);
            if !unmet.is_empty() {
                tracing::debug!(job_id, ?unmet, "Dependencies not met");
                return FireDecision::DependenciesNotMet;
            }
            if self.running.len() >= self.config.max_workers {
                return FireDecision::WorkerLimitReached;
            }
            if self.running.count(job_id) >= scheduled.max_concurrent {
                return FireDecision::JobConcurrencyLimitReached;
            }
            priority.unwrap_or(scheduled.priority)
        };

        if self.queue.enqueue(priority, Utc::now(), job_id) {
            FireDecision::Enqueued
        } else {
            FireDecision::QueueFull
        }
    }

    // ---- introspection --------------------------------------------------

    pub async fn get(&self, job_id: &str) -> Option<ScheduledJob> {
        self.registry.read().await.get(job_id).cloned()
    }

    pub async fn list(&self, status: Option<JobStatus>) -> Vec<ScheduledJob> {
        let registry = self.registry.read().await;
        match status {
            Some(status) => registry.with_status(status).into_iter().cloned().collect(),
            None => registry.all().into_iter().cloned().collect(),
        }
    }

    pub async fn stats(&self) -> JobStats {
        let registry = self.registry.read().await;
        JobStats {
            total: registry.len(),
            pending: registry.count_by_status(JobStatus::Pending),
            running: registry.count_by_status(JobStatus::Running),
            retrying: registry.count_by_status(JobStatus::Retrying),
            completed: registry.count_by_status(JobStatus::Completed),
            failed: registry.count_by_status(JobStatus::Failed),
        }
    }

    pub fn next_fire(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.triggers.next_fire(job_id)
    }

    pub async fn status(&self) -> SchedulerStatus {
        let jobs: Vec<JobScheduleInfo> = self
            .registry
            .read()
            .await
            .all()
            .into_iter()
            .map(|s| JobScheduleInfo {
                job_id: s.id().to_string(),
                status: s.job.status(),
                priority: s.priority,
                enabled: s.enabled,
                next_fire: self.triggers.next_fire(s.id()),
            })
            .collect();

        SchedulerStatus {
            instance_id: self.config.instance_id.clone(),
            running: self.is_running(),
            scheduled_jobs: jobs.iter().filter(|j| j.next_fire.is_some()).count(),
            running_jobs: self.running.len(),
            queue_depth: self.queue.len(),
            workers: self.config.max_workers,
            lock_backend: self.worker_ctx.lock.backend_name(),
            executor_backend: self.executor_backend,
            jobs,
        }
    }

    /// Wait until every queued entry has been taken and finished.
    pub async fn wait_idle(&self) {
        self.queue.join().await;
    }

    // ---- lifecycle ------------------------------------------------------

    /// Rehydrate persisted jobs, start the workers and begin consuming fires.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::Internal(
                "scheduler already started".to_string(),
            ));
        }

        let resumed = self.rehydrate().await;

        let workers = spawn_pool(
            self.worker_ctx.clone(),
            self.config.max_workers,
            self.intake.clone(),
            self.abort.clone(),
        );
        *lock(&self.workers) = workers;

        if let Some(rx) = lock(&self.fires).take() {
            let handle = tokio::spawn(fire_loop(
                Arc::downgrade(self),
                rx,
                self.intake.clone(),
            ));
            *lock(&self.fire_loop) = Some(handle);
        }

        tracing::info!(
            instance_id = %self.config.instance_id,
            workers = self.config.max_workers,
            resumed,
            "Scheduler started"
        );
        Ok(())
    }

    /// Restore persisted state. Returns how many interrupted runs were re-enqueued.
    pub async fn rehydrate(&self) -> usize {
        let persisted = match self.store.load(&JobStatus::ALL).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load persisted jobs");
                return 0;
            }
        };

        // Known ids adopt persisted run state; unknown ids are registered.
        // Registration repeats until no progress so dependencies can land first.
        let stored: HashSet<String> = persisted.iter().map(|r| r.id().to_string()).collect();
        let mut unknown = Vec::new();
        {
            let mut registry = self.registry.write().await;
            for record in persisted {
                match registry.get_mut(record.id()) {
                    Some(current) => current.job.restore_from(&record.job),
                    None => unknown.push(record),
                }
            }
        }
        loop {
            let before = unknown.len();
            let mut deferred = Vec::new();
            for record in unknown {
                match self.register(record.clone()).await {
                    Ok(()) => {}
                    Err(OrchestratorError::UnknownDependency { .. }) => deferred.push(record),
                    Err(e) => {
                        tracing::warn!(job_id = %record.id(), error = %e, "Skipping persisted job")
                    }
                }
            }
            unknown = deferred;
            if unknown.is_empty() || unknown.len() == before {
                break;
            }
        }
        for record in &unknown {
            tracing::warn!(job_id = %record.id(), "Skipping persisted job with missing dependencies");
        }

        let fresh: Vec<ScheduledJob> = self
            .registry
            .read()
            .await
            .all()
            .into_iter()
            .filter(|s| !stored.contains(s.id()))
            .cloned()
            .collect();
        for scheduled in &fresh {
            self.persist(scheduled).await;
        }

        let mut resumed = 0;
        let interrupted: Vec<(String, Priority)> = self
            .registry
            .read()
            .await
            .all()
            .into_iter()
            .filter(|s| s.job.status().is_active())
            .map(|s| (s.id().to_string(), s.priority))
            .collect();
        for (job_id, priority) in interrupted {
            let transition = self
                .registry
                .write()
                .await
                .transition(&job_id, |job| job.mark_interrupted());
            match transition {
                Ok(((), snapshot)) => self.persist(&snapshot).await,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not resume job");
                    continue;
                }
            }
            if self.queue.enqueue(priority, Utc::now(), &job_id) {
                self.metrics.enqueued(&job_id, self.queue.len());
                tracing::info!(job_id = %job_id, "Re-enqueued interrupted run");
                resumed += 1;
            } else {
                self.metrics.dropped(&job_id, DropReason::QueueFull);
                tracing::warn!(job_id = %job_id, "Queue full, interrupted run not resumed");
            }
        }
        resumed
    }

    /// Stop triggers and intake, drain in-flight runs for up to
    /// `drain_timeout`, abort the rest, and discard queued entries.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Scheduler shutting down");
        self.triggers.shutdown();
        self.intake.cancel();

        let fire_loop = lock(&self.fire_loop).take();
        if let Some(handle) = fire_loop {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Fire loop ended abnormally");
            }
        }

        let mut workers = std::mem::take(&mut *lock(&self.workers));
        let drained = tokio::time::timeout(self.config.drain_timeout(), async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                in_flight = self.running.len(),
                timeout_secs = self.config.drain_timeout_secs,
                "Drain timed out, aborting in-flight runs"
            );
            self.abort.cancel();
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Worker ended abnormally");
                }
            }
        }

        let discarded = self.queue.clear();
        tracing::info!(discarded, "Scheduler stopped");
    }

    async fn persist(&self, scheduled: &ScheduledJob) {
        if let Err(e) = self.store.save(scheduled).await {
            tracing::warn!(job_id = %scheduled.id(), error = %e, "Failed to persist job state");
        }
    }
}

async fn fire_loop(
    scheduler: Weak<Scheduler>,
    mut fires: mpsc::Receiver<TriggerFire>,
    intake: CancellationToken,
) {
    loop {
        let fire = tokio::select! {
            _ = intake.cancelled() => break,
            fire = fires.recv() => match fire {
                Some(fire) => fire,
                None => break,
            },
        };
        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        tracing::debug!(job_id = %fire.job_id, scheduled_for = %fire.scheduled_for, "Handling fire");
        scheduler.handle_fire(&fire.job_id).await;
    }
}

/// Check a set of definitions the way startup registration would, without
/// binding triggers. Definitions are taken in order, so a dependency must be
/// declared before its dependents.
pub fn validate_definitions(
    definitions: &[JobDefinition],
    default_max_retries: u32,
) -> Result<JobRegistry> {
    let mut registry = JobRegistry::new();
    for definition in definitions {
        let scheduled = definition.clone().into_scheduled(default_max_retries);
        validate_shape(&scheduled)?;
        if registry.contains(scheduled.id()) {
            return Err(OrchestratorError::JobAlreadyExists(
                scheduled.id().to_string(),
            ));
        }
        gate::validate_dependencies(&registry, scheduled.id(), &scheduled.dependencies)?;
        registry.insert(scheduled)?;
    }
    Ok(registry)
}

fn validate_shape(scheduled: &ScheduledJob) -> Result<()> {
    if scheduled.id().trim().is_empty() {
        return Err(OrchestratorError::Configuration(
            "job_id must not be empty".to_string(),
        ));
    }
    if scheduled.max_concurrent == 0 {
        return Err(OrchestratorError::Configuration(format!(
            "job {}: max_concurrent must be at least 1",
            scheduled.id()
        )));
    }
    parse_schedule(&scheduled.job.schedule)?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
