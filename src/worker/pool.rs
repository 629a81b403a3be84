use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::lock::DistributedLock;
use crate::metrics::{DropReason, MetricsSink};
use crate::scheduler::queue::{DispatchQueue, QueueEntry};
use crate::scheduler::registry::JobRegistry;
use crate::scheduler::running::RunningSet;
use crate::worker::executor::{ExecutionOutcome, Executor};

/// What a worker did with one dequeued entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Executed(ExecutionOutcome),
    Dropped(DropReason),
    /// The executor task panicked. The worker keeps going.
    Crashed,
}

/// Shared handles every worker in the pool needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub instance_id: String,
    pub registry: Arc<RwLock<JobRegistry>>,
    pub queue: Arc<DispatchQueue>,
    pub running: Arc<RunningSet>,
    pub lock: Arc<dyn DistributedLock>,
    pub executor: Arc<Executor>,
    pub metrics: Arc<dyn MetricsSink>,
    pub lock_ttl: Duration,
    pub max_workers: usize,
}

pub struct Worker {
    id: usize,
    holder: String,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(id: usize, ctx: WorkerContext) -> Self {
        Self {
            id,
            holder: format!("{}:worker-{}", ctx.instance_id, id),
            ctx,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Consume the queue until `intake` is cancelled.
    ///
    /// A run in progress is not interrupted by `intake`; only `abort` cuts it short.
    pub async fn run(self, intake: CancellationToken, abort: CancellationToken) {
        tracing::debug!(worker_id = self.id, "Worker started");
        loop {
            let entry = tokio::select! {
                biased;
                _ = intake.cancelled() => break,
                entry = self.ctx.queue.dequeue() => entry,
            };
            self.ctx.metrics.dequeued(&entry.job_id, self.ctx.queue.len());
            self.process(entry, &abort).await;
            self.ctx.queue.task_done();
        }
        tracing::debug!(worker_id = self.id, "Worker stopped");
    }

    /// Lock, run and release one entry. Contention drops the entry; the next
    /// trigger fire offers the job again.
    pub async fn process(&self, entry: QueueEntry, abort: &CancellationToken) -> DispatchOutcome {
        let job_id = entry.job_id;
        let max_concurrent = match self.ctx.registry.read().await.get(&job_id) {
            Some(scheduled) => scheduled.max_concurrent,
            None => return self.drop_entry(&job_id, DropReason::UnknownJob),
        };

        let Some(_guard) =
            self.ctx
                .running
                .try_reserve(&job_id, max_concurrent, self.ctx.max_workers)
        else {
            let reason = if self.ctx.running.count(&job_id) >= max_concurrent {
                DropReason::JobConcurrencyLimitReached
            } else {
                DropReason::WorkerLimitReached
            };
            return self.drop_entry(&job_id, reason);
        };

        match self
            .ctx
            .lock
            .try_acquire(&job_id, &self.holder, self.ctx.lock_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => return self.drop_entry(&job_id, DropReason::LockContention),
            Err(e) => {
                tracing::error!(worker_id = self.id, job_id = %job_id, error = %e, "Lock backend failed");
                return self.drop_entry(&job_id, DropReason::LockError);
            }
        }

        tracing::info!(
            worker_id = self.id,
            job_id = %job_id,
            priority = %entry.priority,
            "Dispatching job"
        );

        let executor = self.ctx.executor.clone();
        let task_abort = abort.clone();
        let task_job_id = job_id.clone();
        let handle = tokio::spawn(async move { executor.execute(&task_job_id, &task_abort).await });
        let outcome = match handle.await {
            Ok(outcome) => DispatchOutcome::Executed(outcome),
            Err(e) => {
                tracing::error!(worker_id = self.id, job_id = %job_id, error = %e, "Executor task crashed");
                DispatchOutcome::Crashed
            }
        };

        match self.ctx.lock.release(&job_id, &self.holder).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(worker_id = self.id, job_id = %job_id, "Lock expired during the run")
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to release lock; it will expire")
            }
        }
        outcome
    }

    fn drop_entry(&self, job_id: &str, reason: DropReason) -> DispatchOutcome {
        match reason {
            DropReason::LockContention => {
                tracing::warn!(worker_id = self.id, job_id, "Job locked elsewhere, entry discarded")
            }
            _ => tracing::debug!(worker_id = self.id, job_id, reason = reason.as_str(), "Entry discarded"),
        }
        self.ctx.metrics.dropped(job_id, reason);
        DispatchOutcome::Dropped(reason)
    }
}

/// Start `size` workers sharing `ctx`.
pub fn spawn_pool(
    ctx: WorkerContext,
    size: usize,
    intake: CancellationToken,
    abort: CancellationToken,
) -> JoinSet<()> {
    let mut workers = JoinSet::new();
    for id in 0..size {
        let worker = Worker::new(id, ctx.clone());
        workers.spawn(worker.run(intake.clone(), abort.clone()));
    }
    workers
}
