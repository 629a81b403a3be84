use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};
use crate::scheduler::job::JobDefinition;

/// One scheduled instant for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFire {
    pub job_id: String,
    pub scheduled_for: DateTime<Utc>,
}

/// Parse a cron expression eagerly.
///
/// The `cron` crate wants a leading seconds field; standard 5-field crontab
/// expressions get `0` prepended. 6- and 7-field expressions pass through.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {trimmed}"),
        6 | 7 => trimmed.to_string(),
        n => {
            return Err(OrchestratorError::Configuration(format!(
                "invalid schedule '{expr}': expected 5 to 7 fields, got {n}"
            )))
        }
    };
    Schedule::from_str(&normalized).map_err(|e| {
        OrchestratorError::Configuration(format!("invalid schedule '{expr}': {e}"))
    })
}

/// Next `count` instants of `expr` after `after`.
pub fn upcoming(expr: &str, after: DateTime<Utc>, count: usize) -> Result<Vec<DateTime<Utc>>> {
    let schedule = parse_schedule(expr)?;
    Ok(schedule.after(&after).take(count).collect())
}

/// Group upcoming instants by job id, for the `next` command.
pub fn upcoming_by_job(
    definitions: &[JobDefinition],
    after: DateTime<Utc>,
    count: usize,
) -> Result<BTreeMap<String, Vec<DateTime<Utc>>>> {
    definitions
        .iter()
        .map(|def| {
            upcoming(&def.schedule, after, count)
                .map(|instants| (def.job_id.clone(), instants))
        })
        .collect()
}

struct Binding {
    schedule: Schedule,
    cancel: CancellationToken,
}

/// Turns cron schedules into a stream of [`TriggerFire`]s.
///
/// Each bound job gets its own task that sleeps until the next instant and
/// then sends a fire on the shared channel.
pub struct CronTriggerSource {
    bindings: Mutex<HashMap<String, Binding>>,
    fires: mpsc::Sender<TriggerFire>,
    shutdown: CancellationToken,
}

impl CronTriggerSource {
    pub fn new(fires: mpsc::Sender<TriggerFire>) -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            fires,
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind `job_id` to `expr`, replacing any existing binding.
    pub fn schedule(&self, job_id: &str, expr: &str) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        let schedule = parse_schedule(expr)?;
        let cancel = self.shutdown.child_token();

        let previous = self.lock().insert(
            job_id.to_string(),
            Binding {
                schedule: schedule.clone(),
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let job_id = job_id.to_string();
        let fires = self.fires.clone();
        tokio::spawn(async move {
            run_binding(job_id, schedule, fires, cancel).await;
        });
        Ok(())
    }

    /// Stop firing for `job_id`. Returns false if it was not bound.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.lock().remove(job_id) {
            Some(binding) => {
                binding.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn next_fire(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.lock()
            .get(job_id)
            .and_then(|binding| binding.schedule.upcoming(Utc).next())
    }

    pub fn is_scheduled(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Cancel every binding and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Binding>> {
        self.bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for CronTriggerSource {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_binding(
    job_id: String,
    schedule: Schedule,
    fires: mpsc::Sender<TriggerFire>,
    cancel: CancellationToken,
) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            tracing::info!(job_id = %job_id, "Schedule has no further instants");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let fire = TriggerFire {
            job_id: job_id.clone(),
            scheduled_for: next,
        };
        tracing::debug!(job_id = %job_id, scheduled_for = %next, "Trigger fired");
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = fires.send(fire) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}
