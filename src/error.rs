use thiserror::Error;

use crate::lock::LockError;
use crate::scheduler::JobStatus;
use crate::store::StoreError;
use crate::worker::backend::BackendError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    JobAlreadyExists(String),

    #[error("Job {0} is running")]
    JobRunning(String),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} depends on unknown job {dependency}")]
    UnknownDependency { job_id: String, dependency: String },

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_path() {
        let err = OrchestratorError::DependencyCycle(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert_eq!(err.to_string(), "Dependency cycle: a -> b -> a");
    }

    #[test]
    fn transition_message_uses_status_names() {
        let err = OrchestratorError::InvalidTransition {
            job_id: "train".to_string(),
            from: JobStatus::Completed,
            to: JobStatus::Retrying,
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition for job train: completed -> retrying"
        );
    }
}
