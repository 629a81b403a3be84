use std::collections::HashMap;

use crate::error::{OrchestratorError, Result};
use crate::scheduler::job::{Job, JobStatus, ScheduledJob};

/// Owned table of every job the scheduler knows about.
///
/// Shared as `Arc<RwLock<JobRegistry>>`. The executor changes run state only
/// through [`JobRegistry::transition`]; everything else goes through the
/// scheduler's API.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, ScheduledJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scheduled: ScheduledJob) -> Result<()> {
        if self.jobs.contains_key(scheduled.id()) {
            return Err(OrchestratorError::JobAlreadyExists(
                scheduled.id().to_string(),
            ));
        }
        self.jobs.insert(scheduled.id().to_string(), scheduled);
        Ok(())
    }

    pub fn remove(&mut self, job_id: &str) -> Option<ScheduledJob> {
        self.jobs.remove(job_id)
    }

    pub fn get(&self, job_id: &str) -> Option<&ScheduledJob> {
        self.jobs.get(job_id)
    }

    pub fn get_mut(&mut self, job_id: &str) -> Option<&mut ScheduledJob> {
        self.jobs.get_mut(job_id)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn status_of(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|s| s.job.status())
    }

    /// Apply a state-machine step to one job and return a snapshot of the result.
    pub fn transition<T>(
        &mut self,
        job_id: &str,
        step: impl FnOnce(&mut Job) -> Result<T>,
    ) -> Result<(T, ScheduledJob)> {
        let scheduled = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
        let value = step(&mut scheduled.job)?;
        Ok((value, scheduled.clone()))
    }

    /// All jobs sorted by id.
    pub fn all(&self) -> Vec<&ScheduledJob> {
        let mut jobs: Vec<&ScheduledJob> = self.jobs.values().collect();
        jobs.sort_by(|a, b| a.id().cmp(b.id()));
        jobs
    }

    pub fn with_status(&self, status: JobStatus) -> Vec<&ScheduledJob> {
        self.all()
            .into_iter()
            .filter(|s| s.job.status() == status)
            .collect()
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs
            .values()
            .filter(|s| s.job.status() == status)
            .count()
    }

    /// Jobs that list `job_id` as a dependency.
    pub fn dependents_of(&self, job_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .jobs
            .values()
            .filter(|s| s.dependencies.contains(job_id))
            .map(|s| s.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scheduled(id: &str) -> ScheduledJob {
        ScheduledJob::new(Job::new(
            id,
            id,
            "img:latest",
            vec!["run".to_string()],
            "0 * * * *",
            1,
        ))
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut registry = JobRegistry::new();
        registry.insert(scheduled("a")).unwrap();
        assert!(matches!(
            registry.insert(scheduled("a")),
            Err(OrchestratorError::JobAlreadyExists(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn transition_returns_snapshot() {
        let mut registry = JobRegistry::new();
        registry.insert(scheduled("a")).unwrap();
        let ((), snapshot) = registry
            .transition("a", |job| job.start(Utc::now()))
            .unwrap();
        assert_eq!(snapshot.job.status(), JobStatus::Running);
        assert_eq!(registry.status_of("a"), Some(JobStatus::Running));
        assert_eq!(registry.count_by_status(JobStatus::Running), 1);
    }

    #[test]
    fn transition_on_unknown_job_fails() {
        let mut registry = JobRegistry::new();
        let err = registry
            .transition("ghost", |job| job.start(Utc::now()))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::JobNotFound(_)));
    }

    #[test]
    fn dependents_are_reported() {
        let mut registry = JobRegistry::new();
        registry.insert(scheduled("a")).unwrap();
        registry
            .insert(scheduled("b").with_dependency("a"))
            .unwrap();
        registry
            .insert(scheduled("c").with_dependency("a"))
            .unwrap();
        assert_eq!(registry.dependents_of("a"), vec!["b", "c"]);
        assert!(registry.dependents_of("b").is_empty());
    }
}
