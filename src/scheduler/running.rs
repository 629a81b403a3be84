use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Jobs currently executing in this process, with a count per job.
///
/// Not persisted; starts empty on every boot.
#[derive(Debug, Default)]
pub struct RunningSet {
    counts: Mutex<HashMap<String, usize>>,
}

impl RunningSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether another run of `job_id` would fit under both caps right now.
    pub fn has_capacity(&self, job_id: &str, per_job: usize, global: usize) -> bool {
        let counts = self.lock();
        Self::fits(&counts, job_id, per_job, global)
    }

    /// Atomically check both caps and add `job_id`.
    ///
    /// The returned guard removes the entry when dropped, so a run leaves the set
    /// on every exit path.
    pub fn try_reserve(
        self: &Arc<Self>,
        job_id: &str,
        per_job: usize,
        global: usize,
    ) -> Option<RunningGuard> {
        let mut counts = self.lock();
        if !Self::fits(&counts, job_id, per_job, global) {
            return None;
        }
        *counts.entry(job_id.to_string()).or_insert(0) += 1;
        Some(RunningGuard {
            set: Arc::clone(self),
            job_id: job_id.to_string(),
        })
    }

    pub fn count(&self, job_id: &str) -> usize {
        self.lock().get(job_id).copied().unwrap_or(0)
    }

    /// Total runs in flight across all jobs.
    pub fn len(&self) -> usize {
        self.lock().values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn remove(&self, job_id: &str) {
        let mut counts = self.lock();
        if let Some(count) = counts.get_mut(job_id) {
            *count -= 1;
            if *count == 0 {
                counts.remove(job_id);
            }
        }
    }

    fn fits(counts: &HashMap<String, usize>, job_id: &str, per_job: usize, global: usize) -> bool {
        let total: usize = counts.values().sum();
        let mine = counts.get(job_id).copied().unwrap_or(0);
        total < global && mine < per_job
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Membership in the [`RunningSet`] for one run.
#[derive(Debug)]
pub struct RunningGuard {
    set: Arc<RunningSet>,
    job_id: String,
}

impl RunningGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.set.remove(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_respects_per_job_cap() {
        let set = Arc::new(RunningSet::new());
        let first = set.try_reserve("train", 1, 5);
        assert!(first.is_some());
        assert!(set.try_reserve("train", 1, 5).is_none());
        assert_eq!(set.count("train"), 1);

        drop(first);
        assert_eq!(set.count("train"), 0);
        assert!(!set.contains("train"));
        assert!(set.try_reserve("train", 1, 5).is_some());
    }

    #[test]
    fn reserve_respects_global_cap() {
        let set = Arc::new(RunningSet::new());
        let _a = set.try_reserve("a", 1, 2).unwrap();
        let _b = set.try_reserve("b", 1, 2).unwrap();
        assert!(!set.has_capacity("c", 1, 2));
        assert!(set.try_reserve("c", 1, 2).is_none());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn per_job_cap_above_one_allows_parallel_runs() {
        let set = Arc::new(RunningSet::new());
        let _one = set.try_reserve("sweep", 2, 5).unwrap();
        let _two = set.try_reserve("sweep", 2, 5).unwrap();
        assert!(set.try_reserve("sweep", 2, 5).is_none());
        assert_eq!(set.count("sweep"), 2);
        assert_eq!(set.job_ids(), vec!["sweep".to_string()]);
    }

    #[test]
    fn guard_releases_on_panic() {
        let set = Arc::new(RunningSet::new());
        let inner = set.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = inner.try_reserve("boom", 1, 1).unwrap();
            panic!("executor blew up");
        });
        assert!(result.is_err());
        assert!(set.is_empty());
    }
}
