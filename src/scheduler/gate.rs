//! Dependency gating.
//!
//! Eligibility is evaluated only when a job fires. A dependency that
//! completes between two fires is not noticed until the next fire.

use std::collections::{BTreeSet, HashSet};

use crate::error::{OrchestratorError, Result};
use crate::scheduler::job::{JobStatus, ScheduledJob};
use crate::scheduler::registry::JobRegistry;

/// Dependencies of `scheduled` that are not currently `Completed`.
/// Ids the registry does not know count as unmet.
pub fn unmet_dependencies(registry: &JobRegistry, scheduled: &ScheduledJob) -> Vec<String> {
    scheduled
        .dependencies
        .iter()
        .filter(|dep| registry.status_of(dep) != Some(JobStatus::Completed))
        .cloned()
        .collect()
}

pub fn is_eligible(registry: &JobRegistry, scheduled: &ScheduledJob) -> bool {
    unmet_dependencies(registry, scheduled).is_empty()
}

/// Check a proposed dependency set for `job_id` before it is stored.
///
/// Every dependency must already be registered, and adding the edges must not
/// close a cycle. On a cycle the error carries the path, starting and ending
/// at `job_id`.
pub fn validate_dependencies(
    registry: &JobRegistry,
    job_id: &str,
    dependencies: &BTreeSet<String>,
) -> Result<()> {
    for dep in dependencies {
        if dep == job_id {
            return Err(OrchestratorError::DependencyCycle(vec![
                job_id.to_string(),
                job_id.to_string(),
            ]));
        }
        if !registry.contains(dep) {
            return Err(OrchestratorError::UnknownDependency {
                job_id: job_id.to_string(),
                dependency: dep.clone(),
            });
        }
    }

    let mut visited = HashSet::new();
    for dep in dependencies {
        let mut path = vec![job_id.to_string()];
        if find_path(registry, job_id, dep, &mut path, &mut visited) {
            return Err(OrchestratorError::DependencyCycle(path));
        }
    }
    Ok(())
}

/// Depth-first search from `current` back to `target`. The search stops at
/// `target`, so its stored edges are never followed and an update is checked
/// against the proposed set only.
fn find_path(
    registry: &JobRegistry,
    target: &str,
    current: &str,
    path: &mut Vec<String>,
    visited: &mut HashSet<String>,
) -> bool {
    path.push(current.to_string());
    if !visited.insert(current.to_string()) {
        path.pop();
        return false;
    }

    let edges = match registry.get(current) {
        Some(scheduled) => &scheduled.dependencies,
        None => {
            path.pop();
            return false;
        }
    };
    for next in edges {
        let found = if next == target {
            path.push(next.clone());
            true
        } else {
            find_path(registry, target, next, path, visited)
        };
        if found {
            return true;
        }
    }
    path.pop();
    false
}
