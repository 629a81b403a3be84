//! Durable mirror of job state.
//!
//! In-memory state stays authoritative while the process runs; the store is
//! only read at startup to rehydrate jobs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::scheduler::job::{JobStatus, ScheduledJob};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, scheduled: &ScheduledJob) -> StoreResult<()>;

    /// Every stored job whose status is in `statuses`, sorted by id.
    async fn load(&self, statuses: &[JobStatus]) -> StoreResult<Vec<ScheduledJob>>;

    async fn delete(&self, job_id: &str) -> StoreResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<String, ScheduledJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, job_id: &str) -> Option<ScheduledJob> {
        self.records.read().await.get(job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, scheduled: &ScheduledJob) -> StoreResult<()> {
        self.records
            .write()
            .await
            .insert(scheduled.id().to_string(), scheduled.clone());
        Ok(())
    }

    async fn load(&self, statuses: &[JobStatus]) -> StoreResult<Vec<ScheduledJob>> {
        let mut jobs: Vec<ScheduledJob> = self
            .records
            .read()
            .await
            .values()
            .filter(|s| statuses.contains(&s.job.status()))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(jobs)
    }

    async fn delete(&self, job_id: &str) -> StoreResult<()> {
        self.records.write().await.remove(job_id);
        Ok(())
    }
}

/// One JSON document per job under `dir`, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
        tracing::info!(dir = %dir.display(), "Opened job store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(job_id)))
    }
}

/// Percent-encode every byte outside `[A-Za-z0-9_-]`.
///
/// Job ids come from config and API callers. The mapping keeps them inside
/// `dir` and is injective, so two ids never share a record.
fn file_stem(job_id: &str) -> String {
    let mut stem = String::with_capacity(job_id.len());
    for byte in job_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

#[async_trait]
impl JobStore for JsonFileStore {
    async fn save(&self, scheduled: &ScheduledJob) -> StoreResult<()> {
        let path = self.record_path(scheduled.id());
        // Concurrent saves of one job each get their own temp file.
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        let body = serde_json::to_vec_pretty(scheduled).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }

    async fn load(&self, statuses: &[JobStatus]) -> StoreResult<Vec<ScheduledJob>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let mut jobs = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(StoreError::Io {
                        path: self.dir.clone(),
                        source,
                    })
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|source| StoreError::Io {
                    path: path.clone(),
                    source,
                })?;
            match serde_json::from_slice::<ScheduledJob>(&bytes) {
                Ok(scheduled) if statuses.contains(&scheduled.job.status()) => {
                    jobs.push(scheduled)
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping corrupt job record");
                }
            }
        }
        jobs.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(jobs)
    }

    async fn delete(&self, job_id: &str) -> StoreResult<()> {
        let path = self.record_path(job_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}
