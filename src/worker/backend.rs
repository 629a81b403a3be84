use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::BackendConfig;
use crate::scheduler::job::Job;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Submission rejected: {0}")]
    Rejected(String),

    #[error("Lost track of submission {0}: {1}")]
    Monitor(String, String),

    #[error("Failed to stop submission {0}: {1}")]
    Cancel(String, String),
}

/// Everything a backend needs to run one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub job_id: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub attempt: u32,
}

impl ExecutionRequest {
    /// Build the request for the job's current attempt.
    ///
    /// A retry of a job with a checkpoint path resumes from that checkpoint.
    pub fn from_job(job: &Job) -> Self {
        let mut command = job.command.clone();
        let mut env = BTreeMap::new();
        env.insert("JOB_ID".to_string(), job.job_id.clone());
        if let Some(path) = &job.checkpoint_path {
            env.insert("CHECKPOINT_DIR".to_string(), path.clone());
            if job.retry_count() > 0 {
                command.push("--resume-from-checkpoint".to_string());
                command.push(path.clone());
            }
        }
        Self {
            job_id: job.job_id.clone(),
            image: job.image.clone(),
            command,
            env,
            attempt: job.retry_count() + 1,
        }
    }

    pub fn resumes_from_checkpoint(&self) -> bool {
        self.command.iter().any(|arg| arg == "--resume-from-checkpoint")
    }
}

/// Backend-specific identifier of a submitted attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionHandle {
    pub id: String,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptStatus {
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        message: String,
    },
}

impl AttemptStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptStatus::Succeeded)
    }
}

#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    async fn submit(&self, request: &ExecutionRequest) -> Result<SubmissionHandle, BackendError>;

    /// Wait for the attempt to finish.
    async fn monitor(&self, handle: &SubmissionHandle) -> Result<AttemptStatus, BackendError>;

    /// Stop a submitted attempt whose monitor was abandoned. Must be safe to
    /// call on an attempt that already finished.
    async fn cancel(&self, handle: &SubmissionHandle) -> Result<(), BackendError>;

    fn name(&self) -> &'static str;
}

/// Runs each attempt as a detached Docker container.
///
/// Containers get:
/// - Dropped capabilities and no privilege escalation
/// - Optional memory, CPU and GPU limits
/// - The checkpoint volume mounted when configured
/// - Labels identifying the job and attempt
#[derive(Debug, Clone)]
pub struct DockerBackend {
    config: BackendConfig,
}

impl DockerBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    /// Arguments for `docker run`.
    pub fn run_args(&self, request: &ExecutionRequest) -> Vec<String> {
        let cfg = &self.config;
        let mut args = vec!["run".to_string(), "-d".to_string()];

        args.push(format!(
            "--name={}-{}-{}",
            container_safe(&request.job_id),
            request.attempt,
            uuid::Uuid::new_v4().simple()
        ));
        args.push(format!("--label=job-orchestrator.job-id={}", request.job_id));
        args.push(format!("--label=job-orchestrator.attempt={}", request.attempt));

        if cfg.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = cfg.memory_limit {
            args.push(format!("--memory={limit}"));
        }
        if let Some(ref limit) = cfg.cpu_limit {
            args.push(format!("--cpus={limit}"));
        }
        if let Some(ref gpus) = cfg.gpus {
            args.push(format!("--gpus={gpus}"));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());

        if let Some(ref volume) = cfg.checkpoint_volume {
            args.push(format!("--volume={volume}:{}", cfg.checkpoint_mount));
        }

        let mut env = cfg.env.clone();
        env.extend(request.env.clone());
        for (key, value) in &env {
            args.push(format!("--env={key}={value}"));
        }

        args.push(request.image.clone());
        args.extend(request.command.iter().cloned());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<std::process::Output, BackendError> {
        Command::new(&self.config.docker_binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| BackendError::Spawn {
                program: self.config.docker_binary.clone(),
                source,
            })
    }

    async fn log_tail(&self, container: &str) -> String {
        let args = vec![
            "logs".to_string(),
            format!("--tail={}", self.config.log_tail_lines),
            container.to_string(),
        ];
        match self.docker(&args).await {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                text.trim().to_string()
            }
            Err(e) => format!("<logs unavailable: {e}>"),
        }
    }

    async fn remove(&self, container: &str) {
        let args = vec!["rm".to_string(), "-f".to_string(), container.to_string()];
        if let Err(e) = self.docker(&args).await {
            tracing::warn!(container, error = %e, "Failed to remove container");
        }
    }
}

fn container_safe(job_id: &str) -> String {
    job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Map the output of `docker wait` to an attempt status.
fn classify_exit(wait_stdout: &str, logs: impl FnOnce() -> String) -> AttemptStatus {
    match wait_stdout.trim().parse::<i32>() {
        Ok(0) => AttemptStatus::Succeeded,
        Ok(code) => {
            let tail = logs();
            let message = if tail.is_empty() {
                format!("Exit code: {code}")
            } else {
                format!("Exit code: {code}: {tail}")
            };
            AttemptStatus::Failed {
                exit_code: Some(code),
                message,
            }
        }
        Err(_) => AttemptStatus::Failed {
            exit_code: None,
            message: format!("unexpected wait output: {}", wait_stdout.trim()),
        },
    }
}

#[async_trait]
impl ExecutorBackend for DockerBackend {
    async fn submit(&self, request: &ExecutionRequest) -> Result<SubmissionHandle, BackendError> {
        tracing::info!(
            job_id = %request.job_id,
            image = %request.image,
            attempt = request.attempt,
            "Submitting container"
        );
        let output = self.docker(&self.run_args(request)).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BackendError::Rejected(if stderr.is_empty() {
                format!("Exit code: {:?}", output.status.code())
            } else {
                stderr
            }));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(SubmissionHandle {
            id,
            job_id: request.job_id.clone(),
        })
    }

    async fn monitor(&self, handle: &SubmissionHandle) -> Result<AttemptStatus, BackendError> {
        let args = vec!["wait".to_string(), handle.id.clone()];
        let output = self.docker(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            self.remove(&handle.id).await;
            return Err(BackendError::Monitor(handle.id.clone(), stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let mut tail = String::new();
        let needs_logs = stdout.trim() != "0";
        if needs_logs {
            tail = self.log_tail(&handle.id).await;
        }
        let status = classify_exit(&stdout, || tail);

        tracing::info!(
            job_id = %handle.job_id,
            container = %handle.id,
            success = status.is_success(),
            "Container finished"
        );
        self.remove(&handle.id).await;
        Ok(status)
    }

    async fn cancel(&self, handle: &SubmissionHandle) -> Result<(), BackendError> {
        tracing::info!(job_id = %handle.job_id, container = %handle.id, "Killing container");
        let args = vec!["rm".to_string(), "-f".to_string(), handle.id.clone()];
        let output = self.docker(&args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("No such container") {
            Ok(())
        } else {
            Err(BackendError::Cancel(handle.id.clone(), stderr.trim().to_string()))
        }
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job() -> Job {
        Job::new(
            "train/001",
            "resnet50",
            "trainer:latest",
            vec!["python".to_string(), "train.py".to_string()],
            "0 2 * * *",
            2,
        )
        .with_checkpoint("/checkpoints/resnet50")
    }

    #[test]
    fn first_attempt_does_not_resume() {
        let request = ExecutionRequest::from_job(&job());
        assert_eq!(request.command, vec!["python", "train.py"]);
        assert!(!request.resumes_from_checkpoint());
        assert_eq!(request.attempt, 1);
        assert_eq!(request.env.get("JOB_ID").map(String::as_str), Some("train/001"));
        assert_eq!(
            request.env.get("CHECKPOINT_DIR").map(String::as_str),
            Some("/checkpoints/resnet50")
        );
    }

    #[test]
    fn retry_resumes_from_checkpoint() {
        let mut job = job();
        job.start(Utc::now()).unwrap();
        job.fail_attempt("oom", Utc::now()).unwrap();
        job.start(Utc::now()).unwrap();

        let request = ExecutionRequest::from_job(&job);
        assert_eq!(
            request.command,
            vec![
                "python",
                "train.py",
                "--resume-from-checkpoint",
                "/checkpoints/resnet50"
            ]
        );
        assert_eq!(request.attempt, 2);
    }

    #[test]
    fn retry_without_checkpoint_reruns_command() {
        let mut job = Job::new("a", "a", "img", vec!["run".to_string()], "0 * * * *", 1);
        job.start(Utc::now()).unwrap();
        job.fail_attempt("x", Utc::now()).unwrap();
        let request = ExecutionRequest::from_job(&job);
        assert_eq!(request.command, vec!["run"]);
        assert!(!request.env.contains_key("CHECKPOINT_DIR"));
    }

    #[test]
    fn run_args_apply_limits_and_mounts() {
        let backend = DockerBackend::new(BackendConfig {
            network_disabled: true,
            memory_limit: Some("16g".to_string()),
            cpu_limit: Some("4".to_string()),
            gpus: Some("all".to_string()),
            checkpoint_volume: Some("ckpt".to_string()),
            ..Default::default()
        });
        let args = backend.run_args(&ExecutionRequest::from_job(&job()));

        assert_eq!(&args[..2], &["run", "-d"]);
        assert!(args[2].starts_with("--name=train-001-1-"));
        for expected in [
            "--network=none",
            "--memory=16g",
            "--cpus=4",
            "--gpus=all",
            "--cap-drop=ALL",
            "--security-opt=no-new-privileges",
            "--volume=ckpt:/checkpoints",
            "--env=JOB_ID=train/001",
            "--label=job-orchestrator.job-id=train/001",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }
        let image_at = args.iter().position(|a| a == "trainer:latest").unwrap();
        assert_eq!(&args[image_at + 1..], &["python", "train.py"]);
    }

    #[test]
    fn default_args_omit_optional_limits() {
        let backend = DockerBackend::new(BackendConfig::default());
        let args = backend.run_args(&ExecutionRequest::from_job(&job()));
        assert!(!args.iter().any(|a| a.starts_with("--memory")));
        assert!(!args.iter().any(|a| a.starts_with("--gpus")));
        assert!(!args.iter().any(|a| a == "--network=none"));
        assert!(!args.iter().any(|a| a.starts_with("--volume")));
    }

    #[test]
    fn request_env_overrides_config_env() {
        let mut env = BTreeMap::new();
        env.insert("JOB_ID".to_string(), "from-config".to_string());
        env.insert("WANDB_MODE".to_string(), "offline".to_string());
        let backend = DockerBackend::new(BackendConfig {
            env,
            ..Default::default()
        });
        let args = backend.run_args(&ExecutionRequest::from_job(&job()));
        assert!(args.iter().any(|a| a == "--env=JOB_ID=train/001"));
        assert!(args.iter().any(|a| a == "--env=WANDB_MODE=offline"));
        assert!(!args.iter().any(|a| a == "--env=JOB_ID=from-config"));
    }

    #[test]
    fn exit_codes_are_classified() {
        assert_eq!(classify_exit("0\n", String::new), AttemptStatus::Succeeded);

        match classify_exit("137\n", || "Killed".to_string()) {
            AttemptStatus::Failed { exit_code, message } => {
                assert_eq!(exit_code, Some(137));
                assert_eq!(message, "Exit code: 137: Killed");
            }
            other => panic!("unexpected status: {other:?}"),
        }

        assert!(matches!(
            classify_exit("1", String::new),
            AttemptStatus::Failed { ref message, .. } if message == "Exit code: 1"
        ));
        assert!(matches!(
            classify_exit("garbage", String::new),
            AttemptStatus::Failed { exit_code: None, .. }
        ));
    }

    #[tokio::test]
    async fn missing_docker_binary_is_a_spawn_error() {
        let backend = DockerBackend::new(BackendConfig {
            docker_binary: "/nonexistent/docker-binary".to_string(),
            ..Default::default()
        });
        let err = backend
            .submit(&ExecutionRequest::from_job(&job()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));

        let handle = SubmissionHandle {
            id: "abc123".to_string(),
            job_id: "train/001".to_string(),
        };
        assert!(matches!(
            backend.cancel(&handle).await,
            Err(BackendError::Spawn { .. })
        ));
    }
}
