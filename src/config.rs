use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::scheduler::job::JobDefinition;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Identifies this process in lock holder values.
    pub instance_id: String,
    pub max_workers: usize,
    pub max_queue_depth: usize,
    pub lock_ttl_secs: u64,
    pub drain_timeout_secs: u64,
    pub notify_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("scheduler-{}", std::process::id()),
            max_workers: 5,
            max_queue_depth: 1000,
            lock_ttl_secs: 3600,
            drain_timeout_secs: 30,
            notify_timeout_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }
}

/// Exponential backoff between attempts of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_secs: u64,
    pub multiplier: u32,
    pub max_delay_secs: u64,
    /// Used for job definitions that omit `max_retries`.
    pub default_max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            multiplier: 2,
            max_delay_secs: 3600,
            default_max_retries: 3,
        }
    }
}

/// Container runtime settings for training jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Path or name of the docker CLI
    pub docker_binary: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "16g")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "4")
    pub cpu_limit: Option<String>,
    /// Passed to `--gpus` (e.g., "all", "device=0")
    pub gpus: Option<String>,
    /// Host path or named volume holding checkpoints
    pub checkpoint_volume: Option<String>,
    /// Where the checkpoint volume is mounted inside the container
    pub checkpoint_mount: String,
    /// Extra environment passed to every container
    pub env: BTreeMap<String, String>,
    /// Lines of container log kept as the failure reason
    pub log_tail_lines: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            network_disabled: false,
            memory_limit: None,
            cpu_limit: None,
            gpus: None,
            checkpoint_volume: None,
            checkpoint_mount: "/checkpoints".to_string(),
            env: BTreeMap::new(),
            log_tail_lines: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LockConfig {
    #[default]
    Memory,
    Redis {
        url: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    File {
        dir: PathBuf,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Slack-compatible incoming webhook
    pub webhook_url: Option<String>,
    pub email: Option<EmailConfig>,
}

/// SMTP delivery. The sender address doubles as the login user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp_server: String,
    pub smtp_port: u16,
    pub sender_email: String,
    #[serde(skip_serializing)]
    pub sender_password: Option<String>,
    pub recipient_emails: Vec<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_server: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            sender_email: String::new(),
            sender_password: None,
            recipient_emails: Vec::new(),
        }
    }
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("smtp_server", &self.smtp_server)
            .field("smtp_port", &self.smtp_port)
            .field("sender_email", &self.sender_email)
            .field("sender_password", &self.sender_password.as_ref().map(|_| "<redacted>"))
            .field("recipient_emails", &self.recipient_emails)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub backend: BackendConfig,
    pub lock: LockConfig,
    pub store: StoreConfig,
    pub notifications: NotificationConfig,
    pub api: ApiConfig,
    pub log_level: String,
    /// Registered at startup, in file order.
    pub jobs: Vec<JobDefinition>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            backend: BackendConfig::default(),
            lock: LockConfig::default(),
            store: StoreConfig::default(),
            notifications: NotificationConfig::default(),
            api: ApiConfig::default(),
            log_level: "info".to_string(),
            jobs: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Read YAML from `path` and apply environment overrides.
    ///
    /// A missing file is not an error: defaults are used and a warning logged.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_yaml(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(OrchestratorError::Configuration(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        config.apply_overrides(env_opt)?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| OrchestratorError::Configuration(format!("invalid config: {e}")))
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("MAX_WORKERS") {
            self.scheduler.max_workers = parse_var("MAX_WORKERS", &v)?;
        }
        if let Some(v) = lookup("LOCK_TTL_SECS") {
            self.scheduler.lock_ttl_secs = parse_var("LOCK_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("INSTANCE_ID") {
            self.scheduler.instance_id = v;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.lock = LockConfig::Redis { url };
        }
        if let Some(dir) = lookup("JOB_STORE_DIR") {
            self.store = StoreConfig::File {
                dir: PathBuf::from(dir),
            };
        }
        if let Some(url) = lookup("SLACK_WEBHOOK_URL") {
            self.notifications.webhook_url = Some(url);
        }
        if let Some(sender) = lookup("SENDER_EMAIL") {
            self.email_mut().sender_email = sender;
        }
        if let Some(server) = lookup("SMTP_SERVER") {
            self.email_mut().smtp_server = server;
        }
        if let Some(v) = lookup("SMTP_PORT") {
            self.email_mut().smtp_port = parse_var("SMTP_PORT", &v)?;
        }
        if let Some(password) = lookup("SENDER_PASSWORD") {
            self.email_mut().sender_password = Some(password);
        }
        if let Some(list) = lookup("RECIPIENT_EMAILS") {
            self.email_mut().recipient_emails = list
                .split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("API_PORT") {
            let port: u16 = parse_var("API_PORT", &v)?;
            self.api.listen_addr.set_port(port);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    fn email_mut(&mut self) -> &mut EmailConfig {
        self.notifications
            .email
            .get_or_insert_with(EmailConfig::default)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(email) = &self.notifications.email {
            if email.sender_email.trim().is_empty() {
                return Err(invalid("notifications.email.sender_email is required"));
            }
            if email.recipient_emails.is_empty() {
                return Err(invalid(
                    "notifications.email.recipient_emails needs at least one address",
                ));
            }
        }
        let s = &self.scheduler;
        if s.max_workers == 0 {
            return Err(invalid("scheduler.max_workers must be at least 1"));
        }
        if s.max_queue_depth == 0 {
            return Err(invalid("scheduler.max_queue_depth must be at least 1"));
        }
        if s.lock_ttl_secs == 0 {
            return Err(invalid("scheduler.lock_ttl_secs must be at least 1"));
        }
        let r = &self.retry;
        if r.multiplier < 1 {
            return Err(invalid("retry.multiplier must be at least 1"));
        }
        if r.base_delay_secs > r.max_delay_secs {
            return Err(invalid(
                "retry.base_delay_secs must not exceed retry.max_delay_secs",
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| invalid(&format!("{key} has invalid value '{value}'")))
}

fn invalid(msg: &str) -> OrchestratorError {
    OrchestratorError::Configuration(msg.to_string())
}
