//! Job status notifications.
//!
//! Delivery is best effort. [`NotificationHub`] logs and swallows channel
//! failures so they never reach job state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use thiserror::Error;

use crate::config::EmailConfig;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::scheduler::job::{Job, JobStatus};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook rejected notification with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("SMTP delivery failed: {0}")]
    Smtp(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, job: &Job, message: &str) -> Result<(), NotifyError>;

    fn channel_name(&self) -> &str;
}

/// Writes notifications to the log. Always configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, job: &Job, message: &str) -> Result<(), NotifyError> {
        tracing::info!(
            job_id = %job.job_id,
            status = %job.status(),
            retry_count = job.retry_count(),
            "{message}"
        );
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "log"
    }
}

/// Posts a Slack-compatible attachment to an incoming webhook.
#[derive(Debug)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let url = url.into();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(NotifyError::Config(format!("invalid webhook url: {url}")));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url, client })
    }
}

fn status_colour(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Completed => "good",
        JobStatus::Failed => "danger",
        JobStatus::Retrying => "warning",
        JobStatus::Pending | JobStatus::Running => "#808080",
    }
}

pub fn slack_payload(job: &Job, message: &str, timestamp: i64) -> serde_json::Value {
    json!({
        "attachments": [{
            "color": status_colour(job.status()),
            "title": format!("Training Job: {}", job.name),
            "fields": [
                {"title": "Job ID", "value": job.job_id, "short": true},
                {"title": "Status", "value": job.status().to_string(), "short": true},
                {"title": "Retry Count", "value": job.retry_count().to_string(), "short": true},
                {"title": "Message", "value": message, "short": false},
            ],
            "ts": timestamp,
        }]
    })
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, job: &Job, message: &str) -> Result<(), NotifyError> {
        let payload = slack_payload(job, message, chrono::Utc::now().timestamp());
        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        tracing::debug!(job_id = %job.job_id, "Webhook notification sent");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "webhook"
    }
}

/// Sends an HTML status table over SMTP.
///
/// Port 465 uses implicit TLS, any other port upgrades with STARTTLS. When a
/// password is configured the sender address logs in with it.
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailNotifier {
    pub fn new(config: &EmailConfig, timeout: Duration) -> Result<Self, NotifyError> {
        let from = parse_mailbox(&config.sender_email)?;
        let to = config
            .recipient_emails
            .iter()
            .map(|addr| parse_mailbox(addr))
            .collect::<Result<Vec<_>, _>>()?;
        if to.is_empty() {
            return Err(NotifyError::Config(
                "at least one recipient is required".to_string(),
            ));
        }

        let relay = if config.smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_server)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_server)
        };
        let mut builder = relay
            .map_err(|e| NotifyError::Config(e.to_string()))?
            .port(config.smtp_port)
            .timeout(Some(timeout));
        if let Some(password) = &config.sender_password {
            builder = builder.credentials(Credentials::new(
                config.sender_email.clone(),
                password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }

    pub fn recipients(&self) -> &[Mailbox] {
        &self.to
    }

    fn message(&self, job: &Job, message: &str) -> Result<Message, NotifyError> {
        email_message(job, message, &self.from, &self.to)
    }
}

fn parse_mailbox(addr: &str) -> Result<Mailbox, NotifyError> {
    addr.trim()
        .parse()
        .map_err(|e: lettre::address::AddressError| {
            NotifyError::Config(format!("invalid email address '{addr}': {e}"))
        })
}

pub fn email_subject(job: &Job) -> String {
    format!(
        "Training Job {}: {}",
        job.status().to_string().to_uppercase(),
        job.name
    )
}

pub fn email_body(job: &Job, message: &str) -> String {
    let or_na = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "N/A".to_string())
    };
    let mut body = format!(
        "<html>\n<body>\n<h2>Training Job Status Update</h2>\n\
         <table border=\"1\" cellpadding=\"5\">\n\
         <tr><th>Job ID</th><td>{}</td></tr>\n\
         <tr><th>Name</th><td>{}</td></tr>\n\
         <tr><th>Status</th><td><strong>{}</strong></td></tr>\n\
         <tr><th>Retry Count</th><td>{}/{}</td></tr>\n\
         <tr><th>Started At</th><td>{}</td></tr>\n\
         <tr><th>Completed At</th><td>{}</td></tr>\n\
         </table>\n\
         <p><strong>Message:</strong> {}</p>\n",
        escape_html(&job.job_id),
        escape_html(&job.name),
        job.status(),
        job.retry_count(),
        job.max_retries(),
        or_na(job.started_at()),
        or_na(job.completed_at()),
        escape_html(message),
    );
    if let Some(error) = job.error_message() {
        body.push_str(&format!(
            "<p><strong>Error:</strong> {}</p>\n",
            escape_html(error)
        ));
    }
    body.push_str("</body>\n</html>\n");
    body
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn email_message(
    job: &Job,
    message: &str,
    from: &Mailbox,
    to: &[Mailbox],
) -> Result<Message, NotifyError> {
    let mut builder = Message::builder().from(from.clone());
    for recipient in to {
        builder = builder.to(recipient.clone());
    }
    builder
        .subject(email_subject(job))
        .header(ContentType::TEXT_HTML)
        .body(email_body(job, message))
        .map_err(|e| NotifyError::Smtp(e.to_string()))
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, job: &Job, message: &str) -> Result<(), NotifyError> {
        let email = self.message(job, message)?;
        self.transport
            .send(email)
            .await
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;
        tracing::debug!(job_id = %job.job_id, recipients = self.to.len(), "Email notification sent");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "email"
    }
}

/// Fans one notification out to every channel.
pub struct NotificationHub {
    channels: Vec<Arc<dyn Notifier>>,
    timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl NotificationHub {
    pub fn new(timeout: Duration, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            channels: Vec::new(),
            timeout,
            metrics,
        }
    }

    /// Hub with no channels and no metrics.
    pub fn silent() -> Self {
        Self::new(Duration::from_secs(10), Arc::new(NoopMetrics))
    }

    pub fn with_channel(mut self, channel: Arc<dyn Notifier>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.channel_name()).collect()
    }

    pub async fn notify(&self, job: &Job, message: &str) {
        for channel in &self.channels {
            let outcome = tokio::time::timeout(self.timeout, channel.notify(job, message)).await;
            let success = match outcome {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::warn!(
                        job_id = %job.job_id,
                        channel = channel.channel_name(),
                        error = %e,
                        "Notification failed"
                    );
                    false
                }
                Err(_) => {
                    tracing::warn!(
                        job_id = %job.job_id,
                        channel = channel.channel_name(),
                        timeout_secs = self.timeout.as_secs(),
                        "Notification timed out"
                    );
                    false
                }
            };
            self.metrics.notification(channel.channel_name(), success);
        }
    }
}
