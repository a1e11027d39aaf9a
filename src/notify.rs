//! Notification fabric: a bounded queue of typed jobs drained by a small
//! worker pool. Email goes over SMTP, slack/webhook over HTTP; SMS and push
//! are leaf transports that only log until wired to a provider.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::NotificationsConfig;

const JOB_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from: String,
}

fn build_smtp_transport(cfg: &SmtpConfig) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
    let host = cfg.host.as_deref()?;
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host).ok()?;
    builder = builder.port(cfg.port);
    if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Some(builder.build())
}

#[derive(Debug, Clone)]
pub enum NotificationJob {
    Email {
        to: String,
        subject: String,
        body: String,
    },
    Slack {
        webhook_url: String,
        text: String,
    },
    Webhook {
        url: String,
        payload: serde_json::Value,
    },
    Sms {
        to: String,
        body: String,
    },
    Push {
        device_token: String,
        title: String,
        body: String,
    },
}

impl NotificationJob {
    fn kind(&self) -> &'static str {
        match self {
            NotificationJob::Email { .. } => "email",
            NotificationJob::Slack { .. } => "slack",
            NotificationJob::Webhook { .. } => "webhook",
            NotificationJob::Sms { .. } => "sms",
            NotificationJob::Push { .. } => "push",
        }
    }
}

/// Linear-minutes back-off between delivery attempts.
fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(60 * u64::from(attempt))
}

/// Cheap cloneable handle for submitting jobs; never blocks the caller.
#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::Sender<NotificationJob>,
}

impl NotificationSender {
    pub fn send(&self, job: NotificationJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("notification queue full, dropping job: {e}");
                false
            }
        }
    }
}

pub struct NotificationFabric {
    tx: mpsc::Sender<NotificationJob>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationFabric {
    pub fn spawn(config: NotificationsConfig, smtp: SmtpConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let smtp_transport = build_smtp_transport(&smtp);
        if smtp_transport.is_some() {
            tracing::info!("notification fabric: SMTP configured for email delivery");
        }

        let mut handles = Vec::new();
        for _ in 0..config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let mut shutdown = shutdown_tx.subscribe();
            let smtp = smtp.clone();
            let transport = smtp_transport.clone();
            handles.push(tokio::spawn(async move {
                let http_client = reqwest::Client::new();
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            job = rx.recv() => job,
                            _ = shutdown.changed() => return,
                        }
                    };
                    let Some(job) = job else { return };
                    deliver_with_retries(&http_client, &smtp, &transport, job).await;
                }
            }));
        }

        Arc::new(Self {
            tx,
            shutdown_tx,
            handles: Mutex::new(handles),
        })
    }

    pub fn sender(&self) -> NotificationSender {
        NotificationSender {
            tx: self.tx.clone(),
        }
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn deliver_with_retries(
    http_client: &reqwest::Client,
    smtp: &SmtpConfig,
    transport: &Option<AsyncSmtpTransport<Tokio1Executor>>,
    job: NotificationJob,
) {
    for attempt in 1..=MAX_ATTEMPTS {
        let result = tokio::time::timeout(
            JOB_TIMEOUT,
            deliver_once(http_client, smtp, transport, &job),
        )
        .await;
        match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                tracing::warn!(
                    "{} notification attempt {attempt}/{MAX_ATTEMPTS} failed: {e}",
                    job.kind()
                );
            }
            Err(_) => {
                tracing::warn!(
                    "{} notification attempt {attempt}/{MAX_ATTEMPTS} timed out",
                    job.kind()
                );
            }
        }
        if attempt < MAX_ATTEMPTS {
            tokio::time::sleep(retry_delay(attempt)).await;
        }
    }
    tracing::error!("{} notification dropped after {MAX_ATTEMPTS} attempts", job.kind());
}

async fn deliver_once(
    http_client: &reqwest::Client,
    smtp: &SmtpConfig,
    transport: &Option<AsyncSmtpTransport<Tokio1Executor>>,
    job: &NotificationJob,
) -> anyhow::Result<()> {
    match job {
        NotificationJob::Email { to, subject, body } => {
            let Some(transport) = transport else {
                anyhow::bail!("email channel requested but SMTP is not configured");
            };
            let email = Message::builder()
                .from(smtp.from.parse()?)
                .to(to.parse()?)
                .subject(subject)
                .header(ContentType::TEXT_PLAIN)
                .body(body.clone())?;
            transport.send(email).await?;
            Ok(())
        }
        NotificationJob::Slack { webhook_url, text } => {
            http_client
                .post(webhook_url)
                .json(&serde_json::json!({ "text": text }))
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        }
        NotificationJob::Webhook { url, payload } => {
            http_client
                .post(url)
                .json(payload)
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        }
        NotificationJob::Sms { to, body } => {
            tracing::info!("sms transport not configured; would send to {to}: {body}");
            Ok(())
        }
        NotificationJob::Push { device_token, title, .. } => {
            tracing::info!("push transport not configured; would send '{title}' to {device_token}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_minutes() {
        assert_eq!(retry_delay(1), Duration::from_secs(60));
        assert_eq!(retry_delay(2), Duration::from_secs(120));
        assert_eq!(retry_delay(3), Duration::from_secs(180));
    }

    #[tokio::test]
    async fn smtp_transport_requires_host() {
        let cfg = SmtpConfig {
            host: None,
            port: 587,
            user: None,
            pass: None,
            from: "fathom@localhost".to_string(),
        };
        assert!(build_smtp_transport(&cfg).is_none());

        let cfg = SmtpConfig {
            host: Some("smtp.example.com".to_string()),
            ..cfg
        };
        assert!(build_smtp_transport(&cfg).is_some());
    }

    #[tokio::test]
    async fn queue_accepts_and_drains_on_stop() {
        let fabric = NotificationFabric::spawn(
            NotificationsConfig {
                workers: 1,
                queue_size: 4,
            },
            SmtpConfig {
                host: None,
                port: 587,
                user: None,
                pass: None,
                from: "fathom@localhost".to_string(),
            },
        );
        let sender = fabric.sender();
        assert!(sender.send(NotificationJob::Sms {
            to: "+15550100".to_string(),
            body: "budget breach".to_string(),
        }));
        fabric.stop().await;
    }
}
