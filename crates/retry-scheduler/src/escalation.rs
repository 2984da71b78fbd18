//! Operator alerts for calls that exhausted their retry budget.

use crate::MailError;
use async_trait::async_trait;
use broadmail_dispatcher::Clock;
use chrono::{DateTime, Utc};
use delivery_queue_database::DeliveryRecord;
use relay_config_and_utils::OperatorConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Sender address used on spooled alerts.
pub const DEFAULT_SENDER: &str = "broadmail-relay@localhost";

/// One message to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorAlert {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub body: String,
}

/// Mail transport for operator alerts.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, alert: &OperatorAlert) -> Result<(), MailError>;
}

/// Who receives escalations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorContact {
    pub address: Option<String>,
    pub name: Option<String>,
    pub subject: String,
}

impl OperatorContact {
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self {
            address: config.address.clone().filter(|a| !a.trim().is_empty()),
            name: config.name.clone().filter(|n| !n.trim().is_empty()),
            subject: config.subject.clone(),
        }
    }
}

/// Tells the operator about a call that will not be retried any more.
///
/// Sending is best effort: a mail failure is logged and not retried, and the
/// record itself is never touched.
pub struct EscalationNotifier {
    contact: OperatorContact,
    mailer: Arc<dyn Mailer>,
}

impl EscalationNotifier {
    pub fn new(contact: OperatorContact, mailer: Arc<dyn Mailer>) -> Self {
        Self { contact, mailer }
    }

    pub async fn notify(&self, record: &DeliveryRecord) {
        error!(
            record_id = %record.id(),
            status = %record.status(),
            retry_count = record.retry_count(),
            error = %record.error_message(),
            "Delivery permanently failed"
        );

        let Some(address) = self.contact.address.clone() else {
            warn!(record_id = %record.id(), "No operator address configured; alert not mailed");
            return;
        };

        let alert = OperatorAlert {
            to: address,
            to_name: self.contact.name.clone(),
            subject: self.contact.subject.clone(),
            body: format!("{}\n{}\n", record.status(), record.error_message()),
        };

        match self.mailer.send(&alert).await {
            Ok(()) => info!(record_id = %record.id(), to = %alert.to, "Operator alert sent"),
            Err(e) => warn!(record_id = %record.id(), to = %alert.to, error = %e, "Failed to send operator alert"),
        }
    }
}

/// Writes each alert as an RFC 5322 message file for a local MTA to pick up.
#[derive(Debug, Clone)]
pub struct SpoolMailer {
    dir: PathBuf,
    sender: String,
    clock: Arc<dyn Clock>,
}

impl SpoolMailer {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            sender: DEFAULT_SENDER.to_string(),
            clock,
        }
    }

    fn render(&self, alert: &OperatorAlert, date: DateTime<Utc>) -> Result<String, MailError> {
        let from = header_value("From", &self.sender)?;
        let to = header_value("To", &alert.to)?;
        let subject = header_value("Subject", &alert.subject)?;
        let to = match &alert.to_name {
            Some(name) => format!("\"{}\" <{}>", header_value("To", name)?.replace('"', "'"), to),
            None => format!("<{}>", to),
        };

        let mut message = String::new();
        message.push_str(&format!("From: <{}>\r\n", from));
        message.push_str(&format!("To: {}\r\n", to));
        message.push_str(&format!("Subject: {}\r\n", subject));
        message.push_str(&format!("Date: {}\r\n", date.to_rfc2822()));
        message.push_str(&format!("Message-ID: <{}@broadmail-relay>\r\n", Uuid::new_v4()));
        message.push_str("MIME-Version: 1.0\r\n");
        message.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        message.push_str("Content-Transfer-Encoding: 8bit\r\n");
        message.push_str("\r\n");
        for line in alert.body.lines() {
            message.push_str(line);
            message.push_str("\r\n");
        }
        Ok(message)
    }
}

#[async_trait]
impl Mailer for SpoolMailer {
    async fn send(&self, alert: &OperatorAlert) -> Result<(), MailError> {
        let now = self.clock.now();
        let message = self.render(alert, now)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let name = format!(
            "{}-{}",
            now.format("%Y%m%dT%H%M%S%.6fZ"),
            Uuid::new_v4().simple()
        );
        // Write under a dot name first so the pickup never sees a partial file.
        let partial = self.dir.join(format!(".{}.tmp", name));
        let path = self.dir.join(format!("{}.eml", name));
        tokio::fs::write(&partial, message).await?;
        tokio::fs::rename(&partial, &path).await?;

        debug!(path = %path.display(), "Spooled operator alert");
        Ok(())
    }
}

/// Emits alerts through tracing only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, alert: &OperatorAlert) -> Result<(), MailError> {
        error!(
            to = %alert.to,
            subject = %alert.subject,
            body = %alert.body.trim_end(),
            "Operator alert"
        );
        Ok(())
    }
}

fn header_value<'a>(name: &'static str, value: &'a str) -> Result<&'a str, MailError> {
    if value.contains(['\r', '\n']) {
        return Err(MailError::InvalidHeader { name });
    }
    Ok(value)
}
