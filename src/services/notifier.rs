//! Outbound notification dispatch.
//!
//! Renewal reminders are best-effort: a failed send is logged and
//! retried on the next sweep, never propagated into the sweep itself.

use crate::config::SmtpConfig;
use crate::error::AppError;
use crate::models::PlanTier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use secrecy::ExposeSecret;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Dispatch a renewal reminder. Implementations own recipient
    /// resolution for the user id.
    async fn send_renewal_reminder(
        &self,
        user_id: &str,
        plan: PlanTier,
        expiry_date: DateTime<Utc>,
        days_left: i64,
    ) -> Result<(), AppError>;
}

/// SMTP-backed notifier. Account ids are the account email address,
/// issued by the upstream auth layer.
pub struct SmtpNotifier {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Result<Self, AppError> {
        if !config.enabled {
            return Ok(Self {
                config,
                transport: None,
            });
        }

        let creds = Credentials::new(
            config.user.clone(),
            config.password.expose_secret().clone(),
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| AppError::EmailError(format!("Failed to create SMTP relay: {}", e)))?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            transport: Some(transport),
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send_renewal_reminder(
        &self,
        user_id: &str,
        plan: PlanTier,
        expiry_date: DateTime<Utc>,
        days_left: i64,
    ) -> Result<(), AppError> {
        let Some(transport) = self.transport.as_ref() else {
            tracing::debug!(user_id = %user_id, "SMTP disabled; skipping renewal reminder");
            return Ok(());
        };

        let from_mailbox: Mailbox =
            format!("{} <{}>", self.config.from_name, self.config.from_email)
                .parse()
                .map_err(|e| AppError::EmailError(format!("Invalid from address: {}", e)))?;
        let to_mailbox: Mailbox = user_id
            .parse()
            .map_err(|e| AppError::EmailError(format!("Invalid recipient: {}", e)))?;

        let subject = format!("Your {} plan renews in {} days", plan.as_str(), days_left);
        let body = format!(
            "Your {} subscription is paid through {}. Renew before then to keep \
             your plan benefits without interruption.",
            plan.as_str(),
            expiry_date.format("%Y-%m-%d"),
        );

        let message = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| AppError::EmailError(format!("Failed to build message: {}", e)))?;

        transport
            .send(message)
            .await
            .map_err(|e| AppError::EmailError(format!("Failed to send email: {}", e)))?;

        tracing::info!(
            user_id = %user_id,
            days_left = days_left,
            "Renewal reminder sent"
        );
        Ok(())
    }
}

/// Counting notifier for tests and SMTP-less deployments.
#[derive(Default)]
pub struct MockNotifier {
    send_count: AtomicU64,
    recipients: Mutex<Vec<String>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }

    pub fn recipients(&self) -> Vec<String> {
        self.recipients.lock().expect("notifier mutex poisoned").clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send_renewal_reminder(
        &self,
        user_id: &str,
        _plan: PlanTier,
        _expiry_date: DateTime<Utc>,
        days_left: i64,
    ) -> Result<(), AppError> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        self.recipients
            .lock()
            .expect("notifier mutex poisoned")
            .push(user_id.to_string());
        tracing::info!(
            user_id = %user_id,
            days_left = days_left,
            "[MOCK] Renewal reminder would be sent"
        );
        Ok(())
    }
}
