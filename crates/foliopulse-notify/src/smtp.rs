//! SMTP transport via async lettre.

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor,
    message::Mailbox, message::header::ContentType,
    transport::smtp::authentication::Credentials,
};

use foliopulse_core::config::MailConfig;
use foliopulse_core::error::{FolioError, Result};

use crate::provider::{BatchOutcome, EmailProvider, OutboundEmail};

/// Real SMTP delivery. Sends each message of a batch individually, so
/// acceptance is reported per recipient — one bad address does not sink
/// the rest of the batch.
pub struct SmtpMailer {
    config: MailConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: MailConfig) -> Result<Self> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| FolioError::Mail(format!("SMTP relay: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();
        Ok(Self { config, transport })
    }

    fn build_message(&self, msg: &OutboundEmail) -> Result<LettreMessage> {
        let from: Mailbox = format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| FolioError::Mail(format!("Invalid from: {e}")))?;
        let to: Mailbox = format!("{} <{}>", msg.to_name, msg.to)
            .parse()
            .map_err(|e| FolioError::Mail(format!("Invalid to {}: {e}", msg.to)))?;
        LettreMessage::builder()
            .from(from)
            .to(to)
            .subject(&msg.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(msg.body.clone())
            .map_err(|e| FolioError::Mail(format!("Build email: {e}")))
    }
}

#[async_trait]
impl EmailProvider for SmtpMailer {
    async fn send_batch(&self, messages: &[OutboundEmail]) -> Result<BatchOutcome> {
        let mut accepted = Vec::with_capacity(messages.len());
        for msg in messages {
            let email = match self.build_message(msg) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("✉️ Skipping malformed message to {}: {e}", msg.to);
                    accepted.push(false);
                    continue;
                }
            };
            match self.transport.send(email).await {
                Ok(_) => {
                    tracing::debug!("📤 Email accepted for {}", msg.to);
                    accepted.push(true);
                }
                Err(e) => {
                    tracing::warn!("✉️ SMTP rejected {}: {e}", msg.to);
                    accepted.push(false);
                }
            }
        }
        // Nothing got through: report a batch failure so the dispatcher retries.
        if !messages.is_empty() && accepted.iter().all(|ok| !ok) {
            return Err(FolioError::Mail("SMTP rejected entire batch".into()));
        }
        Ok(BatchOutcome::PerMessage(accepted))
    }

    fn name(&self) -> &str {
        "smtp"
    }
}
