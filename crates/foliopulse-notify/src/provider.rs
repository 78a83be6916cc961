//! Email provider seam.
//!
//! The engine only needs "send this batch, tell me who was accepted".
//! Providers that can report per-recipient acceptance do; providers that
//! only return an aggregate verdict use [`BatchOutcome::Aggregate`] and the
//! dispatcher counts the whole batch on success, zero on failure.

use async_trait::async_trait;

use foliopulse_core::Result;

/// One rendered message, ready to hand to a provider.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub to_name: String,
    pub subject: String,
    pub body: String,
}

/// What a provider reports back for one batch call.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    /// Acceptance per message, in submission order.
    PerMessage(Vec<bool>),
    /// The provider only knows the batch as a whole succeeded.
    Aggregate,
}

impl BatchOutcome {
    /// Number of messages counted as sent out of `submitted`.
    pub fn accepted(&self, submitted: usize) -> usize {
        match self {
            BatchOutcome::PerMessage(flags) => flags.iter().filter(|ok| **ok).count(),
            BatchOutcome::Aggregate => submitted,
        }
    }
}

/// Outbound email transport. `Err` means the batch as a whole failed and
/// may be retried; a returned outcome is final for this attempt.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send_batch(&self, messages: &[OutboundEmail]) -> Result<BatchOutcome>;

    fn name(&self) -> &str;
}

/// Explicit dry-run transport: logs each message and accepts it. Selected
/// via `mail.dry_run` in config so local environments behave identically
/// on both trigger paths.
pub struct DryRunMailer;

#[async_trait]
impl EmailProvider for DryRunMailer {
    async fn send_batch(&self, messages: &[OutboundEmail]) -> Result<BatchOutcome> {
        for msg in messages {
            tracing::info!("📭 [dry-run] to={} subject={:?}", msg.to, msg.subject);
        }
        Ok(BatchOutcome::PerMessage(vec![true; messages.len()]))
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}
