//! Notification dispatcher — founder grouping, rendering, batched send.
//!
//! A founder with N companies in one run receives exactly one email
//! listing all N companies and the union of newly requested metrics.
//! Batches are capped (provider limit, ≤100) and retried with backoff;
//! an exhausted batch is dropped and counted as zero sent — the data side
//! of the run is already durable, so notification failure is never fatal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};

use foliopulse_core::model::Founder;

use crate::provider::{EmailProvider, OutboundEmail};

/// One "a request was just created" fact, flattened for grouping.
#[derive(Debug, Clone)]
pub struct RequestNotice {
    pub founder: Founder,
    pub company_name: String,
    pub metric_name: String,
    pub due_date: DateTime<Utc>,
}

/// Per-founder digest built from the notices of one run.
#[derive(Debug, Clone)]
struct FounderDigest {
    founder: Founder,
    companies: Vec<String>,
    metrics: Vec<String>,
    due_date: DateTime<Utc>,
}

/// Sends founder digests through an [`EmailProvider`].
pub struct Dispatcher {
    provider: Arc<dyn EmailProvider>,
    batch_size: usize,
    max_retries: u32,
    backoff: Duration,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn EmailProvider>,
        batch_size: usize,
        max_retries: u32,
        backoff: Duration,
    ) -> Self {
        // Provider hard limit is 100 recipients per call.
        Self { provider, batch_size: batch_size.clamp(1, 100), max_retries, backoff }
    }

    /// Group notices by founder, render one message each, send in batches.
    /// Returns the number of emails counted as sent (per-recipient
    /// acceptance when the provider reports it).
    pub async fn dispatch(
        &self,
        notices: &[RequestNotice],
        period: (NaiveDate, NaiveDate),
    ) -> usize {
        if notices.is_empty() {
            return 0;
        }
        let digests = group_by_founder(notices);
        let messages: Vec<OutboundEmail> =
            digests.iter().map(|d| render_digest(d, period)).collect();

        let mut sent = 0;
        for chunk in messages.chunks(self.batch_size) {
            sent += self.send_with_retry(chunk).await;
        }
        tracing::info!(
            "📬 Dispatched {} notification(s) to {} founder(s) via {}",
            sent,
            digests.len(),
            self.provider.name()
        );
        sent
    }

    async fn send_with_retry(&self, chunk: &[OutboundEmail]) -> usize {
        let mut attempt = 0;
        loop {
            match self.provider.send_batch(chunk).await {
                Ok(outcome) => return outcome.accepted(chunk.len()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "✉️ Batch send failed (attempt {attempt}/{}): {e} — retrying",
                        self.max_retries
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(
                        "✉️ Dropping batch of {} after {} attempt(s): {e}",
                        chunk.len(),
                        attempt + 1
                    );
                    return 0;
                }
            }
        }
    }
}

/// One digest per founder: all their companies, union of metric names.
/// BTreeMap keeps output order deterministic for tests and logs.
fn group_by_founder(notices: &[RequestNotice]) -> Vec<FounderDigest> {
    let mut by_founder: BTreeMap<String, FounderDigest> = BTreeMap::new();
    for notice in notices {
        let entry = by_founder.entry(notice.founder.id.clone()).or_insert_with(|| FounderDigest {
            founder: notice.founder.clone(),
            companies: Vec::new(),
            metrics: Vec::new(),
            due_date: notice.due_date,
        });
        if !entry.companies.contains(&notice.company_name) {
            entry.companies.push(notice.company_name.clone());
        }
        if !entry.metrics.contains(&notice.metric_name) {
            entry.metrics.push(notice.metric_name.clone());
        }
    }
    by_founder.into_values().collect()
}

fn render_digest(digest: &FounderDigest, period: (NaiveDate, NaiveDate)) -> OutboundEmail {
    let (start, end) = period;
    let subject = format!("Metrics requested for {start} – {end}");
    let mut body = format!(
        "Hi {},\n\nYour investor has requested updated metrics for the period {start} to {end}.\n\n",
        digest.founder.name
    );
    body.push_str("Companies:\n");
    for company in &digest.companies {
        body.push_str(&format!("  - {company}\n"));
    }
    body.push_str("\nMetrics to report:\n");
    for metric in &digest.metrics {
        body.push_str(&format!("  - {metric}\n"));
    }
    body.push_str(&format!(
        "\nPlease submit by {}.\n\n— Foliopulse\n",
        digest.due_date.format("%Y-%m-%d")
    ));
    OutboundEmail {
        to: digest.founder.email.clone(),
        to_name: digest.founder.name.clone(),
        subject,
        body,
    }
}
