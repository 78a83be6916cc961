//! Domain model — schedules, templates, metric definitions/requests,
//! reminders, and run records.
//!
//! Natural keys are the backbone of the fan-out engine's idempotency:
//! - `MetricDefinition` is unique per (investor_id, name, period_type)
//! - `MetricRequest` is unique per (investor_id, company_id,
//!   metric_definition_id, period_start, period_end)
//!
//! Both are enforced by unique indexes in the store; repeated runs for the
//! same period insert nothing new.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Generate a fresh entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Recurrence unit of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Monthly,
    Quarterly,
    Annual,
}

impl Cadence {
    /// Length of one cadence unit in calendar months.
    pub fn months(self) -> u32 {
        match self {
            Cadence::Monthly => 1,
            Cadence::Quarterly => 3,
            Cadence::Annual => 12,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Cadence::Monthly => "monthly",
            Cadence::Quarterly => "quarterly",
            Cadence::Annual => "annual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(Cadence::Monthly),
            "quarterly" => Some(Cadence::Quarterly),
            "annual" => Some(Cadence::Annual),
            _ => None,
        }
    }
}

/// Reporting period granularity of a metric definition. Independent of the
/// schedule cadence — a quarterly schedule may still request monthly metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Monthly,
    Quarterly,
    Annual,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Monthly => "monthly",
            PeriodType::Quarterly => "quarterly",
            PeriodType::Annual => "annual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(PeriodType::Monthly),
            "quarterly" => Some(PeriodType::Quarterly),
            "annual" => Some(PeriodType::Annual),
            _ => None,
        }
    }
}

/// Descriptive value type of a metric. Metadata only — not part of any key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Number,
    Currency,
    Percent,
    Text,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Number => "number",
            DataType::Currency => "currency",
            DataType::Percent => "percent",
            DataType::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "number" => Some(DataType::Number),
            "currency" => Some(DataType::Currency),
            "percent" => Some(DataType::Percent),
            "text" => Some(DataType::Text),
            _ => None,
        }
    }
}

/// A recurring metric collection schedule owned by one investor.
///
/// Invariant: `next_run_at` is `Some` if and only if `is_active` is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub investor_id: String,
    pub template_id: String,
    pub cadence: Cadence,
    /// Day of month the sweep fires on, clamped to 1–28 to dodge
    /// short-month overflow (no Feb 30).
    pub day_of_month: u8,
    /// Explicit target companies. `None` means the investor's whole
    /// portfolio, resolved at run time (so future companies are included).
    pub company_ids: Option<Vec<String>>,
    pub include_future_companies: bool,
    /// Days from request generation to due date.
    pub due_days_offset: i64,
    pub reminders_enabled: bool,
    /// Days-before-due offsets, in configured order. Duplicates yield
    /// duplicate reminders (caller error, accepted).
    pub reminder_days_before: Vec<i64>,
    pub is_active: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    /// Whether the sweep should pick this schedule up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run_at.is_some_and(|next| next <= now)
    }

    /// Clamp a requested day-of-month into the valid 1–28 range.
    pub fn clamp_day(day: u8) -> u8 {
        day.clamp(1, 28)
    }
}

/// An ordered list of metrics an investor collects together.
/// System templates (`investor_id = None`) are shared and read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub investor_id: Option<String>,
    pub name: String,
    pub items: Vec<TemplateItem>,
}

/// One metric slot in a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateItem {
    pub metric_name: String,
    pub period_type: PeriodType,
    pub data_type: DataType,
}

/// A durable metric definition, created lazily by the resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub id: String,
    pub investor_id: String,
    pub name: String,
    pub period_type: PeriodType,
    pub data_type: DataType,
}

/// Lifecycle of a metric request after fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Submitted,
    Overdue,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Submitted => "submitted",
            RequestStatus::Overdue => "overdue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "submitted" => Some(RequestStatus::Submitted),
            "overdue" => Some(RequestStatus::Overdue),
            _ => None,
        }
    }
}

/// One concrete "please report this metric for this period" row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRequest {
    pub id: String,
    pub investor_id: String,
    pub company_id: String,
    pub metric_definition_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub due_date: DateTime<Utc>,
    pub status: RequestStatus,
    pub schedule_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MetricRequest {
    /// The idempotency key: two requests with equal keys are the same
    /// request, regardless of which run tried to create them.
    pub fn natural_key(&self) -> (String, String) {
        (self.company_id.clone(), self.metric_definition_id.clone())
    }
}

/// A scheduled follow-up nudge for one request. Created only for requests
/// newly inserted by the run that scheduled it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub metric_request_id: String,
    pub schedule_id: String,
    pub scheduled_for: DateTime<Utc>,
}

/// Outcome classification of one schedule invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    /// Derive the run status from what the run produced.
    /// "Nothing to do" with no errors is a success, not a failure.
    pub fn derive(requests_created: usize, error_count: usize) -> Self {
        match (requests_created, error_count) {
            (0, e) if e > 0 => RunStatus::Failed,
            (_, 0) => RunStatus::Success,
            _ => RunStatus::Partial,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "partial" => Some(RunStatus::Partial),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// A structured error captured during a run, scoped to a company and/or
/// metric when one applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    pub message: String,
}

impl RunError {
    pub fn run_level(message: impl Into<String>) -> Self {
        Self { company: None, metric: None, message: message.into() }
    }

    pub fn for_metric(metric: impl Into<String>, message: impl Into<String>) -> Self {
        Self { company: None, metric: Some(metric.into()), message: message.into() }
    }
}

/// Immutable audit row for one schedule invocation (sweep or manual).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub schedule_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub requests_created: usize,
    pub emails_sent: usize,
    pub errors: Vec<RunError>,
    pub status: RunStatus,
    /// Snapshot of the company ids this run targeted.
    pub company_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A portfolio company linked to an investor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub investor_id: String,
    pub name: String,
    /// The founder account that receives metric requests for this company.
    /// Companies without one are excluded from fan-out.
    pub founder_id: Option<String>,
}

/// A founder account reachable by email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Founder {
    pub id: String,
    pub name: String,
    pub email: String,
}
