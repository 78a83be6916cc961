//! Schedule lifecycle control — creation, pause, resume.
//!
//! All operations are scoped to the calling investor; touching another
//! investor's schedule is a `Forbidden`, a dangling id is a `NotFound`,
//! and state no-ops (pausing a paused schedule) are `Invalid`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use foliopulse_core::model::{Cadence, Schedule, new_id};
use foliopulse_core::{FolioError, Result};
use foliopulse_store::MetricStore;

use crate::period;

/// Input for creating a schedule. Everything not listed defaults:
/// active, no last run, next_run_at computed from the cadence.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub template_id: String,
    pub cadence: Cadence,
    pub day_of_month: u8,
    /// `None` targets the investor's whole portfolio at run time.
    pub company_ids: Option<Vec<String>>,
    pub include_future_companies: bool,
    pub due_days_offset: i64,
    pub reminders_enabled: bool,
    pub reminder_days_before: Vec<i64>,
}

/// Investor-scoped schedule administration over the store.
pub struct ScheduleControl {
    store: Arc<MetricStore>,
}

impl ScheduleControl {
    pub fn new(store: Arc<MetricStore>) -> Self {
        Self { store }
    }

    /// Fetch a schedule and verify the caller owns it.
    pub fn owned_schedule(&self, investor_id: &str, schedule_id: &str) -> Result<Schedule> {
        let schedule = self
            .store
            .get_schedule(schedule_id)?
            .ok_or_else(|| FolioError::NotFound(format!("schedule {schedule_id}")))?;
        if schedule.investor_id != investor_id {
            return Err(FolioError::Forbidden(format!("schedule {schedule_id}")));
        }
        Ok(schedule)
    }

    /// Validate and persist a new schedule for the investor.
    pub fn create_schedule(
        &self,
        investor_id: &str,
        input: NewSchedule,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        if !(1..=28).contains(&input.day_of_month) {
            return Err(FolioError::Invalid(format!(
                "day_of_month must be 1-28, got {}",
                input.day_of_month
            )));
        }
        if input.due_days_offset < 0 {
            return Err(FolioError::Invalid("due_days_offset must not be negative".into()));
        }
        if input.reminder_days_before.iter().any(|d| *d < 0) {
            return Err(FolioError::Invalid("reminder offsets must not be negative".into()));
        }

        let template = self
            .store
            .get_template(&input.template_id)?
            .ok_or_else(|| FolioError::NotFound(format!("template {}", input.template_id)))?;
        // System templates (no owner) are usable by everyone.
        if template.investor_id.as_deref().is_some_and(|owner| owner != investor_id) {
            return Err(FolioError::Forbidden(format!("template {}", input.template_id)));
        }

        if let Some(ids) = &input.company_ids {
            if ids.is_empty() {
                return Err(FolioError::Invalid(
                    "company_ids must be omitted or non-empty".into(),
                ));
            }
            let portfolio = self.store.portfolio_company_ids(investor_id)?;
            for id in ids {
                if !portfolio.contains(id) {
                    return Err(FolioError::Invalid(format!(
                        "company {id} is not in your portfolio"
                    )));
                }
            }
        }

        let schedule = Schedule {
            id: new_id(),
            investor_id: investor_id.to_string(),
            template_id: input.template_id,
            cadence: input.cadence,
            day_of_month: input.day_of_month,
            company_ids: input.company_ids,
            include_future_companies: input.include_future_companies,
            due_days_offset: input.due_days_offset,
            reminders_enabled: input.reminders_enabled,
            reminder_days_before: input.reminder_days_before,
            is_active: true,
            next_run_at: Some(period::next_run_on_resume(input.cadence, input.day_of_month, now)),
            last_run_at: None,
            created_at: now,
        };
        self.store.insert_schedule(&schedule)?;
        tracing::info!(
            "📅 Schedule {} created ({} day {}), first run {:?}",
            schedule.id,
            schedule.cadence.as_str(),
            schedule.day_of_month,
            schedule.next_run_at
        );
        Ok(schedule)
    }

    /// Deactivate: clears next_run_at so the sweep never selects it.
    pub fn pause(&self, investor_id: &str, schedule_id: &str) -> Result<Schedule> {
        let schedule = self.owned_schedule(investor_id, schedule_id)?;
        if !schedule.is_active {
            return Err(FolioError::Invalid(format!("schedule {schedule_id} is already paused")));
        }
        self.store.set_activity(schedule_id, false, None)?;
        tracing::info!("⏸ Schedule {schedule_id} paused");
        Ok(Schedule { is_active: false, next_run_at: None, ..schedule })
    }

    /// Reactivate with a freshly computed next run: this month's fire
    /// instant if still ahead, otherwise one cadence unit out. Missed
    /// windows are not back-filled.
    pub fn resume(
        &self,
        investor_id: &str,
        schedule_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        let schedule = self.owned_schedule(investor_id, schedule_id)?;
        if schedule.is_active {
            return Err(FolioError::Invalid(format!("schedule {schedule_id} is already active")));
        }
        let next = period::next_run_on_resume(schedule.cadence, schedule.day_of_month, now);
        self.store.set_activity(schedule_id, true, Some(next))?;
        tracing::info!("▶️ Schedule {schedule_id} resumed, next run {next}");
        Ok(Schedule { is_active: true, next_run_at: Some(next), ..schedule })
    }

    pub fn list(&self, investor_id: &str) -> Result<Vec<Schedule>> {
        self.store.schedules_for_investor(investor_id)
    }
}
