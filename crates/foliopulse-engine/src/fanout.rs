//! Request fan-out engine — the single orchestrator behind both trigger
//! paths (timer sweep and manual run).
//!
//! One invocation: resolve target companies → resolve definitions →
//! subtract the existing-key set → batch-insert the delta → create
//! reminders for rows actually inserted → notify founders → append a
//! `RunRecord` and advance the schedule. Every step is batched; errors
//! local to one metric or one step land in the run record instead of
//! aborting the rest, and errors local to one schedule never abort the
//! sweep of the others.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use foliopulse_core::Result;
use foliopulse_core::model::{
    MetricRequest, Reminder, RequestStatus, RunError, RunRecord, RunStatus, Schedule, new_id,
};
use foliopulse_notify::{Dispatcher, RequestNotice};
use foliopulse_store::MetricStore;

use crate::period;
use crate::resolver::resolve_definitions;

/// Which path invoked the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Sweep,
    Manual,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Sweep => "sweep",
            Trigger::Manual => "manual",
        }
    }
}

/// Why a schedule produced no run at all (no `RunRecord` written).
/// Distinct from a run that executed and created nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingTemplate,
    EmptyTemplate,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::MissingTemplate => "missing-template",
            SkipReason::EmptyTemplate => "empty-template",
        }
    }
}

/// Result of invoking the engine for one schedule.
#[derive(Debug, Clone)]
pub enum FanoutOutcome {
    Skipped(SkipReason),
    Ran(RunRecord),
}

/// Per-schedule summary returned by a sweep, serialized on the trigger
/// endpoint response.
#[derive(Debug, Clone, Serialize)]
pub struct SweepOutcome {
    pub schedule_id: String,
    pub status: String,
    pub requests_created: usize,
    pub emails_sent: usize,
    pub errors: usize,
}

/// The fan-out engine. Cheap to clone behind `Arc`s; per-schedule work is
/// sequential, schedules are independent of each other.
pub struct FanoutEngine {
    store: Arc<MetricStore>,
    dispatcher: Dispatcher,
}

impl FanoutEngine {
    pub fn new(store: Arc<MetricStore>, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    /// Run the full fan-out for one schedule at `now`.
    ///
    /// Idempotent for a fixed resolved period: a second invocation finds
    /// every key in the existing set, inserts nothing, and records a
    /// `success` run with `requests_created = 0`.
    pub async fn run_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<FanoutOutcome> {
        tracing::info!(
            "🔁 Fan-out for schedule {} ({} trigger)",
            schedule.id,
            trigger.as_str()
        );

        // Missing or empty template: configuration error → skip, no record.
        let template = match self.store.get_template(&schedule.template_id)? {
            Some(t) => t,
            None => {
                tracing::warn!("Schedule {} references missing template {}", schedule.id, schedule.template_id);
                return Ok(FanoutOutcome::Skipped(SkipReason::MissingTemplate));
            }
        };
        if template.items.is_empty() {
            return Ok(FanoutOutcome::Skipped(SkipReason::EmptyTemplate));
        }

        let (period_start, period_end) = period::reporting_period(schedule.cadence, now);
        let mut errors: Vec<RunError> = Vec::new();

        // Target scope: explicit set, or the whole portfolio resolved now
        // (which is how future companies get picked up).
        let target_ids = match &schedule.company_ids {
            Some(ids) => ids.clone(),
            None => self.store.portfolio_company_ids(&schedule.investor_id)?,
        };

        let (inserted, emails_sent) = if target_ids.is_empty() {
            // Empty portfolio: nothing to do is not an error.
            (Vec::new(), 0)
        } else {
            let resolved = resolve_definitions(&self.store, &schedule.investor_id, &template.items)?;
            errors.extend(resolved.errors.iter().cloned());
            let definition_ids = resolved.definition_ids();

            let companies = self.store.companies_with_founders(&target_ids)?;

            let existing = self.store.existing_request_keys(
                &schedule.investor_id,
                period_start,
                period_end,
                &target_ids,
                &definition_ids,
            )?;

            // Cartesian product of eligible companies × resolved
            // definitions, minus what already exists for this period.
            let due_date = now + chrono::Duration::days(schedule.due_days_offset);
            let mut to_insert = Vec::new();
            for (company, _founder) in &companies {
                for definition_id in &definition_ids {
                    let key = (company.id.clone(), definition_id.clone());
                    if existing.contains(&key) {
                        continue;
                    }
                    to_insert.push(MetricRequest {
                        id: new_id(),
                        investor_id: schedule.investor_id.clone(),
                        company_id: company.id.clone(),
                        metric_definition_id: definition_id.clone(),
                        period_start,
                        period_end,
                        due_date,
                        status: RequestStatus::Pending,
                        schedule_id: Some(schedule.id.clone()),
                        created_at: now,
                    });
                }
            }

            let (inserted, insert_error) = self.store.insert_requests(&to_insert)?;
            if let Some(message) = insert_error {
                // The batch is one statement: one run-level error, not per row.
                errors.push(RunError::run_level(format!("request insert: {message}")));
            }

            if schedule.reminders_enabled && !inserted.is_empty() {
                if let Err(e) = self.create_reminders(schedule, &inserted) {
                    errors.push(RunError::run_level(format!("reminder insert: {e}")));
                }
            }

            // Requests and reminders are durable before notification is
            // attempted; a dropped batch costs emails, never data.
            let notices = build_notices(&inserted, &companies, &resolved.names_by_id);
            let emails_sent = self.dispatcher.dispatch(&notices, (period_start, period_end)).await;

            (inserted, emails_sent)
        };

        let record = RunRecord {
            id: new_id(),
            schedule_id: schedule.id.clone(),
            period_start,
            period_end,
            requests_created: inserted.len(),
            emails_sent,
            status: RunStatus::derive(inserted.len(), errors.len()),
            errors,
            company_ids: target_ids,
            created_at: now,
        };
        self.store.append_run_record(&record)?;
        self.advance_schedule(schedule, now, trigger)?;

        tracing::info!(
            "📒 Run recorded for schedule {}: {} created, {} email(s), status={}",
            schedule.id,
            record.requests_created,
            record.emails_sent,
            record.status.as_str()
        );
        Ok(FanoutOutcome::Ran(record))
    }

    fn create_reminders(&self, schedule: &Schedule, inserted: &[MetricRequest]) -> Result<usize> {
        let mut reminders = Vec::new();
        for request in inserted {
            for scheduled_for in
                period::reminder_dates(request.due_date, &schedule.reminder_days_before)
            {
                reminders.push(Reminder {
                    id: new_id(),
                    metric_request_id: request.id.clone(),
                    schedule_id: schedule.id.clone(),
                    scheduled_for,
                });
            }
        }
        self.store.insert_reminders(&reminders)
    }

    /// Post-run schedule bookkeeping.
    ///
    /// Sweep always stamps last_run_at and advances next_run_at one
    /// cadence unit. A manual run stamps last_run_at, and touches
    /// next_run_at only if the schedule is active and its next run is
    /// stale or unset — a manual run on a paused schedule never
    /// reactivates it, and one on a healthy active schedule leaves the
    /// future next_run_at alone.
    fn advance_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<()> {
        let advanced =
            period::next_run_after_completion(schedule.cadence, schedule.day_of_month, now);
        let next = match trigger {
            Trigger::Sweep => Some(advanced),
            Trigger::Manual => {
                let stale = schedule.next_run_at.is_none_or(|n| n <= now);
                (schedule.is_active && stale).then_some(advanced)
            }
        };
        self.store.mark_ran(&schedule.id, now, next)
    }

    /// Timer path: select due schedules and fan each out independently.
    /// One schedule's failure never aborts the rest.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<SweepOutcome> {
        let due = match self.store.due_schedules(now) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!("Sweep aborted, could not select due schedules: {e}");
                return Vec::new();
            }
        };
        if !due.is_empty() {
            tracing::info!("⏰ Sweep: {} due schedule(s)", due.len());
        }

        let mut outcomes = Vec::with_capacity(due.len());
        for schedule in due {
            match self.run_schedule(&schedule, now, Trigger::Sweep).await {
                Ok(FanoutOutcome::Ran(record)) => outcomes.push(SweepOutcome {
                    schedule_id: schedule.id.clone(),
                    status: record.status.as_str().to_string(),
                    requests_created: record.requests_created,
                    emails_sent: record.emails_sent,
                    errors: record.errors.len(),
                }),
                Ok(FanoutOutcome::Skipped(reason)) => {
                    // Advance the clock anyway, or a misconfigured
                    // schedule would refire every tick.
                    let next = period::next_run_after_completion(
                        schedule.cadence,
                        schedule.day_of_month,
                        now,
                    );
                    if let Err(e) = self.store.set_next_run(&schedule.id, next) {
                        tracing::warn!("Could not advance skipped schedule {}: {e}", schedule.id);
                    }
                    outcomes.push(SweepOutcome {
                        schedule_id: schedule.id.clone(),
                        status: format!("skipped:{}", reason.as_str()),
                        requests_created: 0,
                        emails_sent: 0,
                        errors: 0,
                    });
                }
                Err(e) => {
                    tracing::error!("Schedule {} failed during sweep: {e}", schedule.id);
                    outcomes.push(SweepOutcome {
                        schedule_id: schedule.id.clone(),
                        status: "error".into(),
                        requests_created: 0,
                        emails_sent: 0,
                        errors: 1,
                    });
                }
            }
        }
        outcomes
    }
}

/// Flatten inserted requests into dispatcher notices: company name,
/// founder, and metric name per created request.
fn build_notices(
    inserted: &[MetricRequest],
    companies: &[(foliopulse_core::model::Company, foliopulse_core::model::Founder)],
    metric_names: &HashMap<String, String>,
) -> Vec<RequestNotice> {
    let by_company: HashMap<&str, &(foliopulse_core::model::Company, foliopulse_core::model::Founder)> =
        companies.iter().map(|pair| (pair.0.id.as_str(), pair)).collect();
    inserted
        .iter()
        .filter_map(|request| {
            let (company, founder) = by_company.get(request.company_id.as_str())?;
            let metric_name = metric_names.get(&request.metric_definition_id)?;
            Some(RequestNotice {
                founder: founder.clone(),
                company_name: company.name.clone(),
                metric_name: metric_name.clone(),
                due_date: request.due_date,
            })
        })
        .collect()
}

/// Spawn the background sweep loop as a tokio task.
pub async fn spawn_sweep_loop(engine: Arc<FanoutEngine>, interval_secs: u64) {
    tracing::info!("⏰ Sweep loop started (check every {interval_secs}s)");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    loop {
        interval.tick().await;
        let outcomes = engine.sweep(Utc::now()).await;
        for outcome in &outcomes {
            tracing::info!(
                "📣 [{}] {} ({} created, {} sent)",
                outcome.schedule_id,
                outcome.status,
                outcome.requests_created,
                outcome.emails_sent
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use foliopulse_core::model::{
        Cadence, Company, DataType, Founder, PeriodType, Template, TemplateItem,
    };
    use foliopulse_notify::DryRunMailer;
    use std::time::Duration;

    fn engine() -> (Arc<MetricStore>, FanoutEngine) {
        let store = Arc::new(MetricStore::open_in_memory().unwrap());
        let dispatcher =
            Dispatcher::new(Arc::new(DryRunMailer), 100, 0, Duration::from_millis(1));
        let engine = FanoutEngine::new(store.clone(), dispatcher);
        (store, engine)
    }

    fn seed_portfolio(store: &MetricStore, investor: &str, companies: &[(&str, &str)]) -> Vec<String> {
        let mut ids = Vec::new();
        for (name, email) in companies {
            let founder = Founder {
                id: new_id(),
                name: format!("{name} founder"),
                email: email.to_string(),
            };
            store.upsert_founder(&founder).unwrap();
            let company = Company {
                id: new_id(),
                investor_id: investor.into(),
                name: name.to_string(),
                founder_id: Some(founder.id.clone()),
            };
            store.upsert_company(&company).unwrap();
            ids.push(company.id);
        }
        ids
    }

    fn seed_template(store: &MetricStore, investor: &str) -> String {
        let template = Template {
            id: new_id(),
            investor_id: Some(investor.into()),
            name: "Quarterly basics".into(),
            items: vec![
                TemplateItem {
                    metric_name: "Revenue".into(),
                    period_type: PeriodType::Quarterly,
                    data_type: DataType::Currency,
                },
                TemplateItem {
                    metric_name: "Burn Rate".into(),
                    period_type: PeriodType::Quarterly,
                    data_type: DataType::Currency,
                },
            ],
        };
        store.insert_template(&template).unwrap();
        template.id
    }

    fn quarterly_schedule(investor: &str, template_id: &str, now: DateTime<Utc>) -> Schedule {
        Schedule {
            id: new_id(),
            investor_id: investor.into(),
            template_id: template_id.into(),
            cadence: Cadence::Quarterly,
            day_of_month: 5,
            company_ids: None,
            include_future_companies: true,
            due_days_offset: 14,
            reminders_enabled: false,
            reminder_days_before: vec![],
            is_active: true,
            next_run_at: Some(now),
            last_run_at: None,
            created_at: now,
        }
    }

    fn q2_sweep_instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 5, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn concrete_scenario_first_sweep_then_rerun_then_manual() {
        let (store, engine) = engine();
        let now = q2_sweep_instant();
        seed_portfolio(&store, "inv-1", &[("Acme", "a@x.test"), ("Beta", "b@x.test")]);
        let template_id = seed_template(&store, "inv-1");
        let schedule = quarterly_schedule("inv-1", &template_id, now);
        store.insert_schedule(&schedule).unwrap();

        // First sweep: 2 companies × 2 metrics = 4 requests, success.
        let outcomes = engine.sweep(now).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].requests_created, 4);
        assert_eq!(outcomes[0].status, "success");
        assert_eq!(outcomes[0].emails_sent, 2);

        let runs = store.runs_for_schedule(&schedule.id, 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].requests_created, 4);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].period_start.to_string(), "2026-01-01");
        assert_eq!(runs[0].period_end.to_string(), "2026-03-31");

        // next_run_at advanced to Q3's day-5 instant.
        let updated = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert_eq!(
            updated.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 7, 5, 9, 0, 0).unwrap())
        );
        assert_eq!(updated.last_run_at, Some(now));

        // Second sweep immediately after: schedule no longer due, zero effect.
        let outcomes = engine.sweep(now + chrono::Duration::hours(1)).await;
        assert!(outcomes.is_empty());
        assert_eq!(store.requests_for_schedule(&schedule.id).unwrap().len(), 4);

        // Manual run for the same period: idempotent, success, 0 created,
        // next_run_at untouched (already in the future), last_run_at stamped.
        let manual_now = now + chrono::Duration::hours(2);
        let outcome = engine
            .run_schedule(&updated, manual_now, Trigger::Manual)
            .await
            .unwrap();
        let FanoutOutcome::Ran(record) = outcome else { panic!("expected a run") };
        assert_eq!(record.requests_created, 0);
        assert_eq!(record.status, RunStatus::Success);

        let after_manual = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert_eq!(after_manual.next_run_at, updated.next_run_at);
        assert_eq!(after_manual.last_run_at, Some(manual_now));
        assert_eq!(store.runs_for_schedule(&schedule.id, 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rerun_same_instant_is_idempotent() {
        let (store, engine) = engine();
        let now = q2_sweep_instant();
        seed_portfolio(&store, "inv-1", &[("Acme", "a@x.test")]);
        let template_id = seed_template(&store, "inv-1");
        let schedule = quarterly_schedule("inv-1", &template_id, now);
        store.insert_schedule(&schedule).unwrap();

        let first = engine.run_schedule(&schedule, now, Trigger::Sweep).await.unwrap();
        let FanoutOutcome::Ran(first) = first else { panic!() };
        assert_eq!(first.requests_created, 2);

        // Same schedule, same now — e.g. a racing second trigger.
        let second = engine.run_schedule(&schedule, now, Trigger::Sweep).await.unwrap();
        let FanoutOutcome::Ran(second) = second else { panic!() };
        assert_eq!(second.requests_created, 0);
        assert_eq!(second.status, RunStatus::Success);
        assert_eq!(store.requests_for_schedule(&schedule.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reminders_only_for_newly_inserted_requests() {
        let (store, engine) = engine();
        let now = q2_sweep_instant();
        seed_portfolio(&store, "inv-1", &[("Acme", "a@x.test"), ("Beta", "b@x.test")]);
        let template_id = seed_template(&store, "inv-1");
        let mut schedule = quarterly_schedule("inv-1", &template_id, now);
        schedule.reminders_enabled = true;
        schedule.reminder_days_before = vec![7, 1];
        store.insert_schedule(&schedule).unwrap();

        engine.run_schedule(&schedule, now, Trigger::Sweep).await.unwrap();
        // k=4 requests × m=2 offsets
        assert_eq!(store.reminders_for_schedule(&schedule.id).unwrap().len(), 8);

        // second run creates nothing → zero new reminders
        engine.run_schedule(&schedule, now, Trigger::Sweep).await.unwrap();
        assert_eq!(store.reminders_for_schedule(&schedule.id).unwrap().len(), 8);
    }

    #[tokio::test]
    async fn missing_template_skips_without_run_record() {
        let (store, engine) = engine();
        let now = q2_sweep_instant();
        seed_portfolio(&store, "inv-1", &[("Acme", "a@x.test")]);
        let schedule = quarterly_schedule("inv-1", "no-such-template", now);
        store.insert_schedule(&schedule).unwrap();

        let outcome = engine.run_schedule(&schedule, now, Trigger::Manual).await.unwrap();
        assert!(matches!(outcome, FanoutOutcome::Skipped(SkipReason::MissingTemplate)));
        assert!(store.runs_for_schedule(&schedule.id, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn skipped_schedule_still_advances_on_sweep() {
        let (store, engine) = engine();
        let now = q2_sweep_instant();
        let schedule = quarterly_schedule("inv-1", "no-such-template", now);
        store.insert_schedule(&schedule).unwrap();

        let outcomes = engine.sweep(now).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, "skipped:missing-template");

        let updated = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert!(updated.next_run_at.unwrap() > now);
        // no run: not a run record, not a last_run stamp
        assert!(updated.last_run_at.is_none());
    }

    #[tokio::test]
    async fn empty_portfolio_is_a_success_run() {
        let (store, engine) = engine();
        let now = q2_sweep_instant();
        let template_id = seed_template(&store, "inv-1");
        let schedule = quarterly_schedule("inv-1", &template_id, now);
        store.insert_schedule(&schedule).unwrap();

        let outcome = engine.run_schedule(&schedule, now, Trigger::Sweep).await.unwrap();
        let FanoutOutcome::Ran(record) = outcome else { panic!() };
        assert_eq!(record.requests_created, 0);
        assert_eq!(record.status, RunStatus::Success);
        assert!(record.company_ids.is_empty());
    }

    #[tokio::test]
    async fn companies_without_founders_are_excluded() {
        let (store, engine) = engine();
        let now = q2_sweep_instant();
        seed_portfolio(&store, "inv-1", &[("Acme", "a@x.test")]);
        let orphan = Company {
            id: new_id(),
            investor_id: "inv-1".into(),
            name: "Orphan".into(),
            founder_id: None,
        };
        store.upsert_company(&orphan).unwrap();
        let template_id = seed_template(&store, "inv-1");
        let schedule = quarterly_schedule("inv-1", &template_id, now);
        store.insert_schedule(&schedule).unwrap();

        let outcome = engine.run_schedule(&schedule, now, Trigger::Sweep).await.unwrap();
        let FanoutOutcome::Ran(record) = outcome else { panic!() };
        // only the reachable company got requests
        assert_eq!(record.requests_created, 2);
        // the snapshot still reflects the resolved target scope
        assert_eq!(record.company_ids.len(), 2);
    }

    #[tokio::test]
    async fn manual_run_on_paused_schedule_does_not_reactivate() {
        let (store, engine) = engine();
        let now = q2_sweep_instant();
        seed_portfolio(&store, "inv-1", &[("Acme", "a@x.test")]);
        let template_id = seed_template(&store, "inv-1");
        let mut schedule = quarterly_schedule("inv-1", &template_id, now);
        schedule.is_active = false;
        schedule.next_run_at = None;
        store.insert_schedule(&schedule).unwrap();

        let outcome = engine.run_schedule(&schedule, now, Trigger::Manual).await.unwrap();
        let FanoutOutcome::Ran(record) = outcome else { panic!() };
        assert_eq!(record.requests_created, 2);

        let updated = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert!(!updated.is_active);
        assert!(updated.next_run_at.is_none());
        assert_eq!(updated.last_run_at, Some(now));
    }

    #[tokio::test]
    async fn explicit_scope_ignores_rest_of_portfolio() {
        let (store, engine) = engine();
        let now = q2_sweep_instant();
        let ids = seed_portfolio(
            &store,
            "inv-1",
            &[("Acme", "a@x.test"), ("Beta", "b@x.test"), ("Gamma", "c@x.test")],
        );
        let template_id = seed_template(&store, "inv-1");
        let mut schedule = quarterly_schedule("inv-1", &template_id, now);
        schedule.company_ids = Some(vec![ids[0].clone()]);
        store.insert_schedule(&schedule).unwrap();

        let outcome = engine.run_schedule(&schedule, now, Trigger::Sweep).await.unwrap();
        let FanoutOutcome::Ran(record) = outcome else { panic!() };
        assert_eq!(record.requests_created, 2);
        assert_eq!(record.company_ids, vec![ids[0].clone()]);
    }
}
