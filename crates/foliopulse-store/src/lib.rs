//! SQLite-backed persistence for Foliopulse.
//!
//! One `MetricStore` owns the connection (WAL mode, behind a mutex) and
//! exposes the batch operations the fan-out engine needs: company+founder
//! joins, definition lookups by name set, existing-request key sets, and
//! `INSERT OR IGNORE` batch inserts on the natural keys.
//!
//! The unique indexes on `metric_definitions` and `metric_requests` are the
//! final backstop for concurrent runs: a race-lost insert lands on the
//! constraint and is treated as "already exists", not an error.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, params, params_from_iter};

use foliopulse_core::error::{FolioError, Result};
use foliopulse_core::model::{
    Cadence, Company, DataType, Founder, MetricDefinition, MetricRequest, PeriodType, Reminder,
    RequestStatus, RunRecord, RunStatus, Schedule, Template, TemplateItem,
};

/// The Foliopulse database.
pub struct MetricStore {
    conn: Mutex<Connection>,
}

impl MetricStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(FolioError::store)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(FolioError::store)?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS founders (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS companies (
                id TEXT PRIMARY KEY,
                investor_id TEXT NOT NULL,
                name TEXT NOT NULL,
                founder_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_companies_investor ON companies(investor_id);

            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                investor_id TEXT,                -- NULL = system template
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS template_items (
                template_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                metric_name TEXT NOT NULL,
                period_type TEXT NOT NULL,
                data_type TEXT NOT NULL,
                PRIMARY KEY (template_id, position)
            );

            CREATE TABLE IF NOT EXISTS metric_definitions (
                id TEXT PRIMARY KEY,
                investor_id TEXT NOT NULL,
                name TEXT NOT NULL,
                period_type TEXT NOT NULL,
                data_type TEXT NOT NULL,
                UNIQUE (investor_id, name, period_type)
            );

            CREATE TABLE IF NOT EXISTS metric_requests (
                id TEXT PRIMARY KEY,
                investor_id TEXT NOT NULL,
                company_id TEXT NOT NULL,
                metric_definition_id TEXT NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                due_date TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                schedule_id TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (investor_id, company_id, metric_definition_id, period_start, period_end)
            );
            CREATE INDEX IF NOT EXISTS idx_requests_schedule ON metric_requests(schedule_id);

            CREATE TABLE IF NOT EXISTS reminders (
                id TEXT PRIMARY KEY,
                metric_request_id TEXT NOT NULL,
                schedule_id TEXT NOT NULL,
                scheduled_for TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reminders_schedule ON reminders(schedule_id);

            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                investor_id TEXT NOT NULL,
                template_id TEXT NOT NULL,
                cadence TEXT NOT NULL,
                day_of_month INTEGER NOT NULL,
                company_ids_json TEXT,           -- NULL = whole portfolio
                include_future_companies INTEGER NOT NULL DEFAULT 1,
                due_days_offset INTEGER NOT NULL,
                reminders_enabled INTEGER NOT NULL DEFAULT 0,
                reminder_days_json TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1,
                next_run_at TEXT,
                last_run_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_schedules_investor ON schedules(investor_id);

            CREATE TABLE IF NOT EXISTS run_records (
                id TEXT PRIMARY KEY,
                schedule_id TEXT NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                requests_created INTEGER NOT NULL,
                emails_sent INTEGER NOT NULL,
                errors_json TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                company_ids_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_schedule ON run_records(schedule_id);
            ",
        )
        .map_err(FolioError::store)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| FolioError::Store(format!("lock: {e}")))
    }

    // ─── Founders & companies ──────────────────────────────────

    pub fn upsert_founder(&self, founder: &Founder) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO founders (id, name, email) VALUES (?1, ?2, ?3)",
                params![founder.id, founder.name, founder.email],
            )
            .map_err(FolioError::store)?;
        Ok(())
    }

    pub fn upsert_company(&self, company: &Company) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO companies (id, investor_id, name, founder_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![company.id, company.investor_id, company.name, company.founder_id],
            )
            .map_err(FolioError::store)?;
        Ok(())
    }

    /// All company ids in the investor's portfolio.
    pub fn portfolio_company_ids(&self, investor_id: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id FROM companies WHERE investor_id = ?1 ORDER BY name")
            .map_err(FolioError::store)?;
        let rows = stmt
            .query_map([investor_id], |row| row.get(0))
            .map_err(FolioError::store)?;
        rows.collect::<rusqlite::Result<Vec<String>>>().map_err(FolioError::store)
    }

    /// Batch-fetch companies with their linked founder in one join.
    /// Companies with no founder row (or an unreachable founder with no
    /// email) are excluded — nobody could receive the request.
    pub fn companies_with_founders(&self, ids: &[String]) -> Result<Vec<(Company, Founder)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT c.id, c.investor_id, c.name, c.founder_id, f.id, f.name, f.email
             FROM companies c
             JOIN founders f ON f.id = c.founder_id
             WHERE c.id IN ({}) AND f.email <> ''",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql).map_err(FolioError::store)?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok((
                    Company {
                        id: row.get(0)?,
                        investor_id: row.get(1)?,
                        name: row.get(2)?,
                        founder_id: row.get(3)?,
                    },
                    Founder { id: row.get(4)?, name: row.get(5)?, email: row.get(6)? },
                ))
            })
            .map_err(FolioError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(FolioError::store)
    }

    // ─── Templates ─────────────────────────────────────────────

    pub fn insert_template(&self, template: &Template) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(FolioError::store)?;
        tx.execute(
            "INSERT OR REPLACE INTO templates (id, investor_id, name) VALUES (?1, ?2, ?3)",
            params![template.id, template.investor_id, template.name],
        )
        .map_err(FolioError::store)?;
        tx.execute("DELETE FROM template_items WHERE template_id = ?1", [&template.id])
            .map_err(FolioError::store)?;
        for (position, item) in template.items.iter().enumerate() {
            tx.execute(
                "INSERT INTO template_items (template_id, position, metric_name, period_type, data_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    template.id,
                    position as i64,
                    item.metric_name,
                    item.period_type.as_str(),
                    item.data_type.as_str()
                ],
            )
            .map_err(FolioError::store)?;
        }
        tx.commit().map_err(FolioError::store)
    }

    pub fn get_template(&self, id: &str) -> Result<Option<Template>> {
        let conn = self.lock()?;
        let head = conn
            .query_row(
                "SELECT id, investor_id, name FROM templates WHERE id = ?1",
                [id],
                |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?, row.get::<_, String>(2)?))
                },
            )
            .map(Some)
            .or_else(none_on_missing)
            .map_err(FolioError::store)?;
        let Some((id, investor_id, name)) = head else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT metric_name, period_type, data_type FROM template_items
                 WHERE template_id = ?1 ORDER BY position",
            )
            .map_err(FolioError::store)?;
        let items = stmt
            .query_map([&id], |row| {
                let period: String = row.get(1)?;
                let data: String = row.get(2)?;
                Ok(TemplateItem {
                    metric_name: row.get(0)?,
                    period_type: PeriodType::parse(&period).unwrap_or(PeriodType::Quarterly),
                    data_type: DataType::parse(&data).unwrap_or(DataType::Number),
                })
            })
            .map_err(FolioError::store)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(FolioError::store)?;

        Ok(Some(Template { id, investor_id, name, items }))
    }

    // ─── Metric definitions ────────────────────────────────────

    /// Existing definitions for the investor, filtered to the given names.
    pub fn definitions_by_names(
        &self,
        investor_id: &str,
        names: &[String],
    ) -> Result<Vec<MetricDefinition>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT id, investor_id, name, period_type, data_type
             FROM metric_definitions
             WHERE investor_id = ?1 AND name IN ({})",
            placeholders_from(2, names.len())
        );
        let mut stmt = conn.prepare(&sql).map_err(FolioError::store)?;
        let mut bind: Vec<&str> = vec![investor_id];
        bind.extend(names.iter().map(|s| s.as_str()));
        let rows = stmt
            .query_map(params_from_iter(bind), map_definition)
            .map_err(FolioError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(FolioError::store)
    }

    /// Insert missing definitions in one transaction. Each row is
    /// independent: a failed row is reported by (metric name, message) and
    /// does not stop the rest. Constraint collisions (someone else created
    /// it first) are silently ignored.
    pub fn insert_definitions(&self, defs: &[MetricDefinition]) -> Result<Vec<(String, String)>> {
        if defs.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(FolioError::store)?;
        let mut failures = Vec::new();
        for def in defs {
            let res = tx.execute(
                "INSERT OR IGNORE INTO metric_definitions (id, investor_id, name, period_type, data_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    def.id,
                    def.investor_id,
                    def.name,
                    def.period_type.as_str(),
                    def.data_type.as_str()
                ],
            );
            if let Err(e) = res {
                failures.push((def.name.clone(), e.to_string()));
            }
        }
        tx.commit().map_err(FolioError::store)?;
        Ok(failures)
    }

    // ─── Metric requests ───────────────────────────────────────

    /// Build the existing-key set for one period: (company_id,
    /// metric_definition_id) pairs already present. This is the idempotency
    /// check the fan-out engine subtracts from its cartesian product.
    pub fn existing_request_keys(
        &self,
        investor_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
        company_ids: &[String],
        definition_ids: &[String],
    ) -> Result<HashSet<(String, String)>> {
        if company_ids.is_empty() || definition_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT company_id, metric_definition_id FROM metric_requests
             WHERE investor_id = ?1 AND period_start = ?2 AND period_end = ?3
               AND company_id IN ({})
               AND metric_definition_id IN ({})",
            placeholders_from(4, company_ids.len()),
            placeholders_from(4 + company_ids.len(), definition_ids.len()),
        );
        let mut stmt = conn.prepare(&sql).map_err(FolioError::store)?;
        let start = period_start.to_string();
        let end = period_end.to_string();
        let mut bind: Vec<&str> = vec![investor_id, &start, &end];
        bind.extend(company_ids.iter().map(|s| s.as_str()));
        bind.extend(definition_ids.iter().map(|s| s.as_str()));
        let rows = stmt
            .query_map(params_from_iter(bind), |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(FolioError::store)?;
        rows.collect::<rusqlite::Result<HashSet<_>>>().map_err(FolioError::store)
    }

    /// Batch-insert requests with `INSERT OR IGNORE` on the natural key.
    /// Returns the rows actually inserted (conflicts are skipped, not
    /// errors) and, on a hard failure, the error message; rows inserted
    /// before the failure stay committed.
    pub fn insert_requests(
        &self,
        requests: &[MetricRequest],
    ) -> Result<(Vec<MetricRequest>, Option<String>)> {
        if requests.is_empty() {
            return Ok((Vec::new(), None));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(FolioError::store)?;
        let mut inserted = Vec::new();
        let mut hard_error = None;
        for req in requests {
            let res = tx.execute(
                "INSERT OR IGNORE INTO metric_requests
                 (id, investor_id, company_id, metric_definition_id,
                  period_start, period_end, due_date, status, schedule_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    req.id,
                    req.investor_id,
                    req.company_id,
                    req.metric_definition_id,
                    req.period_start.to_string(),
                    req.period_end.to_string(),
                    req.due_date.to_rfc3339(),
                    req.status.as_str(),
                    req.schedule_id,
                    req.created_at.to_rfc3339(),
                ],
            );
            match res {
                Ok(1) => inserted.push(req.clone()),
                Ok(_) => {} // natural-key collision: already satisfied
                Err(e) => {
                    hard_error = Some(e.to_string());
                    break;
                }
            }
        }
        tx.commit().map_err(FolioError::store)?;
        Ok((inserted, hard_error))
    }

    pub fn requests_for_schedule(&self, schedule_id: &str) -> Result<Vec<MetricRequest>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, investor_id, company_id, metric_definition_id, period_start,
                        period_end, due_date, status, schedule_id, created_at
                 FROM metric_requests WHERE schedule_id = ?1 ORDER BY created_at",
            )
            .map_err(FolioError::store)?;
        let rows = stmt.query_map([schedule_id], map_request).map_err(FolioError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(FolioError::store)
    }

    // ─── Reminders ─────────────────────────────────────────────

    pub fn insert_reminders(&self, reminders: &[Reminder]) -> Result<usize> {
        if reminders.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(FolioError::store)?;
        for rem in reminders {
            tx.execute(
                "INSERT INTO reminders (id, metric_request_id, schedule_id, scheduled_for)
                 VALUES (?1, ?2, ?3, ?4)",
                params![rem.id, rem.metric_request_id, rem.schedule_id, rem.scheduled_for.to_rfc3339()],
            )
            .map_err(FolioError::store)?;
        }
        tx.commit().map_err(FolioError::store)?;
        Ok(reminders.len())
    }

    pub fn reminders_for_schedule(&self, schedule_id: &str) -> Result<Vec<Reminder>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, metric_request_id, schedule_id, scheduled_for
                 FROM reminders WHERE schedule_id = ?1 ORDER BY scheduled_for",
            )
            .map_err(FolioError::store)?;
        let rows = stmt
            .query_map([schedule_id], |row| {
                let at: String = row.get(3)?;
                Ok(Reminder {
                    id: row.get(0)?,
                    metric_request_id: row.get(1)?,
                    schedule_id: row.get(2)?,
                    scheduled_for: parse_dt(3, &at)?,
                })
            })
            .map_err(FolioError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(FolioError::store)
    }

    // ─── Schedules ─────────────────────────────────────────────

    pub fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO schedules
                 (id, investor_id, template_id, cadence, day_of_month, company_ids_json,
                  include_future_companies, due_days_offset, reminders_enabled,
                  reminder_days_json, is_active, next_run_at, last_run_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    schedule.id,
                    schedule.investor_id,
                    schedule.template_id,
                    schedule.cadence.as_str(),
                    schedule.day_of_month,
                    schedule
                        .company_ids
                        .as_ref()
                        .map(|ids| serde_json::to_string(ids).unwrap_or_else(|_| "[]".into())),
                    schedule.include_future_companies as i32,
                    schedule.due_days_offset,
                    schedule.reminders_enabled as i32,
                    serde_json::to_string(&schedule.reminder_days_before)
                        .unwrap_or_else(|_| "[]".into()),
                    schedule.is_active as i32,
                    schedule.next_run_at.map(|t| t.to_rfc3339()),
                    schedule.last_run_at.map(|t| t.to_rfc3339()),
                    schedule.created_at.to_rfc3339(),
                ],
            )
            .map_err(FolioError::store)?;
        Ok(())
    }

    pub fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{SCHEDULE_SELECT} WHERE id = ?1"),
            [id],
            map_schedule,
        )
        .map(Some)
        .or_else(none_on_missing)
        .map_err(FolioError::store)
    }

    pub fn schedules_for_investor(&self, investor_id: &str) -> Result<Vec<Schedule>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("{SCHEDULE_SELECT} WHERE investor_id = ?1 ORDER BY created_at"))
            .map_err(FolioError::store)?;
        let rows = stmt.query_map([investor_id], map_schedule).map_err(FolioError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(FolioError::store)
    }

    /// Active schedules whose next_run_at has passed.
    pub fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "{SCHEDULE_SELECT}
                 WHERE is_active = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY next_run_at"
            ))
            .map_err(FolioError::store)?;
        let rows = stmt
            .query_map([now.to_rfc3339()], map_schedule)
            .map_err(FolioError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(FolioError::store)
    }

    /// Flip the activity flag and next-run instant together, preserving the
    /// "next_run_at is Some iff active" invariant.
    pub fn set_activity(
        &self,
        id: &str,
        is_active: bool,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE schedules SET is_active = ?1, next_run_at = ?2 WHERE id = ?3",
                params![is_active as i32, next_run_at.map(|t| t.to_rfc3339()), id],
            )
            .map_err(FolioError::store)?;
        Ok(())
    }

    /// Advance the timer without touching last_run_at (used when a sweep
    /// skips a misconfigured schedule so it does not refire every tick).
    pub fn set_next_run(&self, id: &str, next_run_at: DateTime<Utc>) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE schedules SET next_run_at = ?1 WHERE id = ?2 AND is_active = 1",
                params![next_run_at.to_rfc3339(), id],
            )
            .map_err(FolioError::store)?;
        Ok(())
    }

    /// Record a completed run: always stamps last_run_at; advances
    /// next_run_at only when the caller passes one.
    pub fn mark_ran(
        &self,
        id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.lock()?;
        match next_run_at {
            Some(next) => conn
                .execute(
                    "UPDATE schedules SET last_run_at = ?1, next_run_at = ?2 WHERE id = ?3",
                    params![last_run_at.to_rfc3339(), next.to_rfc3339(), id],
                )
                .map_err(FolioError::store)?,
            None => conn
                .execute(
                    "UPDATE schedules SET last_run_at = ?1 WHERE id = ?2",
                    params![last_run_at.to_rfc3339(), id],
                )
                .map_err(FolioError::store)?,
        };
        Ok(())
    }

    // ─── Run ledger ────────────────────────────────────────────

    /// Append one immutable audit row for a schedule invocation.
    pub fn append_run_record(&self, record: &RunRecord) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO run_records
                 (id, schedule_id, period_start, period_end, requests_created, emails_sent,
                  errors_json, status, company_ids_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id,
                    record.schedule_id,
                    record.period_start.to_string(),
                    record.period_end.to_string(),
                    record.requests_created as i64,
                    record.emails_sent as i64,
                    serde_json::to_string(&record.errors).unwrap_or_else(|_| "[]".into()),
                    record.status.as_str(),
                    serde_json::to_string(&record.company_ids).unwrap_or_else(|_| "[]".into()),
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(FolioError::store)?;
        Ok(())
    }

    pub fn runs_for_schedule(&self, schedule_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, schedule_id, period_start, period_end, requests_created, emails_sent,
                        errors_json, status, company_ids_json, created_at
                 FROM run_records WHERE schedule_id = ?1
                 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(FolioError::store)?;
        let rows = stmt
            .query_map(params![schedule_id, limit as i64], map_run_record)
            .map_err(FolioError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(FolioError::store)
    }
}

const SCHEDULE_SELECT: &str = "SELECT id, investor_id, template_id, cadence, day_of_month,
        company_ids_json, include_future_companies, due_days_offset, reminders_enabled,
        reminder_days_json, is_active, next_run_at, last_run_at, created_at
 FROM schedules";

// ─── Row mappers & helpers ─────────────────────────────────────

fn map_definition(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricDefinition> {
    let period: String = row.get(3)?;
    let data: String = row.get(4)?;
    Ok(MetricDefinition {
        id: row.get(0)?,
        investor_id: row.get(1)?,
        name: row.get(2)?,
        period_type: PeriodType::parse(&period).unwrap_or(PeriodType::Quarterly),
        data_type: DataType::parse(&data).unwrap_or(DataType::Number),
    })
}

fn map_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricRequest> {
    let start: String = row.get(4)?;
    let end: String = row.get(5)?;
    let due: String = row.get(6)?;
    let status: String = row.get(7)?;
    let created: String = row.get(9)?;
    Ok(MetricRequest {
        id: row.get(0)?,
        investor_id: row.get(1)?,
        company_id: row.get(2)?,
        metric_definition_id: row.get(3)?,
        period_start: parse_date(4, &start)?,
        period_end: parse_date(5, &end)?,
        due_date: parse_dt(6, &due)?,
        status: RequestStatus::parse(&status).unwrap_or(RequestStatus::Pending),
        schedule_id: row.get(8)?,
        created_at: parse_dt(9, &created)?,
    })
}

fn map_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
    let cadence: String = row.get(3)?;
    let company_ids_json: Option<String> = row.get(5)?;
    let reminder_days_json: String = row.get(9)?;
    let next_run: Option<String> = row.get(11)?;
    let last_run: Option<String> = row.get(12)?;
    let created: String = row.get(13)?;
    Ok(Schedule {
        id: row.get(0)?,
        investor_id: row.get(1)?,
        template_id: row.get(2)?,
        cadence: Cadence::parse(&cadence).unwrap_or(Cadence::Quarterly),
        day_of_month: row.get::<_, i64>(4)? as u8,
        company_ids: company_ids_json.and_then(|s| serde_json::from_str(&s).ok()),
        include_future_companies: row.get::<_, i32>(6)? != 0,
        due_days_offset: row.get(7)?,
        reminders_enabled: row.get::<_, i32>(8)? != 0,
        reminder_days_before: serde_json::from_str(&reminder_days_json).unwrap_or_default(),
        is_active: row.get::<_, i32>(10)? != 0,
        next_run_at: next_run.map(|s| parse_dt(11, &s)).transpose()?,
        last_run_at: last_run.map(|s| parse_dt(12, &s)).transpose()?,
        created_at: parse_dt(13, &created)?,
    })
}

fn map_run_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let start: String = row.get(2)?;
    let end: String = row.get(3)?;
    let errors_json: String = row.get(6)?;
    let status: String = row.get(7)?;
    let companies_json: String = row.get(8)?;
    let created: String = row.get(9)?;
    Ok(RunRecord {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        period_start: parse_date(2, &start)?,
        period_end: parse_date(3, &end)?,
        requests_created: row.get::<_, i64>(4)? as usize,
        emails_sent: row.get::<_, i64>(5)? as usize,
        errors: serde_json::from_str(&errors_json).unwrap_or_default(),
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        company_ids: serde_json::from_str(&companies_json).unwrap_or_default(),
        created_at: parse_dt(9, &created)?,
    })
}

/// Strict timestamp parsing: a column that does not parse is surfaced as
/// a conversion error instead of being papered over with a synthesized
/// instant — corrupt rows must be visible, not silently reshaped.
fn parse_dt(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_date(idx: usize, s: &str) -> rusqlite::Result<NaiveDate> {
    s.parse()
        .map_err(|e: chrono::ParseError| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        })
}

fn none_on_missing<T>(e: rusqlite::Error) -> rusqlite::Result<Option<T>> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

/// "?1, ?2, ..." for building IN clauses.
fn placeholders(n: usize) -> String {
    placeholders_from(1, n)
}

fn placeholders_from(start: usize, n: usize) -> String {
    (start..start + n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use foliopulse_core::model::new_id;

    fn seed_company(store: &MetricStore, investor: &str, name: &str, email: &str) -> (Company, Founder) {
        let founder = Founder { id: new_id(), name: format!("{name} founder"), email: email.into() };
        store.upsert_founder(&founder).unwrap();
        let company = Company {
            id: new_id(),
            investor_id: investor.into(),
            name: name.into(),
            founder_id: Some(founder.id.clone()),
        };
        store.upsert_company(&company).unwrap();
        (company, founder)
    }

    fn sample_request(investor: &str, company: &str, def: &str) -> MetricRequest {
        MetricRequest {
            id: new_id(),
            investor_id: investor.into(),
            company_id: company.into(),
            metric_definition_id: def.into(),
            period_start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
            due_date: Utc::now(),
            status: RequestStatus::Pending,
            schedule_id: Some("sched-1".into()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn company_founder_join_excludes_unreachable() {
        let store = MetricStore::open_in_memory().unwrap();
        let (with_founder, _) = seed_company(&store, "inv-1", "Acme", "a@acme.test");
        let (no_email, _) = seed_company(&store, "inv-1", "Blank", "");
        let orphan = Company {
            id: new_id(),
            investor_id: "inv-1".into(),
            name: "Orphan".into(),
            founder_id: None,
        };
        store.upsert_company(&orphan).unwrap();

        let ids = vec![with_founder.id.clone(), no_email.id.clone(), orphan.id.clone()];
        let rows = store.companies_with_founders(&ids).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.name, "Acme");
    }

    #[test]
    fn duplicate_request_insert_is_ignored() {
        let store = MetricStore::open_in_memory().unwrap();
        let first = sample_request("inv-1", "co-1", "def-1");
        let (inserted, err) = store.insert_requests(&[first]).unwrap();
        assert_eq!(inserted.len(), 1);
        assert!(err.is_none());

        // same natural key, fresh id: collision means "already satisfied"
        let dup = sample_request("inv-1", "co-1", "def-1");
        let (inserted, err) = store.insert_requests(&[dup]).unwrap();
        assert!(inserted.is_empty());
        assert!(err.is_none());
    }

    #[test]
    fn definition_uniqueness_backstop() {
        let store = MetricStore::open_in_memory().unwrap();
        let def = MetricDefinition {
            id: new_id(),
            investor_id: "inv-1".into(),
            name: "Revenue".into(),
            period_type: PeriodType::Quarterly,
            data_type: DataType::Currency,
        };
        assert!(store.insert_definitions(&[def.clone()]).unwrap().is_empty());

        let again = MetricDefinition { id: new_id(), ..def };
        assert!(store.insert_definitions(&[again]).unwrap().is_empty());

        let found = store
            .definitions_by_names("inv-1", &["Revenue".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn schedule_round_trip_and_due_selection() {
        let store = MetricStore::open_in_memory().unwrap();
        let now = Utc::now();
        let sched = Schedule {
            id: new_id(),
            investor_id: "inv-1".into(),
            template_id: "tpl-1".into(),
            cadence: Cadence::Quarterly,
            day_of_month: 5,
            company_ids: Some(vec!["co-1".into(), "co-2".into()]),
            include_future_companies: false,
            due_days_offset: 14,
            reminders_enabled: true,
            reminder_days_before: vec![7, 1],
            is_active: true,
            next_run_at: Some(now - chrono::Duration::minutes(1)),
            last_run_at: None,
            created_at: now,
        };
        store.insert_schedule(&sched).unwrap();

        let loaded = store.get_schedule(&sched.id).unwrap().unwrap();
        assert_eq!(loaded.cadence, Cadence::Quarterly);
        assert_eq!(loaded.company_ids.as_deref(), Some(&["co-1".to_string(), "co-2".to_string()][..]));
        assert_eq!(loaded.reminder_days_before, vec![7, 1]);

        let due = store.due_schedules(now).unwrap();
        assert_eq!(due.len(), 1);

        // pausing takes it out of the due set and clears next_run_at
        store.set_activity(&sched.id, false, None).unwrap();
        assert!(store.due_schedules(now).unwrap().is_empty());
        let paused = store.get_schedule(&sched.id).unwrap().unwrap();
        assert!(!paused.is_active);
        assert!(paused.next_run_at.is_none());
    }

    #[test]
    fn run_record_round_trip() {
        let store = MetricStore::open_in_memory().unwrap();
        let record = RunRecord {
            id: new_id(),
            schedule_id: "sched-1".into(),
            period_start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
            requests_created: 4,
            emails_sent: 2,
            errors: vec![foliopulse_core::model::RunError::for_metric("Burn Rate", "boom")],
            status: RunStatus::Partial,
            company_ids: vec!["co-1".into()],
            created_at: Utc::now(),
        };
        store.append_run_record(&record).unwrap();

        let runs = store.runs_for_schedule("sched-1", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].requests_created, 4);
        assert_eq!(runs[0].status, RunStatus::Partial);
        assert_eq!(runs[0].errors.len(), 1);
        assert_eq!(runs[0].errors[0].metric.as_deref(), Some("Burn Rate"));
    }

    #[test]
    fn corrupt_timestamp_surfaces_as_error() {
        let store = MetricStore::open_in_memory().unwrap();
        let now = Utc::now();
        let sched = Schedule {
            id: new_id(),
            investor_id: "inv-1".into(),
            template_id: "tpl-1".into(),
            cadence: Cadence::Monthly,
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
        };
        store.insert_schedule(&sched).unwrap();

        store
            .lock()
            .unwrap()
            .execute("UPDATE schedules SET created_at = 'garbage' WHERE id = ?1", [&sched.id])
            .unwrap();

        let err = store.get_schedule(&sched.id).unwrap_err();
        assert!(matches!(err, FolioError::Store(_)));
    }

    #[test]
    fn template_items_keep_order() {
        let store = MetricStore::open_in_memory().unwrap();
        let tpl = Template {
            id: new_id(),
            investor_id: None,
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
        store.insert_template(&tpl).unwrap();
        let loaded = store.get_template(&tpl.id).unwrap().unwrap();
        assert_eq!(loaded.items.len(), 2);
        assert_eq!(loaded.items[0].metric_name, "Revenue");
        assert_eq!(loaded.items[1].metric_name, "Burn Rate");
        assert!(store.get_template("missing").unwrap().is_none());
    }
}
