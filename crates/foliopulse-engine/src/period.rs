//! Period calculator — pure calendar math, no I/O.
//!
//! Maps a cadence and "now" to the most recently completed reporting
//! period, and computes next-run instants. Day-of-month is clamped to
//! 1–28 up front so month-length edge cases (no Feb 30) never arise in
//! the date arithmetic below.

use chrono::{DateTime, Datelike, NaiveDate, Utc};

use foliopulse_core::model::{Cadence, Schedule};

/// Hour (UTC) computed run instants land on.
pub const FIRE_HOUR: u32 = 9;

/// The most recently *completed* period for the cadence as of `now`:
/// quarterly → the prior calendar quarter, monthly → the prior calendar
/// month, annual → the prior calendar year.
pub fn reporting_period(cadence: Cadence, now: DateTime<Utc>) -> (NaiveDate, NaiveDate) {
    let today = now.date_naive();
    let current_start = match cadence {
        Cadence::Monthly => ymd(today.year(), today.month(), 1),
        Cadence::Quarterly => {
            let quarter_month = ((today.month() - 1) / 3) * 3 + 1;
            ymd(today.year(), quarter_month, 1)
        }
        Cadence::Annual => ymd(today.year(), 1, 1),
    };
    let (start_year, start_month) =
        shift_month(current_start.year(), current_start.month(), -(cadence.months() as i32));
    let start = ymd(start_year, start_month, 1);
    let end = current_start.pred_opt().unwrap_or(start);
    (start, end)
}

/// Advance exactly one cadence unit forward from `now`, landing on the
/// clamped day-of-month of the resulting month. Used after a run
/// (successful or not) to reschedule.
pub fn next_run_after_completion(
    cadence: Cadence,
    day_of_month: u8,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let day = Schedule::clamp_day(day_of_month) as u32;
    let today = now.date_naive();
    let (year, month) = shift_month(today.year(), today.month(), cadence.months() as i32);
    instant(year, month, day, now)
}

/// The next qualifying instant from `now` when resuming a paused
/// schedule: this month's fire instant if it has not passed yet,
/// otherwise one cadence unit out.
pub fn next_run_on_resume(
    cadence: Cadence,
    day_of_month: u8,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let day = Schedule::clamp_day(day_of_month) as u32;
    let today = now.date_naive();
    let candidate = instant(today.year(), today.month(), day, now);
    if candidate > now {
        candidate
    } else {
        next_run_after_completion(cadence, day_of_month, now)
    }
}

/// `due_date − n days` for each configured offset. No dedup: duplicate
/// offsets yield duplicate reminders (caller error, accepted).
pub fn reminder_dates(due_date: DateTime<Utc>, days_before: &[i64]) -> Vec<DateTime<Utc>> {
    days_before.iter().map(|n| due_date - chrono::Duration::days(*n)).collect()
}

/// Month arithmetic on a (year, 1-based month) pair.
fn shift_month(year: i32, month: u32, delta: i32) -> (i32, u32) {
    let zero_based = year * 12 + month as i32 - 1 + delta;
    (zero_based.div_euclid(12), (zero_based.rem_euclid(12) + 1) as u32)
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or_else(|| Utc::now().date_naive())
}

fn instant(year: i32, month: u32, day: u32, fallback: DateTime<Utc>) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(FIRE_HOUR, 0, 0))
        .map(|n| n.and_utc())
        .unwrap_or(fallback)
}
