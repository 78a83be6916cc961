//! # Foliopulse Engine
//!
//! The recurring schedule fan-out engine: expands one due `Schedule` into
//! concrete per-company, per-metric `MetricRequest` rows, deduplicates
//! against prior runs on the natural key, hands created requests to the
//! notification dispatcher, and appends an audit `RunRecord`.
//!
//! Safe to invoke more than once for the same due schedule: both trigger
//! paths (timer sweep and manual run) call the same
//! [`FanoutEngine::run_schedule`], and idempotency rests on the
//! existing-key check backed by the store's unique constraints — no
//! distributed lock.

pub mod control;
pub mod fanout;
pub mod period;
pub mod resolver;

pub use control::{NewSchedule, ScheduleControl};
pub use fanout::{FanoutEngine, FanoutOutcome, SkipReason, SweepOutcome, Trigger, spawn_sweep_loop};
