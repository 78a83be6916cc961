//! # Foliopulse Notify
//!
//! Outbound founder notifications. The fan-out engine hands this crate the
//! requests it actually created; the dispatcher groups them by founder
//! (one email per founder, covering all their companies), renders a plain
//! text digest, and sends through an [`EmailProvider`] in bounded batches
//! with retry.
//!
//! Two providers ship here: [`SmtpMailer`] (lettre, STARTTLS) for real
//! delivery and [`DryRunMailer`] for environments without credentials —
//! dry-run is an explicit, injected mode, never an env-var side effect.

pub mod dispatch;
pub mod provider;
pub mod smtp;

pub use dispatch::{Dispatcher, RequestNotice};
pub use provider::{BatchOutcome, DryRunMailer, EmailProvider, OutboundEmail};
pub use smtp::SmtpMailer;
