//! Absence notification seam.
//!
//! Delivery is best-effort: the engine hands a notice to an
//! [`AbsenteeSink`] and never looks at the outcome.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Someone who missed a session and can be reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Absentee {
    pub name: String,
    pub address: String,
}

/// Everything a delivery backend needs to tell absentees about one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsenceNotice {
    pub date: NaiveDate,
    pub subject: String,
    pub absentees: Vec<Absentee>,
}

/// A delivery backend (mailer, outbox, log).
pub trait Notifier: Send {
    fn notify(&mut self, notice: &AbsenceNotice) -> Result<(), NotifyError>;
}

/// Fire-and-forget hand-off point for absence notices.
///
/// `dispatch` must return promptly and must not report failure.
pub trait AbsenteeSink: Send + Sync {
    fn dispatch(&self, notice: AbsenceNotice);
}

/// Sink that drops every notice. Used when notifications are disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl AbsenteeSink for DiscardSink {
    fn dispatch(&self, notice: AbsenceNotice) {
        tracing::debug!(
            date = %notice.date,
            subject = %notice.subject,
            absentees = notice.absentees.len(),
            "notifications disabled; notice dropped"
        );
    }
}
