//! Session recording: turn resolver output into one persisted session.

use crate::notify::{AbsenceNotice, Absentee};
use crate::resolver::Match;
use crate::store::{SessionStore, StoreError};
use crate::types::{AttendanceSession, AttendanceStatus, Identity, PresentEntry, Scope};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("subject is required to record attendance")]
    MissingSubject,
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Date, subject and scope of a session about to be recorded.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    date: NaiveDate,
    subject: String,
    scope: Scope,
}

impl SessionRequest {
    pub fn new(date: NaiveDate, subject: impl Into<String>, scope: Scope) -> Result<Self, SessionError> {
        let subject = subject.into().trim().to_string();
        if subject.is_empty() {
            return Err(SessionError::MissingSubject);
        }
        Ok(Self { date, subject, scope })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// How many faces came in and how many produced a usable embedding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FaceCounts {
    pub detected: usize,
    pub processed: usize,
}

/// A present identity with its display data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresentIdentity {
    pub identity_id: String,
    pub name: String,
    pub roll_code: String,
    pub confidence: f32,
}

/// One member of the scoped population, tagged present or absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterEntry {
    pub identity_id: String,
    pub name: String,
    pub roll_code: String,
    pub status: AttendanceStatus,
}

/// Outcome of recording a session.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedSession {
    pub session_id: String,
    pub session: AttendanceSession,
    pub faces: FaceCounts,
    pub present: Vec<PresentIdentity>,
    pub roster: Vec<RosterEntry>,
    /// Absent roster members that have a contact address.
    #[serde(skip)]
    pub absentees: Vec<Absentee>,
}

impl RecordedSession {
    pub fn total_in_scope(&self) -> usize {
        self.roster.len()
    }

    pub fn present_count(&self) -> usize {
        self.session.total_present
    }

    pub fn absent_count(&self) -> usize {
        self.roster
            .iter()
            .filter(|r| r.status == AttendanceStatus::Absent)
            .count()
    }

    /// Notice for the absentees, or `None` when nobody reachable was absent.
    pub fn absence_notice(&self) -> Option<AbsenceNotice> {
        if self.absentees.is_empty() {
            return None;
        }
        Some(AbsenceNotice {
            date: self.session.date,
            subject: self.session.subject.clone(),
            absentees: self.absentees.clone(),
        })
    }
}

/// Stored confidence keeps four decimals.
fn round_confidence(score: f32) -> f32 {
    (score * 10_000.0).round() / 10_000.0
}

/// Persists one session per call.
pub struct SessionRecorder<'a> {
    sessions: &'a dyn SessionStore,
}

impl<'a> SessionRecorder<'a> {
    pub fn new(sessions: &'a dyn SessionStore) -> Self {
        Self { sessions }
    }

    /// Persist a session for `request` and build the caller's views.
    ///
    /// `roster` is the scoped population the matches were computed against.
    /// The session is written even when `matches` is empty.
    pub fn record(
        &self,
        request: &SessionRequest,
        matches: &[Match],
        roster: &[Identity],
        faces: FaceCounts,
    ) -> Result<RecordedSession, SessionError> {
        let entries: Vec<PresentEntry> = matches
            .iter()
            .map(|m| PresentEntry {
                identity_id: m.identity_id.clone(),
                confidence: round_confidence(m.confidence),
            })
            .collect();

        let session = AttendanceSession::new(request.date(), request.subject(), request.scope(), entries);
        let session_id = self.sessions.append(&session)?;

        let by_id: HashMap<&str, &Identity> = roster.iter().map(|i| (i.id.as_str(), i)).collect();

        let present: Vec<PresentIdentity> = session
            .present
            .iter()
            .filter_map(|entry| {
                by_id.get(entry.identity_id.as_str()).map(|identity| PresentIdentity {
                    identity_id: identity.id.clone(),
                    name: identity.name.clone(),
                    roll_code: identity.roll_code.clone(),
                    confidence: entry.confidence,
                })
            })
            .collect();

        let present_ids: HashSet<&str> = session.present.iter().map(|e| e.identity_id.as_str()).collect();

        let mut absentees = Vec::new();
        let roster_view: Vec<RosterEntry> = roster
            .iter()
            .map(|identity| {
                let status = if present_ids.contains(identity.id.as_str()) {
                    AttendanceStatus::Present
                } else {
                    if let Some(address) = &identity.contact {
                        absentees.push(Absentee {
                            name: identity.name.clone(),
                            address: address.clone(),
                        });
                    }
                    AttendanceStatus::Absent
                };
                RosterEntry {
                    identity_id: identity.id.clone(),
                    name: identity.name.clone(),
                    roll_code: identity.roll_code.clone(),
                    status,
                }
            })
            .collect();

        tracing::info!(
            session_id = %session_id,
            date = %session.date,
            subject = %session.subject,
            present = session.total_present,
            in_scope = roster.len(),
            "session recorded"
        );

        Ok(RecordedSession {
            session_id,
            session,
            faces,
            present,
            roster: roster_view,
            absentees,
        })
    }
}
