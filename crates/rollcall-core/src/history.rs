//! Longitudinal attendance history for one identity.
//!
//! A session counts toward an identity only if its stored unit and term
//! exactly equal the identity's current unit and term. Sessions without a
//! stored scope, or without a subject, are legacy data and are skipped.

use crate::store::{PopulationStore, SessionStore, StoreError};
use crate::types::{AttendanceRecord, AttendanceStatus, Identity, StoredSession, SubjectStats};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Per-session records plus per-subject totals for one identity.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceHistory {
    pub identity: Identity,
    /// In session enumeration order; not re-sorted.
    pub records: Vec<AttendanceRecord>,
    pub subjects: BTreeMap<String, SubjectStats>,
}

impl AttendanceHistory {
    /// Number of sessions the identity attended.
    pub fn total_present(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == AttendanceStatus::Present)
            .count()
    }
}

/// Resolve `identity`'s status in every scoped session.
pub fn aggregate(identity: &Identity, sessions: &[StoredSession]) -> (Vec<AttendanceRecord>, BTreeMap<String, SubjectStats>) {
    let mut records = Vec::new();
    let mut counts: BTreeMap<String, (u32, u32)> = BTreeMap::new();
    let mut skipped = 0usize;

    for stored in sessions {
        let session = &stored.session;
        if session.subject.is_empty() || !session.counts_toward(identity) {
            skipped += 1;
            continue;
        }

        let (present, total) = counts.entry(session.subject.clone()).or_default();
        *total += 1;

        let confidence = session.confidence_for(&identity.id);
        let status = if confidence.is_some() {
            *present += 1;
            AttendanceStatus::Present
        } else {
            AttendanceStatus::Absent
        };

        records.push(AttendanceRecord {
            session_id: stored.id.clone(),
            date: session.date,
            subject: session.subject.clone(),
            status,
            confidence,
            timestamp: session.timestamp,
        });
    }

    tracing::debug!(
        identity = %identity.id,
        counted = records.len(),
        skipped,
        "history aggregated"
    );

    let subjects = counts
        .into_iter()
        .map(|(subject, (present, total))| (subject, SubjectStats::from_counts(present, total)))
        .collect();

    (records, subjects)
}

/// Reads the roster and session log to build histories.
pub struct HistoryAggregator<'a> {
    population: &'a dyn PopulationStore,
    sessions: &'a dyn SessionStore,
}

impl<'a> HistoryAggregator<'a> {
    pub fn new(population: &'a dyn PopulationStore, sessions: &'a dyn SessionStore) -> Self {
        Self { population, sessions }
    }

    pub fn history(&self, identity_id: &str) -> Result<AttendanceHistory, HistoryError> {
        let identity = self
            .population
            .get_by_id(identity_id)?
            .ok_or_else(|| HistoryError::UnknownIdentity(identity_id.to_string()))?;

        let sessions = self.sessions.stream_all()?;
        let (records, subjects) = aggregate(&identity, &sessions);

        Ok(AttendanceHistory {
            identity,
            records,
            subjects,
        })
    }
}
