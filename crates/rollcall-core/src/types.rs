use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Dimension of embeddings produced by the production recognition model.
pub const EMBEDDING_DIM: usize = 512;

/// Face embedding vector (512-dimensional for the production model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding, when the extractor reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean (L2) norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Scale the vector to unit length. A zero vector is returned unchanged.
    pub fn normalized(mut self) -> Self {
        let norm = self.norm();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
        self
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Zero vectors
    /// compare as 0.0 against anything.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    /// Display name.
    pub name: String,
    /// External roll code, unique across all identities.
    pub roll_code: String,
    /// Organizational unit (branch), e.g. "CS".
    pub unit: String,
    /// Term number (semester).
    pub term: u8,
    /// Address used for absence notices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The (unit, term) pair restricting which identities are compared together.
///
/// `None` on either side means "no filter" when selecting identities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub unit: Option<String>,
    pub term: Option<u8>,
}

impl Scope {
    /// A scope with no filters: every enrolled identity.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a scope, treating a blank unit as "no unit filter".
    pub fn new(unit: Option<String>, term: Option<u8>) -> Self {
        let unit = unit
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        Self { unit, term }
    }

    /// Whether `identity` falls inside this scope's filters.
    pub fn contains(&self, identity: &Identity) -> bool {
        let unit_ok = self.unit.as_deref().map_or(true, |u| u == identity.unit);
        let term_ok = self.term.map_or(true, |t| t == identity.term);
        unit_ok && term_ok
    }
}

/// One identity recognized in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentEntry {
    pub identity_id: String,
    pub confidence: f32,
}

/// One attendance-taking event. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub date: NaiveDate,
    pub subject: String,
    /// Unit filter in effect when the session was captured.
    #[serde(default)]
    pub unit: Option<String>,
    /// Term filter in effect when the session was captured.
    #[serde(default)]
    pub term: Option<u8>,
    pub timestamp: DateTime<Utc>,
    pub present: Vec<PresentEntry>,
    pub total_present: usize,
}

impl AttendanceSession {
    /// Build a session stamped with the current time.
    ///
    /// Later duplicates of an identity already in `present` are dropped, so
    /// each identity appears at most once.
    pub fn new(date: NaiveDate, subject: impl Into<String>, scope: &Scope, present: Vec<PresentEntry>) -> Self {
        let mut unique: Vec<PresentEntry> = Vec::with_capacity(present.len());
        for entry in present {
            if !unique.iter().any(|e| e.identity_id == entry.identity_id) {
                unique.push(entry);
            }
        }

        Self {
            date,
            subject: subject.into(),
            unit: scope.unit.clone(),
            term: scope.term,
            timestamp: Utc::now(),
            total_present: unique.len(),
            present: unique,
        }
    }

    /// Whether this session counts toward `identity`'s history: the stored
    /// unit and term must both be present and equal the identity's own.
    pub fn counts_toward(&self, identity: &Identity) -> bool {
        self.unit.as_deref() == Some(identity.unit.as_str()) && self.term == Some(identity.term)
    }

    /// Stored confidence for `identity_id`, if it was present.
    pub fn confidence_for(&self, identity_id: &str) -> Option<f32> {
        self.present
            .iter()
            .find(|e| e.identity_id == identity_id)
            .map(|e| e.confidence)
    }
}

/// A session together with the id the store assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: String,
    #[serde(flatten)]
    pub session: AttendanceSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

/// Per-identity, per-session attendance (derived, never stored).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub session_id: String,
    pub date: NaiveDate,
    pub subject: String,
    pub status: AttendanceStatus,
    /// Stored match confidence; `None` when absent.
    pub confidence: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

/// Per-subject attendance totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectStats {
    pub present: u32,
    pub total: u32,
    /// present / total × 100, rounded to one decimal; 0.0 when total is 0.
    pub percentage: f64,
}

impl SubjectStats {
    pub fn from_counts(present: u32, total: u32) -> Self {
        Self {
            present,
            total,
            percentage: percentage(present, total),
        }
    }
}

/// `present / total * 100` to one decimal, ties to even; 0.0 when `total` is zero.
pub fn percentage(present: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = f64::from(present) / f64::from(total) * 100.0;
    (pct * 10.0).round_ties_even() / 10.0
}
