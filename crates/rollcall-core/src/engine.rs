//! The long-lived attendance engine.
//!
//! Built once at process start from configuration and store handles, then
//! shared by every entry point (enrollment, marking, history, log listing).

use crate::enroll::{EnrollError, EnrollmentPolicy, EnrollmentRequest, DEFAULT_MAX_TERM, DEFAULT_UNITS};
use crate::history::{AttendanceHistory, HistoryAggregator, HistoryError};
use crate::notify::{AbsenteeSink, DiscardSink};
use crate::recorder::{FaceCounts, PresentIdentity, RecordedSession, SessionError, SessionRecorder, SessionRequest};
use crate::resolver::{GreedyResolver, Resolver, ResolverError, DEFAULT_THRESHOLD};
use crate::store::{PopulationStore, SessionStore, StoreError};
use crate::types::{AttendanceSession, Embedding, Identity, Scope, EMBEDDING_DIM};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no face detected in the capture")]
    NoFaceDetected,
    #[error("resolver: {0}")]
    Resolver(#[from] ResolverError),
    #[error("roll code already enrolled: {0}")]
    RollCodeConflict(String),
    #[error("invalid enrollment: {0}")]
    InvalidEnrollment(#[from] EnrollError),
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl From<HistoryError> for EngineError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::UnknownIdentity(id) => EngineError::UnknownIdentity(id),
            HistoryError::Store(e) => EngineError::Store(e),
        }
    }
}

/// Per-face embedding extraction failure. Absorbed by the engine.
#[derive(Error, Debug, Clone)]
#[error("embedding extraction failed: {0}")]
pub struct ExtractionError(pub String);

/// Turns one detected face region into an embedding.
pub trait EmbeddingExtractor {
    type Face;

    fn extract(&mut self, face: &Self::Face) -> Result<Embedding, ExtractionError>;
}

/// Tunables shared by every engine operation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum similarity for a match (inclusive).
    pub threshold: f32,
    pub embedding_dim: usize,
    /// Units accepted at enrollment.
    pub units: Vec<String>,
    /// Highest term accepted at enrollment.
    pub max_term: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            embedding_dim: EMBEDDING_DIM,
            units: DEFAULT_UNITS.iter().map(|u| u.to_string()).collect(),
            max_term: DEFAULT_MAX_TERM,
        }
    }
}

impl EngineConfig {
    fn enrollment_policy(&self) -> EnrollmentPolicy {
        EnrollmentPolicy {
            units: self.units.clone(),
            max_term: self.max_term,
            embedding_dim: self.embedding_dim,
        }
    }
}

/// A logged session with its present entries resolved to display data.
#[derive(Debug, Clone, Serialize)]
pub struct SessionLogEntry {
    pub id: String,
    #[serde(flatten)]
    pub session: AttendanceSession,
    pub present_identities: Vec<PresentIdentity>,
}

pub struct AttendanceEngine {
    config: EngineConfig,
    resolver: GreedyResolver,
    population: Arc<dyn PopulationStore>,
    sessions: Arc<dyn SessionStore>,
    sink: Arc<dyn AbsenteeSink>,
}

impl AttendanceEngine {
    pub fn new(config: EngineConfig, population: Arc<dyn PopulationStore>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            resolver: GreedyResolver::new(config.threshold),
            config,
            population,
            sessions,
            sink: Arc::new(DiscardSink),
        }
    }

    /// Route absence notices to `sink` instead of dropping them.
    pub fn with_sink(mut self, sink: Arc<dyn AbsenteeSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Enroll a new identity with its embedding.
    ///
    /// Fails with `RollCodeConflict` before any write if the roll code is
    /// taken; identity and embedding are stored together or not at all.
    pub fn enroll(&self, request: &EnrollmentRequest, embedding: Embedding) -> Result<Identity, EngineError> {
        let policy = self.config.enrollment_policy();
        let identity = policy.validate(request)?;
        let embedding = policy.prepare_embedding(embedding)?;

        if self.population.get_by_roll_code(&identity.roll_code)?.is_some() {
            return Err(EngineError::RollCodeConflict(identity.roll_code));
        }

        match self.population.insert(&identity, &embedding) {
            Ok(()) => {}
            Err(StoreError::DuplicateRollCode(code)) => return Err(EngineError::RollCodeConflict(code)),
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            id = %identity.id,
            roll_code = %identity.roll_code,
            unit = %identity.unit,
            term = identity.term,
            "identity enrolled"
        );
        Ok(identity)
    }

    /// Replace an identity's embedding.
    pub fn reenroll(&self, identity_id: &str, embedding: Embedding) -> Result<(), EngineError> {
        let embedding = self.config.enrollment_policy().prepare_embedding(embedding)?;
        if !self.population.set_embedding(identity_id, &embedding)? {
            return Err(EngineError::UnknownIdentity(identity_id.to_string()));
        }
        tracing::info!(id = identity_id, "embedding replaced");
        Ok(())
    }

    /// Delete an identity and its embedding. Recorded sessions are untouched.
    pub fn remove(&self, identity_id: &str) -> Result<(), EngineError> {
        if !self.population.remove(identity_id)? {
            return Err(EngineError::UnknownIdentity(identity_id.to_string()));
        }
        tracing::info!(id = identity_id, "identity removed");
        Ok(())
    }

    pub fn identity_by_roll_code(&self, roll_code: &str) -> Result<Option<Identity>, EngineError> {
        Ok(self.population.get_by_roll_code(roll_code)?)
    }

    pub fn roster(&self, scope: &Scope) -> Result<Vec<Identity>, EngineError> {
        Ok(self.population.list(scope)?)
    }

    /// Mark attendance from the faces detected in one capture.
    ///
    /// Faces whose extraction fails are dropped. If every extraction fails
    /// the session is still recorded, with nobody present. Nothing is
    /// written when no face was detected or the scope has no enrolled
    /// identities.
    pub fn mark<E: EmbeddingExtractor>(
        &self,
        request: &SessionRequest,
        extractor: &mut E,
        faces: &[E::Face],
    ) -> Result<RecordedSession, EngineError> {
        if faces.is_empty() {
            return Err(EngineError::NoFaceDetected);
        }

        let gallery = self.population.get_all(request.scope())?;
        if gallery.is_empty() {
            tracing::warn!(scope = ?request.scope(), "mark: no enrolled identities in scope");
            return Err(ResolverError::EmptyEnrollment.into());
        }

        let queries = self.extract_all(extractor, faces);
        let matches = self.resolver.resolve(&queries, &gallery)?;

        let in_gallery: HashSet<&str> = gallery.iter().map(|g| g.identity_id.as_str()).collect();
        let roster: Vec<Identity> = self
            .population
            .list(request.scope())?
            .into_iter()
            .filter(|i| in_gallery.contains(i.id.as_str()))
            .collect();

        let faces = FaceCounts {
            detected: faces.len(),
            processed: queries.len(),
        };
        let recorded = SessionRecorder::new(self.sessions.as_ref()).record(request, &matches, &roster, faces)?;

        if let Some(notice) = recorded.absence_notice() {
            self.sink.dispatch(notice);
        }

        Ok(recorded)
    }

    /// Extract every face, dropping the ones that fail or come back unusable.
    fn extract_all<E: EmbeddingExtractor>(&self, extractor: &mut E, faces: &[E::Face]) -> Vec<Embedding> {
        let mut queries = Vec::with_capacity(faces.len());
        for (index, face) in faces.iter().enumerate() {
            match extractor.extract(face) {
                Ok(embedding) if embedding.dim() != self.config.embedding_dim => {
                    tracing::debug!(
                        index,
                        dim = embedding.dim(),
                        expected = self.config.embedding_dim,
                        "mark: dropping face with wrong embedding size"
                    );
                }
                Ok(embedding) if !embedding.is_finite() => {
                    tracing::debug!(index, "mark: dropping face with non-finite embedding");
                }
                Ok(embedding) => queries.push(embedding),
                Err(err) => {
                    tracing::debug!(index, error = %err, "mark: dropping face");
                }
            }
        }

        if queries.len() < faces.len() {
            tracing::info!(
                detected = faces.len(),
                processed = queries.len(),
                "mark: some faces could not be processed"
            );
        }
        queries
    }

    /// Attendance history and per-subject statistics for one identity.
    pub fn history(&self, identity_id: &str) -> Result<AttendanceHistory, EngineError> {
        Ok(HistoryAggregator::new(self.population.as_ref(), self.sessions.as_ref()).history(identity_id)?)
    }

    /// Every recorded session, newest date first, with names attached.
    ///
    /// Present entries whose identity has since been removed are left out
    /// of `present_identities` but remain in the stored session.
    pub fn session_log(&self) -> Result<Vec<SessionLogEntry>, EngineError> {
        let mut sessions = self.sessions.stream_all()?;
        sessions.sort_by(|a, b| b.session.date.cmp(&a.session.date));

        let mut entries = Vec::with_capacity(sessions.len());
        for stored in sessions {
            let mut present_identities = Vec::with_capacity(stored.session.present.len());
            for entry in &stored.session.present {
                if let Some(identity) = self.population.get_by_id(&entry.identity_id)? {
                    present_identities.push(PresentIdentity {
                        identity_id: identity.id,
                        name: identity.name,
                        roll_code: identity.roll_code,
                        confidence: entry.confidence,
                    });
                }
            }
            entries.push(SessionLogEntry {
                id: stored.id,
                session: stored.session,
                present_identities,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::AbsenceNotice;
    use crate::store::MemoryStore;
    use crate::types::{AttendanceStatus, StoredSession};
    use chrono::NaiveDate;
    use std::sync::Mutex;

    const DIM: usize = 4;

    #[derive(Default)]
    struct RecordingSink {
        notices: Mutex<Vec<AbsenceNotice>>,
    }

    impl AbsenteeSink for RecordingSink {
        fn dispatch(&self, notice: AbsenceNotice) {
            self.notices.lock().unwrap().push(notice);
        }
    }

    /// Faces are pre-extracted vectors; `None` simulates an extraction failure.
    struct FixedExtractor;

    impl EmbeddingExtractor for FixedExtractor {
        type Face = Option<Vec<f32>>;

        fn extract(&mut self, face: &Self::Face) -> Result<Embedding, ExtractionError> {
            face.clone()
                .map(Embedding::new)
                .ok_or_else(|| ExtractionError("blurred".into()))
        }
    }

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[i] = 1.0;
        v
    }

    fn setup() -> (AttendanceEngine, Arc<MemoryStore>, Arc<RecordingSink>) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let config = EngineConfig {
            embedding_dim: DIM,
            ..EngineConfig::default()
        };
        let engine = AttendanceEngine::new(config, store.clone(), store.clone()).with_sink(sink.clone());
        (engine, store, sink)
    }

    fn enroll(engine: &AttendanceEngine, roll: &str, unit: &str, term: u8, vector: Vec<f32>) -> Identity {
        let request = EnrollmentRequest {
            name: format!("Student {roll}"),
            roll_code: roll.into(),
            unit: unit.into(),
            term,
            contact: Some(format!("{}@example.edu", roll.to_lowercase())),
        };
        engine.enroll(&request, Embedding::new(vector)).unwrap()
    }

    fn request(unit: Option<&str>, term: Option<u8>) -> SessionRequest {
        SessionRequest::new(
            NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            "Compilers",
            Scope::new(unit.map(str::to_string), term),
        )
        .unwrap()
    }

    #[test]
    fn test_mark_exact_match() {
        let (engine, _, _) = setup();
        let a = enroll(&engine, "CS001", "CS", 3, axis(0));
        let b = enroll(&engine, "CS002", "CS", 3, axis(1));

        let recorded = engine.mark(&request(None, None), &mut FixedExtractor, &[Some(axis(0))]).unwrap();
        assert_eq!(recorded.present.len(), 1);
        assert_eq!(recorded.present[0].identity_id, a.id);
        assert!((recorded.present[0].confidence - 1.0).abs() < 1e-6);
        let b_entry = recorded.roster.iter().find(|r| r.identity_id == b.id).unwrap();
        assert_eq!(b_entry.status, AttendanceStatus::Absent);
    }

    #[test]
    fn test_mark_duplicate_faces_single_claim() {
        let (engine, _, _) = setup();
        enroll(&engine, "CS001", "CS", 3, axis(0));
        enroll(&engine, "CS002", "CS", 3, axis(1));

        let faces = [Some(axis(0)), Some(axis(0))];
        let recorded = engine.mark(&request(None, None), &mut FixedExtractor, &faces).unwrap();
        assert_eq!(recorded.present_count(), 1);
        assert_eq!(recorded.faces.detected, 2);
    }

    #[test]
    fn test_mark_below_threshold_counts_face_only() {
        let (engine, _, _) = setup();
        enroll(&engine, "CS001", "CS", 3, axis(0));

        let x = 0.399_999f32;
        let face = vec![x, (1.0 - x * x).sqrt(), 0.0, 0.0];
        let recorded = engine.mark(&request(None, None), &mut FixedExtractor, &[Some(face)]).unwrap();
        assert_eq!(recorded.faces.detected, 1);
        assert_eq!(recorded.faces.processed, 1);
        assert_eq!(recorded.present_count(), 0);
        assert_eq!(recorded.absent_count(), 1);
    }

    #[test]
    fn test_mark_no_faces_persists_nothing() {
        let (engine, store, _) = setup();
        enroll(&engine, "CS001", "CS", 3, axis(0));
        let faces: [Option<Vec<f32>>; 0] = [];
        let err = engine.mark(&request(None, None), &mut FixedExtractor, &faces).unwrap_err();
        assert!(matches!(err, EngineError::NoFaceDetected));
        assert!(store.stream_all().unwrap().is_empty());
    }

    #[test]
    fn test_mark_empty_scope_persists_nothing() {
        let (engine, store, sink) = setup();
        enroll(&engine, "CS001", "CS", 3, axis(0));

        let err = engine
            .mark(&request(Some("EC"), Some(3)), &mut FixedExtractor, &[Some(axis(0))])
            .unwrap_err();
        assert!(matches!(err, EngineError::Resolver(ResolverError::EmptyEnrollment)));
        assert!(store.stream_all().unwrap().is_empty());
        assert!(sink.notices.lock().unwrap().is_empty());
    }

    #[test]
    fn test_mark_all_extractions_failed_still_records() {
        let (engine, store, sink) = setup();
        enroll(&engine, "CS001", "CS", 3, axis(0));

        let recorded = engine.mark(&request(None, None), &mut FixedExtractor, &[None, None]).unwrap();
        assert_eq!(recorded.faces, FaceCounts { detected: 2, processed: 0 });
        assert_eq!(recorded.present_count(), 0);
        assert_eq!(store.stream_all().unwrap().len(), 1);

        let notices = sink.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].absentees[0].address, "cs001@example.edu");
    }

    #[test]
    fn test_mark_drops_wrong_dimension_faces() {
        let (engine, _, _) = setup();
        enroll(&engine, "CS001", "CS", 3, axis(0));
        let faces = [Some(vec![1.0, 0.0]), Some(axis(0))];
        let recorded = engine.mark(&request(None, None), &mut FixedExtractor, &faces).unwrap();
        assert_eq!(recorded.faces, FaceCounts { detected: 2, processed: 1 });
        assert_eq!(recorded.present_count(), 1);
    }

    #[test]
    fn test_mark_scope_restricts_gallery() {
        let (engine, _, _) = setup();
        enroll(&engine, "CS001", "CS", 3, axis(0));
        let ec = enroll(&engine, "EC001", "EC", 3, axis(1));

        let recorded = engine
            .mark(&request(Some("EC"), Some(3)), &mut FixedExtractor, &[Some(axis(0)), Some(axis(1))])
            .unwrap();
        assert_eq!(recorded.total_in_scope(), 1);
        assert_eq!(recorded.present.len(), 1);
        assert_eq!(recorded.present[0].identity_id, ec.id);
        assert_eq!(recorded.session.unit.as_deref(), Some("EC"));
    }

    #[test]
    fn test_enroll_roll_code_conflict() {
        let (engine, store, _) = setup();
        enroll(&engine, "CS001", "CS", 3, axis(0));

        let request = EnrollmentRequest {
            name: "Someone Else".into(),
            roll_code: "CS001".into(),
            unit: "CS".into(),
            term: 3,
            contact: None,
        };
        let err = engine.enroll(&request, Embedding::new(axis(1))).unwrap_err();
        assert!(matches!(err, EngineError::RollCodeConflict(ref code) if code == "CS001"));
        assert_eq!(store.list(&Scope::all()).unwrap().len(), 1);
        assert_eq!(store.get_all(&Scope::all()).unwrap().len(), 1);
    }

    #[test]
    fn test_enroll_normalizes_embedding() {
        let (engine, store, _) = setup();
        let id = enroll(&engine, "CS001", "CS", 3, vec![2.0, 0.0, 0.0, 0.0]);
        let all = store.get_all(&Scope::all()).unwrap();
        assert_eq!(all[0].identity_id, id.id);
        assert_eq!(all[0].embedding.values, axis(0));
    }

    #[test]
    fn test_reenroll_and_remove() {
        let (engine, _, _) = setup();
        let a = enroll(&engine, "CS001", "CS", 3, axis(0));
        engine.reenroll(&a.id, Embedding::new(axis(2))).unwrap();

        let recorded = engine.mark(&request(None, None), &mut FixedExtractor, &[Some(axis(2))]).unwrap();
        assert_eq!(recorded.present_count(), 1);

        engine.remove(&a.id).unwrap();
        assert!(matches!(engine.remove(&a.id), Err(EngineError::UnknownIdentity(_))));
        assert!(matches!(
            engine.reenroll(&a.id, Embedding::new(axis(2))),
            Err(EngineError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn test_history_scoping_end_to_end() {
        let (engine, store, _) = setup();
        let x = enroll(&engine, "CS001", "CS", 3, axis(0));
        enroll(&engine, "EC001", "EC", 3, axis(1));

        engine.mark(&request(Some("CS"), Some(3)), &mut FixedExtractor, &[Some(axis(0))]).unwrap();
        engine.mark(&request(Some("EC"), Some(3)), &mut FixedExtractor, &[Some(axis(1))]).unwrap();

        // A legacy session with no scope that lists X as present.
        let legacy = AttendanceSession::new(
            NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
            "Compilers",
            &Scope::all(),
            vec![crate::types::PresentEntry { identity_id: x.id.clone(), confidence: 0.9 }],
        );
        store.import_session(StoredSession { id: "legacy".into(), session: legacy }).unwrap();

        let history = engine.history(&x.id).unwrap();
        assert_eq!(history.records.len(), 1);
        let stats = history.subjects["Compilers"];
        assert_eq!((stats.present, stats.total), (1, 1));
        assert_eq!(stats.percentage, 100.0);
    }

    #[test]
    fn test_history_unknown_identity() {
        let (engine, _, _) = setup();
        assert!(matches!(engine.history("missing"), Err(EngineError::UnknownIdentity(_))));
    }

    #[test]
    fn test_session_log_sorted_and_enriched() {
        let (engine, _, _) = setup();
        let a = enroll(&engine, "CS001", "CS", 3, axis(0));
        let b = enroll(&engine, "CS002", "CS", 3, axis(1));

        let early = SessionRequest::new(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), "Compilers", Scope::all()).unwrap();
        let late = SessionRequest::new(NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(), "Compilers", Scope::all()).unwrap();
        engine.mark(&early, &mut FixedExtractor, &[Some(axis(0))]).unwrap();
        engine.mark(&late, &mut FixedExtractor, &[Some(axis(1)), Some(axis(0))]).unwrap();
        engine.remove(&a.id).unwrap();

        let log = engine.session_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].session.date, NaiveDate::from_ymd_opt(2025, 2, 1).unwrap());
        assert_eq!(log[0].session.total_present, 2);
        assert_eq!(log[0].present_identities.len(), 1);
        assert_eq!(log[0].present_identities[0].identity_id, b.id);
        assert!(log[1].present_identities.is_empty());
    }
}
