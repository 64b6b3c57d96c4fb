//! rollcall-core — Identity matching and attendance aggregation engine.
//!
//! Resolves detected face embeddings to enrolled identities, records one
//! attendance session per capture, and rebuilds per-identity history and
//! per-subject statistics from the session log.

pub mod engine;
pub mod enroll;
pub mod history;
pub mod notify;
pub mod recorder;
pub mod resolver;
pub mod store;
pub mod types;

pub use engine::{AttendanceEngine, EmbeddingExtractor, EngineConfig, EngineError, ExtractionError, SessionLogEntry};
pub use enroll::EnrollmentRequest;
pub use history::AttendanceHistory;
pub use notify::{AbsenceNotice, Absentee, AbsenteeSink, Notifier, NotifyError};
pub use recorder::{RecordedSession, SessionRequest};
pub use resolver::{GreedyResolver, Match, Resolver, ResolverError};
pub use store::{MemoryStore, PopulationStore, SessionStore, StoreError};
pub use types::{
    AttendanceRecord, AttendanceSession, AttendanceStatus, Embedding, Identity, PresentEntry, Scope, StoredSession,
    SubjectStats,
};
