//! SQLite-backed roster and session log.
//!
//! Embeddings are stored as little-endian f32 blobs. Sessions are appended
//! with their present list as a JSON column and never updated.

use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::resolver::EnrolledEmbedding;
use rollcall_core::{
    AttendanceSession, Embedding, Identity, PopulationStore, PresentEntry, Scope, SessionStore, StoreError,
    StoredSession,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS identities (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    name        TEXT NOT NULL,
    roll_code   TEXT NOT NULL UNIQUE,
    unit        TEXT NOT NULL,
    term        INTEGER NOT NULL,
    contact     TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_identities_scope ON identities(unit, term);

CREATE TABLE IF NOT EXISTS embeddings (
    identity_id    TEXT PRIMARY KEY REFERENCES identities(id) ON DELETE CASCADE,
    dim            INTEGER NOT NULL,
    vector         BLOB NOT NULL,
    model_version  TEXT,
    updated_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    id             TEXT NOT NULL UNIQUE,
    date           TEXT NOT NULL,
    subject        TEXT NOT NULL,
    unit           TEXT,
    term           INTEGER,
    timestamp      TEXT NOT NULL,
    present        TEXT NOT NULL,
    total_present  INTEGER NOT NULL
);
";

const IDENTITY_COLUMNS: &str = "id, name, roll_code, unit, term, contact, created_at";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid database value: {0}")]
    InvalidDbValue(String),
    #[error("connection lock poisoned")]
    LockPoisoned,
}

impl From<SqliteStoreError> for StoreError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::InvalidDbValue(msg) => StoreError::Corrupt(msg),
            SqliteStoreError::Json(e) => StoreError::Corrupt(e.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

type Result<T> = std::result::Result<T, SqliteStoreError>;

/// Persistent store implementing both the population and session traits.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "opened attendance database");
        Self::init(conn)
    }

    /// A private in-memory database, mainly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SqliteStoreError::LockPoisoned)
    }

    /// Counts of stored identities, embeddings and sessions.
    pub fn counts(&self) -> Result<(u64, u64, u64)> {
        let conn = self.lock()?;
        let count = |table: &str| -> Result<u64> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(1) FROM {table}"), [], |r| r.get(0))?;
            u64::try_from(n).map_err(|_| SqliteStoreError::InvalidDbValue(format!("negative count in {table}")))
        };
        Ok((count("identities")?, count("embeddings")?, count("sessions")?))
    }

    fn insert_identity(&self, identity: &Identity, embedding: &Embedding) -> std::result::Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(SqliteStoreError::from)?;

        let inserted = tx.execute(
            "INSERT INTO identities (id, name, roll_code, unit, term, contact, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                identity.id,
                identity.name,
                identity.roll_code,
                identity.unit,
                identity.term,
                identity.contact,
                identity.created_at.to_rfc3339(),
            ],
        );
        if let Err(err) = inserted {
            return Err(classify_insert_error(err, identity));
        }

        upsert_embedding(&tx, &identity.id, embedding)?;
        tx.commit().map_err(SqliteStoreError::from)?;
        Ok(())
    }

    fn query_identities(&self, scope: &Scope) -> Result<Vec<Identity>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities
             WHERE (?1 IS NULL OR unit = ?1) AND (?2 IS NULL OR term = ?2)
             ORDER BY seq"
        ))?;
        let rows = stmt.query_map(params![scope.unit, scope.term], decode_identity_row)?;
        let identities: Result<Vec<Identity>> = rows.map(|row| row?.into_identity()).collect();
        identities
    }

    fn query_embeddings(&self, scope: &Scope) -> Result<Vec<EnrolledEmbedding>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT e.identity_id, e.dim, e.vector, e.model_version
             FROM embeddings e JOIN identities i ON i.id = e.identity_id
             WHERE (?1 IS NULL OR i.unit = ?1) AND (?2 IS NULL OR i.term = ?2)
             ORDER BY i.seq",
        )?;
        let rows = stmt.query_map(params![scope.unit, scope.term], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (identity_id, dim, blob, model_version) = row?;
            let dim = usize::try_from(dim)
                .map_err(|_| SqliteStoreError::InvalidDbValue(format!("negative dimension for {identity_id}")))?;
            out.push(EnrolledEmbedding {
                identity_id,
                embedding: Embedding {
                    values: decode_f32_blob(&blob, dim)?,
                    model_version,
                },
            });
        }
        Ok(out)
    }

    fn query_one(&self, column: &str, value: &str) -> Result<Option<Identity>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE {column} = ?1"),
                params![value],
                decode_identity_row,
            )
            .optional()?;
        row.map(IdentityRow::into_identity).transpose()
    }

    fn query_sessions(&self) -> Result<Vec<StoredSession>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, date, subject, unit, term, timestamp, present, total_present
             FROM sessions ORDER BY seq",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SessionRow {
                id: row.get(0)?,
                date: row.get(1)?,
                subject: row.get(2)?,
                unit: row.get(3)?,
                term: row.get(4)?,
                timestamp: row.get(5)?,
                present: row.get(6)?,
                total_present: row.get(7)?,
            })
        })?;
        let sessions: Result<Vec<StoredSession>> = rows.map(|row| row?.into_stored()).collect();
        sessions
    }
}

fn classify_insert_error(err: rusqlite::Error, identity: &Identity) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ref failure, Some(ref msg)) = err {
        if failure.code == ErrorCode::ConstraintViolation {
            if msg.contains("identities.roll_code") {
                return StoreError::DuplicateRollCode(identity.roll_code.clone());
            }
            if msg.contains("identities.id") {
                return StoreError::DuplicateIdentity(identity.id.clone());
            }
        }
    }
    SqliteStoreError::from(err).into()
}

fn upsert_embedding(conn: &Connection, identity_id: &str, embedding: &Embedding) -> Result<()> {
    conn.execute(
        "INSERT INTO embeddings (identity_id, dim, vector, model_version, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(identity_id) DO UPDATE SET
            dim = excluded.dim,
            vector = excluded.vector,
            model_version = excluded.model_version,
            updated_at = excluded.updated_at",
        params![
            identity_id,
            i64::try_from(embedding.dim())
                .map_err(|_| SqliteStoreError::InvalidDbValue("embedding dimension overflow".into()))?,
            encode_f32_blob(&embedding.values),
            embedding.model_version,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn insert_session(conn: &Connection, id: &str, session: &AttendanceSession) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (id, date, subject, unit, term, timestamp, present, total_present)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            session.date.format(DATE_FORMAT).to_string(),
            session.subject,
            session.unit,
            session.term,
            session.timestamp.to_rfc3339(),
            serde_json::to_string(&session.present)?,
            i64::try_from(session.total_present)
                .map_err(|_| SqliteStoreError::InvalidDbValue("total_present overflow".into()))?,
        ],
    )?;
    Ok(())
}

struct IdentityRow {
    id: String,
    name: String,
    roll_code: String,
    unit: String,
    term: u8,
    contact: Option<String>,
    created_at: String,
}

impl IdentityRow {
    fn into_identity(self) -> Result<Identity> {
        Ok(Identity {
            created_at: parse_timestamp(&self.created_at)?,
            id: self.id,
            name: self.name,
            roll_code: self.roll_code,
            unit: self.unit,
            term: self.term,
            contact: self.contact,
        })
    }
}

fn decode_identity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok(IdentityRow {
        id: row.get(0)?,
        name: row.get(1)?,
        roll_code: row.get(2)?,
        unit: row.get(3)?,
        term: row.get(4)?,
        contact: row.get(5)?,
        created_at: row.get(6)?,
    })
}

struct SessionRow {
    id: String,
    date: String,
    subject: String,
    unit: Option<String>,
    term: Option<u8>,
    timestamp: String,
    present: String,
    total_present: i64,
}

impl SessionRow {
    fn into_stored(self) -> Result<StoredSession> {
        let date = NaiveDate::parse_from_str(&self.date, DATE_FORMAT)
            .map_err(|e| SqliteStoreError::InvalidDbValue(format!("session {} date {:?}: {e}", self.id, self.date)))?;
        let present: Vec<PresentEntry> = serde_json::from_str(&self.present)?;
        let total_present = usize::try_from(self.total_present)
            .map_err(|_| SqliteStoreError::InvalidDbValue(format!("session {} negative total", self.id)))?;

        Ok(StoredSession {
            session: AttendanceSession {
                date,
                subject: self.subject,
                unit: self.unit,
                term: self.term,
                timestamp: parse_timestamp(&self.timestamp)?,
                present,
                total_present,
            },
            id: self.id,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SqliteStoreError::InvalidDbValue(format!("timestamp {value:?}: {e}")))
}

fn encode_f32_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_f32_blob(blob: &[u8], dim: usize) -> Result<Vec<f32>> {
    let expected = dim * std::mem::size_of::<f32>();
    if blob.len() != expected {
        return Err(SqliteStoreError::InvalidDbValue(format!(
            "embedding blob length: expected {expected}, got {}",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

impl PopulationStore for SqliteStore {
    fn insert(&self, identity: &Identity, embedding: &Embedding) -> std::result::Result<(), StoreError> {
        self.insert_identity(identity, embedding)
    }

    fn set_embedding(&self, identity_id: &str, embedding: &Embedding) -> std::result::Result<bool, StoreError> {
        let conn = self.lock()?;
        let exists = conn
            .prepare("SELECT 1 FROM identities WHERE id = ?1")
            .and_then(|mut stmt| stmt.exists(params![identity_id]))
            .map_err(SqliteStoreError::from)?;
        if !exists {
            return Ok(false);
        }
        upsert_embedding(&conn, identity_id, embedding)?;
        Ok(true)
    }

    fn remove(&self, identity_id: &str) -> std::result::Result<bool, StoreError> {
        let conn = self.lock()?;
        // Embedding row goes with it via ON DELETE CASCADE.
        let removed = conn
            .execute("DELETE FROM identities WHERE id = ?1", params![identity_id])
            .map_err(SqliteStoreError::from)?;
        Ok(removed > 0)
    }

    fn get_by_id(&self, identity_id: &str) -> std::result::Result<Option<Identity>, StoreError> {
        Ok(self.query_one("id", identity_id)?)
    }

    fn get_by_roll_code(&self, roll_code: &str) -> std::result::Result<Option<Identity>, StoreError> {
        Ok(self.query_one("roll_code", roll_code)?)
    }

    fn list(&self, scope: &Scope) -> std::result::Result<Vec<Identity>, StoreError> {
        Ok(self.query_identities(scope)?)
    }

    fn get_all(&self, scope: &Scope) -> std::result::Result<Vec<EnrolledEmbedding>, StoreError> {
        Ok(self.query_embeddings(scope)?)
    }
}

impl SessionStore for SqliteStore {
    fn append(&self, session: &AttendanceSession) -> std::result::Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock()?;
        insert_session(&conn, &id, session)?;
        Ok(id)
    }

    fn stream_all(&self) -> std::result::Result<Vec<StoredSession>, StoreError> {
        Ok(self.query_sessions()?)
    }
}
