//! Storage seams: the enrolled population and the append-only session log.
//!
//! Both traits are synchronous. Implementations must be shareable across
//! threads; the engine holds them behind `Arc<dyn ...>`.

use crate::resolver::EnrolledEmbedding;
use crate::types::{AttendanceSession, Embedding, Identity, Scope, StoredSession};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("roll code already enrolled: {0}")]
    DuplicateRollCode(String),
    #[error("identity already exists: {0}")]
    DuplicateIdentity(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Enrolled identities and their embeddings (one embedding per identity).
pub trait PopulationStore: Send + Sync {
    /// Insert an identity together with its embedding, atomically.
    fn insert(&self, identity: &Identity, embedding: &Embedding) -> Result<(), StoreError>;

    /// Overwrite the embedding of an existing identity. Returns `false` if
    /// the identity does not exist.
    fn set_embedding(&self, identity_id: &str, embedding: &Embedding) -> Result<bool, StoreError>;

    /// Delete an identity and its embedding. Returns `false` if absent.
    fn remove(&self, identity_id: &str) -> Result<bool, StoreError>;

    fn get_by_id(&self, identity_id: &str) -> Result<Option<Identity>, StoreError>;

    fn get_by_roll_code(&self, roll_code: &str) -> Result<Option<Identity>, StoreError>;

    /// Identities inside `scope`, in enrollment order.
    fn list(&self, scope: &Scope) -> Result<Vec<Identity>, StoreError>;

    /// Embeddings of identities inside `scope`, in enrollment order.
    fn get_all(&self, scope: &Scope) -> Result<Vec<EnrolledEmbedding>, StoreError>;
}

/// Append-only attendance session log.
pub trait SessionStore: Send + Sync {
    /// Persist a new session and return its assigned id. Never updates.
    fn append(&self, session: &AttendanceSession) -> Result<String, StoreError>;

    /// Every stored session, in append order.
    fn stream_all(&self) -> Result<Vec<StoredSession>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    identities: Vec<Identity>,
    embeddings: HashMap<String, Embedding>,
    sessions: Vec<StoredSession>,
}

/// In-process store implementing both traits. Contents are lost on drop.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }

    /// Append a session exactly as given, keeping its id and timestamp.
    #[cfg(test)]
    pub(crate) fn import_session(&self, stored: StoredSession) -> Result<(), StoreError> {
        self.write()?.sessions.push(stored);
        Ok(())
    }
}

impl PopulationStore for MemoryStore {
    fn insert(&self, identity: &Identity, embedding: &Embedding) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state.identities.iter().any(|i| i.roll_code == identity.roll_code) {
            return Err(StoreError::DuplicateRollCode(identity.roll_code.clone()));
        }
        if state.identities.iter().any(|i| i.id == identity.id) {
            return Err(StoreError::DuplicateIdentity(identity.id.clone()));
        }
        state.identities.push(identity.clone());
        state.embeddings.insert(identity.id.clone(), embedding.clone());
        Ok(())
    }

    fn set_embedding(&self, identity_id: &str, embedding: &Embedding) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        if !state.identities.iter().any(|i| i.id == identity_id) {
            return Ok(false);
        }
        state.embeddings.insert(identity_id.to_string(), embedding.clone());
        Ok(true)
    }

    fn remove(&self, identity_id: &str) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let before = state.identities.len();
        state.identities.retain(|i| i.id != identity_id);
        state.embeddings.remove(identity_id);
        Ok(state.identities.len() != before)
    }

    fn get_by_id(&self, identity_id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self.read()?.identities.iter().find(|i| i.id == identity_id).cloned())
    }

    fn get_by_roll_code(&self, roll_code: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .read()?
            .identities
            .iter()
            .find(|i| i.roll_code == roll_code)
            .cloned())
    }

    fn list(&self, scope: &Scope) -> Result<Vec<Identity>, StoreError> {
        Ok(self
            .read()?
            .identities
            .iter()
            .filter(|i| scope.contains(i))
            .cloned()
            .collect())
    }

    fn get_all(&self, scope: &Scope) -> Result<Vec<EnrolledEmbedding>, StoreError> {
        let state = self.read()?;
        Ok(state
            .identities
            .iter()
            .filter(|i| scope.contains(i))
            .filter_map(|i| {
                state.embeddings.get(&i.id).map(|e| EnrolledEmbedding {
                    identity_id: i.id.clone(),
                    embedding: e.clone(),
                })
            })
            .collect())
    }
}

impl SessionStore for MemoryStore {
    fn append(&self, session: &AttendanceSession) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.write()?.sessions.push(StoredSession {
            id: id.clone(),
            session: session.clone(),
        });
        Ok(id)
    }

    fn stream_all(&self) -> Result<Vec<StoredSession>, StoreError> {
        Ok(self.read()?.sessions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn identity(id: &str, roll: &str, unit: &str, term: u8) -> Identity {
        Identity {
            id: id.into(),
            name: format!("Student {id}"),
            roll_code: roll.into(),
            unit: unit.into(),
            term,
            contact: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_rejects_duplicate_roll_code() {
        let store = MemoryStore::new();
        store.insert(&identity("a", "CS001", "CS", 3), &Embedding::new(vec![1.0])).unwrap();
        let err = store
            .insert(&identity("b", "CS001", "CS", 3), &Embedding::new(vec![1.0]))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRollCode(ref r) if r == "CS001"));
        assert!(store.get_by_id("b").unwrap().is_none());
        assert_eq!(store.get_all(&Scope::all()).unwrap().len(), 1);
    }

    #[test]
    fn test_get_all_respects_scope_and_order() {
        let store = MemoryStore::new();
        store.insert(&identity("a", "CS001", "CS", 3), &Embedding::new(vec![1.0, 0.0])).unwrap();
        store.insert(&identity("b", "EC001", "EC", 3), &Embedding::new(vec![0.0, 1.0])).unwrap();
        store.insert(&identity("c", "CS002", "CS", 5), &Embedding::new(vec![0.6, 0.8])).unwrap();

        let ids = |scope: Scope| -> Vec<String> {
            store.get_all(&scope).unwrap().into_iter().map(|e| e.identity_id).collect()
        };
        assert_eq!(ids(Scope::all()), vec!["a", "b", "c"]);
        assert_eq!(ids(Scope::new(Some("CS".into()), None)), vec!["a", "c"]);
        assert_eq!(ids(Scope::new(None, Some(3))), vec!["a", "b"]);
        assert_eq!(ids(Scope::new(Some("CS".into()), Some(5))), vec!["c"]);
        assert!(ids(Scope::new(Some("ME".into()), None)).is_empty());
    }

    #[test]
    fn test_remove_deletes_embedding() {
        let store = MemoryStore::new();
        store.insert(&identity("a", "CS001", "CS", 3), &Embedding::new(vec![1.0])).unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert!(store.get_all(&Scope::all()).unwrap().is_empty());
        assert!(store.get_by_roll_code("CS001").unwrap().is_none());
    }

    #[test]
    fn test_set_embedding_overwrites() {
        let store = MemoryStore::new();
        store.insert(&identity("a", "CS001", "CS", 3), &Embedding::new(vec![1.0, 0.0])).unwrap();
        assert!(store.set_embedding("a", &Embedding::new(vec![0.0, 1.0])).unwrap());
        assert!(!store.set_embedding("zz", &Embedding::new(vec![0.0, 1.0])).unwrap());
        let all = store.get_all(&Scope::all()).unwrap();
        assert_eq!(all[0].embedding.values, vec![0.0, 1.0]);
    }

    #[test]
    fn test_sessions_append_in_order() {
        let store = MemoryStore::new();
        let date = NaiveDate::from_ymd_opt(2025, 2, 3).unwrap();
        let first = store.append(&AttendanceSession::new(date, "Maths", &Scope::all(), vec![])).unwrap();
        let second = store.append(&AttendanceSession::new(date, "Physics", &Scope::all(), vec![])).unwrap();
        assert_ne!(first, second);

        let all = store.stream_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first);
        assert_eq!(all[1].session.subject, "Physics");
    }
}
