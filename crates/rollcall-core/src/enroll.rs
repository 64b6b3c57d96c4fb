//! Enrollment request validation.

use crate::types::{Embedding, Identity};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

const ROLL_CODE_MIN_LEN: usize = 3;
const ROLL_CODE_MAX_LEN: usize = 20;

const ADDRESS_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";

/// Units accepted when no custom list is configured.
pub const DEFAULT_UNITS: [&str; 9] = ["CS", "CS-AIML", "CS-DS", "CS-D", "CS-CY", "EC", "EEE", "CE", "ME"];

/// Highest term accepted when none is configured.
pub const DEFAULT_MAX_TERM: u8 = 7;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("invalid roll code {0:?}: expected 3-20 alphanumeric characters")]
    InvalidRollCode(String),
    #[error("unknown unit {0:?}")]
    UnknownUnit(String),
    #[error("term {term} out of range 1..={max}")]
    TermOutOfRange { term: u8, max: u8 },
    #[error("invalid contact address {0:?}")]
    InvalidContact(String),
    #[error("embedding has {actual} dimensions, expected {expected}")]
    EmbeddingDimension { expected: usize, actual: usize },
    #[error("embedding contains non-finite values")]
    NonFiniteEmbedding,
    #[error("embedding is a zero vector")]
    ZeroEmbedding,
}

/// What the enrolling operator supplies for a new identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentRequest {
    pub name: String,
    pub roll_code: String,
    pub unit: String,
    pub term: u8,
    #[serde(default)]
    pub contact: Option<String>,
}

/// Limits an enrollment must satisfy.
#[derive(Debug, Clone)]
pub struct EnrollmentPolicy {
    pub units: Vec<String>,
    pub max_term: u8,
    pub embedding_dim: usize,
}

impl EnrollmentPolicy {
    /// Check the request fields and build the identity to store.
    pub fn validate(&self, request: &EnrollmentRequest) -> Result<Identity, EnrollError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(EnrollError::EmptyName);
        }

        let roll_code = request.roll_code.trim();
        if !is_valid_roll_code(roll_code) {
            return Err(EnrollError::InvalidRollCode(roll_code.to_string()));
        }

        let unit = request.unit.trim();
        if !self.units.iter().any(|u| u == unit) {
            return Err(EnrollError::UnknownUnit(unit.to_string()));
        }

        if request.term < 1 || request.term > self.max_term {
            return Err(EnrollError::TermOutOfRange {
                term: request.term,
                max: self.max_term,
            });
        }

        let contact = match request.contact.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(addr) if is_valid_address(addr) => Some(addr.to_string()),
            Some(addr) => return Err(EnrollError::InvalidContact(addr.to_string())),
        };

        Ok(Identity {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            roll_code: roll_code.to_string(),
            unit: unit.to_string(),
            term: request.term,
            contact,
            created_at: Utc::now(),
        })
    }

    /// Check an enrollment embedding and L2-normalize it.
    pub fn prepare_embedding(&self, embedding: Embedding) -> Result<Embedding, EnrollError> {
        if embedding.dim() != self.embedding_dim {
            return Err(EnrollError::EmbeddingDimension {
                expected: self.embedding_dim,
                actual: embedding.dim(),
            });
        }
        if !embedding.is_finite() {
            return Err(EnrollError::NonFiniteEmbedding);
        }
        if embedding.norm() == 0.0 {
            return Err(EnrollError::ZeroEmbedding);
        }
        Ok(embedding.normalized())
    }
}

/// Alphanumeric, 3 to 20 characters.
pub fn is_valid_roll_code(roll_code: &str) -> bool {
    let len = roll_code.chars().count();
    (ROLL_CODE_MIN_LEN..=ROLL_CODE_MAX_LEN).contains(&len) && roll_code.chars().all(|c| c.is_ascii_alphanumeric())
}

/// ASCII `local@domain.tld` shape check.
pub fn is_valid_address(address: &str) -> bool {
    static ADDRESS: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    ADDRESS
        .get_or_init(|| Regex::new(ADDRESS_PATTERN))
        .as_ref()
        .is_ok_and(|re| re.is_match(address))
}
