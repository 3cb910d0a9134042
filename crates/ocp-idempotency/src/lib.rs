//! ocp-idempotency
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Payload-hash idempotency store (component C10). Suppresses duplicate
//! sends that share an idempotency key and payload hash, and rejects
//! attempts to reuse a key with a different payload.

use ocp_core::IdempotencyRecord;
use ocp_error::OutcomeCode;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or persisting the idempotency store.
#[derive(Debug, Error)]
pub enum IdempotencyStoreError {
    /// The store file exists but could not be parsed as JSON.
    #[error("cannot parse idempotency store at {path}: {source}")]
    InvalidStore {
        /// The offending path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// The store could not be read from or written to disk.
    #[error("cannot access idempotency store at {path}: {source}")]
    Io {
        /// The offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of checking a candidate send against the store, before any
/// outbound call is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyDecision {
    /// No conflicting record exists; the caller should proceed to send and
    /// then call [`IdempotencyStore::record`] on completion.
    Proceed,
    /// A record with the same key and payload hash already exists; the
    /// caller must not send and should emit a suppressed receipt.
    Suppressed {
        /// Path to the first run's `evidence.json`.
        original_evidence_path: String,
    },
    /// A record with the same key but a *different* payload hash exists.
    Conflict,
    /// The caller requires an idempotency key but none was supplied.
    MissingKey,
}

impl IdempotencyDecision {
    /// The stable [`OutcomeCode`] this decision maps to, when it is
    /// terminal (i.e. not [`IdempotencyDecision::Proceed`]).
    #[must_use]
    pub fn outcome_code(&self) -> Option<OutcomeCode> {
        match self {
            Self::Proceed => None,
            Self::Suppressed { .. } => Some(OutcomeCode::SuppressedDuplicate),
            Self::Conflict => Some(OutcomeCode::IdempotencyConflict),
            Self::MissingKey => Some(OutcomeCode::MissingIdempotencyKey),
        }
    }
}

/// Hex-encoded SHA-256 of the exact bytes that will be sent on the wire,
/// per the canonicalization decision in `DESIGN.md`.
#[must_use]
pub fn hash_payload_bytes(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

/// Keyed idempotency store, persisted atomically to a JSON file.
pub struct IdempotencyStore {
    path: PathBuf,
    records: BTreeMap<String, IdempotencyRecord>,
}

impl IdempotencyStore {
    /// Load the store from `path`, or start empty if the file does not
    /// exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, IdempotencyStoreError> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| {
                IdempotencyStoreError::InvalidStore {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(IdempotencyStoreError::Io { path, source }),
        };
        Ok(Self { path, records })
    }

    /// Evaluate the protocol from §4.10 for a candidate send.
    ///
    /// `require_idempotency` should be `true` when `OCP_REQUIRE_IDEMPOTENCY`
    /// is set; in that case a missing `key` is rejected before any lookup.
    #[must_use]
    pub fn check(
        &self,
        key: Option<&str>,
        payload_sha256: &str,
        require_idempotency: bool,
    ) -> IdempotencyDecision {
        let Some(key) = key else {
            return if require_idempotency {
                IdempotencyDecision::MissingKey
            } else {
                IdempotencyDecision::Proceed
            };
        };
        match self.records.get(key) {
            None => IdempotencyDecision::Proceed,
            Some(record) if record.payload_sha256 == payload_sha256 => {
                IdempotencyDecision::Suppressed {
                    original_evidence_path: record.first_evidence_path.clone(),
                }
            }
            Some(_) => IdempotencyDecision::Conflict,
        }
    }

    /// Record a completed send under `key`, persisting the store
    /// atomically (write-temp-then-rename). Only the first evidence path
    /// for a key is ever kept; subsequent calls with the same key
    /// overwrite only if the caller explicitly chooses to (callers should
    /// only call this once per fresh key, after [`check`](Self::check)
    /// returned [`IdempotencyDecision::Proceed`]).
    pub fn record(
        &mut self,
        key: &str,
        payload_sha256: String,
        first_evidence_path: String,
        created_at_ms: u64,
    ) -> Result<(), IdempotencyStoreError> {
        self.records.insert(
            key.to_string(),
            IdempotencyRecord {
                payload_sha256,
                first_evidence_path,
                created_at_ms,
            },
        );
        self.persist()
    }

    fn persist(&self) -> Result<(), IdempotencyStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| IdempotencyStoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let body = serde_json::to_vec_pretty(&self.records).map_err(|source| {
            IdempotencyStoreError::InvalidStore {
                path: self.path.clone(),
                source,
            }
        })?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &body).map_err(|source| IdempotencyStoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| IdempotencyStoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}
