//! ocp-ratelimit
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Cooldown-based rate-limit store (component C9). Keeps a keyed
//! last-sent-timestamp record, persisted atomically, and evaluates whether
//! a new send is allowed under a cooldown window. The store is updated
//! only on a successful delivery — never on a throttled or suppressed
//! attempt.

use ocp_core::RateLimitRecord;
use ocp_error::OutcomeCode;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or persisting the rate-limit store.
#[derive(Debug, Error)]
pub enum RateLimitStoreError {
    /// The store file exists but could not be parsed as JSON.
    #[error("cannot parse rate-limit store at {path}: {source}")]
    InvalidStore {
        /// The offending path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// The store could not be read from or written to disk.
    #[error("cannot access rate-limit store at {path}: {source}")]
    Io {
        /// The offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Inputs to [`evaluate_rate_limit`].
#[derive(Debug, Clone, Copy)]
pub struct RateLimitCheck {
    /// Current wall-clock time, epoch milliseconds.
    pub now_ms: u64,
    /// Minimum interval required between sends sharing a key.
    pub cooldown_ms: u64,
    /// The last recorded send time for this key, if any.
    pub last_sent_ms: Option<u64>,
}

/// Outcome of [`evaluate_rate_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// `true` if the cooldown window has elapsed (or no prior send exists).
    pub allowed: bool,
    /// Milliseconds remaining until the cooldown elapses; `0` when allowed.
    pub remaining_ms: u64,
}

/// `allowed = last_sent_ms is none OR now_ms - last_sent_ms >= cooldown_ms`.
#[must_use]
pub fn evaluate_rate_limit(check: RateLimitCheck) -> RateLimitDecision {
    match check.last_sent_ms {
        None => RateLimitDecision {
            allowed: true,
            remaining_ms: 0,
        },
        Some(last) => {
            let elapsed = check.now_ms.saturating_sub(last);
            if elapsed >= check.cooldown_ms {
                RateLimitDecision {
                    allowed: true,
                    remaining_ms: 0,
                }
            } else {
                RateLimitDecision {
                    allowed: false,
                    remaining_ms: check.cooldown_ms - elapsed,
                }
            }
        }
    }
}

/// Resolve a [`RateLimitDecision`] into the caller-visible outcome: strict
/// profiles reject an in-cooldown request, non-strict ones record and
/// suppress it without rejecting the caller.
#[must_use]
pub fn throttled_outcome(strict: bool) -> OutcomeCode {
    if strict {
        OutcomeCode::ThrottledStrict
    } else {
        OutcomeCode::Throttled
    }
}

/// Keyed last-sent-timestamp store, persisted atomically to a JSON file.
///
/// Keys are derived by callers (typically target host + path, optionally
/// plus driver id) and are opaque to this store.
pub struct RateLimitStore {
    path: PathBuf,
    records: BTreeMap<String, RateLimitRecord>,
}

impl RateLimitStore {
    /// Load the store from `path`, or start empty if the file does not
    /// exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RateLimitStoreError> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(text) => {
                serde_json::from_str(&text).map_err(|source| RateLimitStoreError::InvalidStore {
                    path: path.clone(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(RateLimitStoreError::Io { path, source }),
        };
        Ok(Self { path, records })
    }

    /// Look up the last-sent time recorded for `key`.
    #[must_use]
    pub fn get_last_sent(&self, key: &str) -> Option<u64> {
        self.records.get(key).map(|r| r.last_sent_ms)
    }

    /// Record `now_ms` as the last-sent time for `key` and persist the
    /// store atomically (write-temp-then-rename).
    pub fn set_last_sent(&mut self, key: &str, now_ms: u64) -> Result<(), RateLimitStoreError> {
        self.records
            .insert(key.to_string(), RateLimitRecord { last_sent_ms: now_ms });
        self.persist()
    }

    fn persist(&self) -> Result<(), RateLimitStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| RateLimitStoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let body = serde_json::to_vec_pretty(&self.records).map_err(|source| {
            RateLimitStoreError::InvalidStore {
                path: self.path.clone(),
                source,
            }
        })?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &body).map_err(|source| RateLimitStoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| RateLimitStoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

/// Derive a rate-limit key from a target URL: host + path, no query string,
/// optionally suffixed with a driver id.
#[must_use]
pub fn derive_key(target_url: &str, driver_id: Option<&str>) -> String {
    let without_scheme = target_url.split("://").nth(1).unwrap_or(target_url);
    let path_start = without_scheme.find('/').unwrap_or(without_scheme.len());
    let host = &without_scheme[..path_start];
    let rest = &without_scheme[path_start..];
    let path = rest.split(['?', '#']).next().unwrap_or(rest);
    match driver_id {
        Some(id) => format!("{host}{path}::{id}"),
        None => format!("{host}{path}"),
    }
}
