// SPDX-License-Identifier: MIT OR Apache-2.0
//! ocp-doctor
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Environment and artifact hygiene checks (component C13): a Doctor report
//! summarizing whether a policy profile is loaded and what it permits, and
//! a Scanner that walks a directory of emitted artifacts looking for leaked
//! secret material.

use ocp_core::PolicyProfile;
use ocp_delivery::DeliveryEnv;
use ocp_redact::redact;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while walking the scanned directory.
#[derive(Debug, Error)]
pub enum DoctorError {
    /// A directory entry could not be read.
    #[error("cannot walk {path}: {source}")]
    Walk {
        /// The root directory being scanned.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Doctor report
// ---------------------------------------------------------------------------

/// One check result in a [`DoctorReport`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DoctorCheck {
    /// Stable check identifier (e.g. `policy_loaded`).
    pub name: String,
    /// `true` if the check passed.
    pub ok: bool,
    /// Human-readable detail, redacted before the report is persisted.
    pub detail: String,
}

/// Report of environment/policy hygiene, written to
/// `artifacts/doctor/<run_id>/doctor_report.json`. The report passes through
/// [`ocp_redact::redact`] before it is ever serialized, so a future check
/// that accidentally surfaces a credential-shaped value is masked rather
/// than persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorReport {
    /// `{policy_loaded, real_send_policy, staging_allowlist, staging_env}`.
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    /// `true` if every check passed.
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }

    /// Look up one check by name.
    #[must_use]
    pub fn check(&self, name: &str) -> Option<&DoctorCheck> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Root of the on-disk evidence tree for a Doctor run:
/// `artifacts/doctor/<run_id>/`.
#[must_use]
pub fn doctor_run_dir(artifacts_root: &Path, run_id: Uuid) -> PathBuf {
    artifacts_root.join("doctor").join(run_id.to_string())
}

/// Run the four Doctor checks against a resolved (possibly absent) policy
/// profile and the current [`DeliveryEnv`], then redact the result.
///
/// - `policy_loaded`: a profile document was found and parsed.
/// - `real_send_policy`: if the profile permits real sends, the process
///   environment must also have them armed.
/// - `staging_allowlist`: the profile's destination allowlist is non-empty.
/// - `staging_env`: if the profile requires HMAC signing, a signing
///   credential must be configured.
#[must_use]
pub fn run_doctor(profile: Option<&PolicyProfile>, env: &DeliveryEnv) -> DoctorReport {
    let mut checks = Vec::new();

    checks.push(match profile {
        Some(p) => DoctorCheck {
            name: "policy_loaded".to_string(),
            ok: true,
            detail: format!("profile '{}' loaded", p.id),
        },
        None => DoctorCheck {
            name: "policy_loaded".to_string(),
            ok: false,
            detail: "no policy profile loaded".to_string(),
        },
    });

    checks.push(match profile {
        Some(p) => {
            let ok = !p.allow_real_send || env.real_send_armed;
            DoctorCheck {
                name: "real_send_policy".to_string(),
                ok,
                detail: format!(
                    "allow_real_send={} env_armed={}",
                    p.allow_real_send, env.real_send_armed
                ),
            }
        }
        None => DoctorCheck {
            name: "real_send_policy".to_string(),
            ok: false,
            detail: "no profile to evaluate".to_string(),
        },
    });

    checks.push(match profile {
        Some(p) if !p.allowed_targets.is_empty() => DoctorCheck {
            name: "staging_allowlist".to_string(),
            ok: true,
            detail: format!("{} target(s) allowlisted", p.allowed_targets.len()),
        },
        _ => DoctorCheck {
            name: "staging_allowlist".to_string(),
            ok: false,
            detail: "allowed_targets is empty".to_string(),
        },
    });

    let credential_present = env.signing_secret.is_some();
    let require_hmac = profile.is_some_and(|p| p.require_hmac);
    checks.push(DoctorCheck {
        name: "staging_env".to_string(),
        ok: !require_hmac || credential_present,
        detail: format!(
            "require_hmac={require_hmac} credential_present={credential_present} \
             real_send_armed={} idempotency_required={} noop_only={}",
            env.real_send_armed, env.require_idempotency, env.allow_noop_only
        ),
    });

    redact_report(DoctorReport { checks })
}

fn redact_report(report: DoctorReport) -> DoctorReport {
    let value = serde_json::to_value(&report).expect("DoctorReport always serializes");
    let redacted = redact(&value);
    serde_json::from_value(redacted).expect("redacted DoctorReport always deserializes")
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Lowercase, literal patterns the Scanner treats as evidence of leaked
/// secret material in an artifact tree.
pub const SCAN_PATTERNS: &[&str] = &[
    "authorization: bearer",
    "test_secret_v1",
    "token=",
    "secret=",
    "api_key",
];

/// One match found by [`scan_directory`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanMatch {
    /// Path of the offending file, relative to the scan root's invocation.
    pub file: String,
    /// Which [`SCAN_PATTERNS`] entry matched.
    pub pattern: String,
    /// SHA-256 hex digest of the matched snippet; never the raw text.
    pub snippet_hash: String,
}

/// Overall verdict of a [`scan_directory`] call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// No pattern matched anywhere under the scanned root.
    Clean,
    /// At least one match was found; the caller should exit non-zero.
    FindingsPresent,
}

/// Result of scanning a directory tree for leaked secret material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOutcome {
    /// [`ScanStatus::FindingsPresent`] iff `matches` is non-empty.
    pub status: ScanStatus,
    /// Every match found, in directory-walk order.
    pub matches: Vec<ScanMatch>,
}

/// Walk every text-readable file under `root` and flag any occurrence of a
/// [`SCAN_PATTERNS`] entry (case-insensitive). Files that cannot be read as
/// UTF-8 (binary artifacts) are skipped rather than treated as an error.
pub fn scan_directory(root: &Path) -> Result<ScanOutcome, DoctorError> {
    let mut matches = Vec::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| DoctorError::Walk {
            path: root.to_path_buf(),
            source: std::io::Error::other(e),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Ok(text) = std::fs::read_to_string(path) else {
            continue;
        };
        let lower = text.to_ascii_lowercase();
        for pattern in SCAN_PATTERNS {
            if let Some(pos) = lower.find(pattern) {
                let snippet = snippet_around(&text, pos, pattern.len());
                matches.push(ScanMatch {
                    file: path.display().to_string(),
                    pattern: (*pattern).to_string(),
                    snippet_hash: hash_snippet(&snippet),
                });
            }
        }
    }
    let status = if matches.is_empty() {
        ScanStatus::Clean
    } else {
        ScanStatus::FindingsPresent
    };
    Ok(ScanOutcome { status, matches })
}

fn snippet_around(text: &str, byte_pos: usize, pattern_len: usize) -> String {
    let start = byte_pos.saturating_sub(20);
    let end = (byte_pos + pattern_len + 20).min(text.len());
    let mut start = start;
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = end;
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    text.get(start..end).unwrap_or("").to_string()
}

fn hash_snippet(snippet: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(snippet.as_bytes());
    format!("{:x}", hasher.finalize())
}
