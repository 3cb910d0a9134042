//! ocp-evidence
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Atomic, redacted JSON artifact writer for per-run evidence directories
//! (component C2). Every artifact written through this crate is redacted
//! exactly once, serialized with two-space indentation, and replaces its
//! target via write-temp-then-rename so a crash never leaves a half-written
//! file behind.

use ocp_redact::redact;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while creating run directories or writing artifacts.
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// A directory could not be created.
    #[error("cannot create directory {path}: {source}")]
    CreateDir {
        /// The offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The value could not be serialized to JSON.
    #[error("cannot serialize artifact {name}: {source}")]
    Serialize {
        /// The artifact filename.
        name: String,
        /// Underlying serialization error.
        #[source]
        source: serde_json::Error,
    },
    /// The temp file could not be written, or the rename failed.
    #[error("cannot write artifact {path}: {source}")]
    Write {
        /// The offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Root of the on-disk evidence tree for plan-interpreter runs, per §6:
/// `artifacts/mova_agent/<request_id>/runs/<run_id>/`.
#[must_use]
pub fn run_dir(artifacts_root: &Path, request_id: Uuid, run_id: Uuid) -> PathBuf {
    artifacts_root
        .join("mova_agent")
        .join(request_id.to_string())
        .join("runs")
        .join(run_id.to_string())
}

/// Root of the on-disk evidence tree for a delivery verb, per §6:
/// `artifacts/<verb>/<request_id>/runs/<run_id>/`.
#[must_use]
pub fn delivery_run_dir(artifacts_root: &Path, verb: &str, request_id: Uuid, run_id: Uuid) -> PathBuf {
    artifacts_root
        .join(verb)
        .join(request_id.to_string())
        .join("runs")
        .join(run_id.to_string())
}

/// Create `dir` (and all required subdirectories) if absent.
pub fn create_run_dir(dir: &Path) -> Result<PathBuf, EvidenceError> {
    std::fs::create_dir_all(dir).map_err(|source| EvidenceError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;
    std::fs::create_dir_all(dir.join("logs")).map_err(|source| EvidenceError::CreateDir {
        path: dir.join("logs"),
        source,
    })?;
    std::fs::create_dir_all(dir.join("episodes")).map_err(|source| EvidenceError::CreateDir {
        path: dir.join("episodes"),
        source,
    })?;
    Ok(dir.to_path_buf())
}

/// Write `value` as `<dir>/<filename>`, redacted, with two-space indent,
/// replacing the existing file atomically.
///
/// If a file already exists at the target path, a copy of it is placed
/// under `<dir>/_backup/<unix_ms>_<filename>.bak` before the rename so the
/// prior artifact is never silently lost. On any failure the original file
/// (if any) is left intact and no `.tmp` file is left behind.
pub fn write_artifact<T: Serialize>(
    dir: &Path,
    filename: &str,
    value: &T,
) -> Result<PathBuf, EvidenceError> {
    std::fs::create_dir_all(dir).map_err(|source| EvidenceError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let redacted = redact(&serde_json::to_value(value).map_err(|source| {
        EvidenceError::Serialize {
            name: filename.to_string(),
            source,
        }
    })?);
    let body = serde_json::to_vec_pretty(&redacted).map_err(|source| EvidenceError::Serialize {
        name: filename.to_string(),
        source,
    })?;

    let target = dir.join(filename);
    let tmp = dir.join(format!("{filename}.tmp"));

    let write_result = std::fs::write(&tmp, &body);
    if let Err(source) = write_result {
        let _ = std::fs::remove_file(&tmp);
        return Err(EvidenceError::Write { path: tmp, source });
    }

    if target.exists() {
        if let Err(source) = backup_existing(dir, filename, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(source);
        }
    }

    if let Err(source) = std::fs::rename(&tmp, &target) {
        let _ = std::fs::remove_file(&tmp);
        return Err(EvidenceError::Write {
            path: target,
            source,
        });
    }

    Ok(target)
}

fn backup_existing(dir: &Path, filename: &str, target: &Path) -> Result<(), EvidenceError> {
    let backup_dir = dir.join("_backup");
    std::fs::create_dir_all(&backup_dir).map_err(|source| EvidenceError::CreateDir {
        path: backup_dir.clone(),
        source,
    })?;
    let unix_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let backup_path = backup_dir.join(format!("{unix_ms}_{filename}.bak"));
    std::fs::copy(target, &backup_path).map_err(|source| EvidenceError::Write {
        path: backup_path,
        source,
    })?;
    Ok(())
}

/// Append one line to `<dir>/<filename>`, creating it if absent. Used for
/// per-step logs (`logs/<step_id>.log`) and the episode index
/// (`episodes/index.jsonl`), both of which are append-only.
pub fn append_line(dir: &Path, filename: &str, line: &str) -> Result<PathBuf, EvidenceError> {
    use std::io::Write as _;

    std::fs::create_dir_all(dir).map_err(|source| EvidenceError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(filename);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| EvidenceError::Write {
            path: path.clone(),
            source,
        })?;
    writeln!(file, "{line}").map_err(|source| EvidenceError::Write {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}
