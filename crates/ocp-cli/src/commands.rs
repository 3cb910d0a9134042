// SPDX-License-Identifier: MIT OR Apache-2.0
//! Library-level command implementations, kept separate from `main.rs` so
//! they can be exercised without spawning the `ocp` binary.

use anyhow::{Context, Result};
use ocp_doctor::{DoctorReport, ScanOutcome, doctor_run_dir, run_doctor, scan_directory};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Outcome of the `doctor` subcommand: the report itself plus where it was
/// persisted.
#[derive(Debug, Clone)]
pub struct DoctorRunOutcome {
    /// The computed, already-redacted [`DoctorReport`].
    pub report: DoctorReport,
    /// `artifacts/doctor/<run_id>/doctor_report.json`.
    pub report_path: PathBuf,
}

/// Load the selected policy profile (if any) and the process delivery
/// environment, run the four Doctor checks, and persist the redacted
/// report under `artifacts_root/doctor/<run_id>/doctor_report.json`.
///
/// A missing or unreadable profile is not treated as a command failure —
/// `policy_loaded` simply reports `ok: false` so the operator sees it in
/// the report rather than a stack trace.
pub fn run_doctor_command(
    profiles_dir: &Path,
    artifacts_root: &Path,
) -> Result<DoctorRunOutcome> {
    let profile = match ocp_config::load_selected_policy_profile(profiles_dir) {
        Ok(profile) => Some(profile),
        Err(err) => {
            tracing::warn!("no policy profile loaded: {err}");
            None
        }
    };
    let env = ocp_config::load_delivery_env();
    let report = run_doctor(profile.as_ref(), &env);

    let run_id = Uuid::new_v4();
    let dir = doctor_run_dir(artifacts_root, run_id);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create doctor report directory {}", dir.display()))?;
    let report_path = dir.join("doctor_report.json");
    let body = serde_json::to_string_pretty(&report).context("serialize doctor report")?;
    std::fs::write(&report_path, body)
        .with_context(|| format!("write doctor report to {}", report_path.display()))?;

    Ok(DoctorRunOutcome {
        report,
        report_path,
    })
}

/// Walk `root` for leaked secret material (component C13's Scanner).
pub fn run_scan_command(root: &Path) -> Result<ScanOutcome> {
    scan_directory(root).with_context(|| format!("scan artifact tree at {}", root.display()))
}
