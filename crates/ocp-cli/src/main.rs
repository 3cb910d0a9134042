// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! `ocp`: the operator-facing CLI for the runtime's hygiene tools.
//!
//! Everything that actually interprets plans or delivers webhooks is a
//! library call made by an embedding host (`ocp_interpreter::run_plan`,
//! `ocp_delivery`'s orchestrator); this binary only exposes the Doctor and
//! Scanner checks (component C13) an operator runs by hand or in CI.

use anyhow::Result;
use clap::{Parser, Subcommand};
use ocp_cli::commands::{run_doctor_command, run_scan_command};
use ocp_cli::format::{OutputFormat, format_doctor_report, format_scan_outcome};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Exit code used when a Doctor check fails or the Scanner finds a leak.
const EXIT_FINDINGS: i32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "ocp",
    version,
    about = "Plan interpreter & outbound delivery runtime operator tools"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Output format (`text` or `json`).
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run environment/policy hygiene checks and persist a report.
    Doctor {
        /// Directory containing `<profile_id>.toml`/`.json` policy profile
        /// documents.
        #[arg(long, default_value = "profiles")]
        profiles_dir: PathBuf,

        /// Root of the evidence tree; the report is written under
        /// `<artifacts_root>/doctor/<run_id>/doctor_report.json`.
        #[arg(long, default_value = "artifacts")]
        artifacts_root: PathBuf,
    },

    /// Scan a directory of emitted artifacts for leaked secret material.
    Scan {
        /// Directory to walk.
        root: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("ocp=debug")
    } else {
        EnvFilter::new("ocp=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Doctor {
            profiles_dir,
            artifacts_root,
        } => cmd_doctor(&profiles_dir, &artifacts_root, cli.format),
        Commands::Scan { root } => cmd_scan(&root, cli.format),
    };

    match result {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(EXIT_FINDINGS);
        }
    }
}

fn cmd_doctor(
    profiles_dir: &std::path::Path,
    artifacts_root: &std::path::Path,
    format: OutputFormat,
) -> Result<i32> {
    let outcome = run_doctor_command(profiles_dir, artifacts_root)?;
    print!(
        "{}",
        format_doctor_report(format, &outcome.report, &outcome.report_path)
    );
    Ok(if outcome.report.all_ok() { 0 } else { EXIT_FINDINGS })
}

fn cmd_scan(root: &std::path::Path, format: OutputFormat) -> Result<i32> {
    let outcome = run_scan_command(root)?;
    print!("{}", format_scan_outcome(format, &outcome));
    Ok(if outcome.matches.is_empty() { 0 } else { EXIT_FINDINGS })
}
