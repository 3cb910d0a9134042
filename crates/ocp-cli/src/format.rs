// SPDX-License-Identifier: MIT OR Apache-2.0
//! Output formatting for `ocp` subcommand results.

use ocp_doctor::{DoctorReport, ScanOutcome, ScanStatus};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Supported output formats for CLI display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed JSON.
    Json,
    /// Human-readable multi-line text (the default).
    Text,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Text => "text",
        })
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// Render a [`DoctorReport`] for display, given the path it was persisted
/// to.
#[must_use]
pub fn format_doctor_report(format: OutputFormat, report: &DoctorReport, report_path: &Path) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
        OutputFormat::Text => {
            let mut out = String::new();
            for check in &report.checks {
                let mark = if check.ok { "PASS" } else { "FAIL" };
                out.push_str(&format!("[{mark}] {}: {}\n", check.name, check.detail));
            }
            out.push_str(&format!("report: {}\n", report_path.display()));
            out.push_str(if report.all_ok() {
                "doctor: OK\n"
            } else {
                "doctor: ISSUES FOUND\n"
            });
            out
        }
    }
}

/// Render a [`ScanOutcome`] for display.
#[must_use]
pub fn format_scan_outcome(format: OutputFormat, outcome: &ScanOutcome) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(outcome).unwrap_or_default(),
        OutputFormat::Text => {
            let mut out = String::new();
            for m in &outcome.matches {
                out.push_str(&format!(
                    "{}: pattern={} snippet_sha256={}\n",
                    m.file, m.pattern, m.snippet_hash
                ));
            }
            out.push_str(match outcome.status {
                ScanStatus::Clean => "scan: CLEAN\n",
                ScanStatus::FindingsPresent => "scan: FINDINGS PRESENT\n",
            });
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_format_parses_known_names_case_insensitively() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn scan_text_output_reports_clean_status() {
        let outcome = ScanOutcome {
            status: ScanStatus::Clean,
            matches: vec![],
        };
        let rendered = format_scan_outcome(OutputFormat::Text, &outcome);
        assert!(rendered.contains("CLEAN"));
    }
}
