// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! ocp-telemetry
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Structured telemetry and metrics collection for plan interpreter and
//! delivery runs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::info;

// ---------------------------------------------------------------------------
// RunMetrics
// ---------------------------------------------------------------------------

/// Metrics captured for a single `interpret.v1` or `delivery.v1` run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunMetrics {
    /// The verb that was run, e.g. `interpret.v1` or `delivery.v1`.
    pub verb: String,
    /// Driver kind invoked by the run, e.g. `http_webhook_delivery_v1`, or
    /// `"none"` for runs that denied before reaching a driver.
    pub driver_kind: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Total number of episodes (execution and security event) written.
    pub events_count: u64,
    /// Number of plan steps executed to completion.
    pub steps_executed: u64,
    /// Number of errors encountered.
    pub errors_count: u64,
    /// Number of security events recorded.
    pub security_events_count: u64,
    /// The run's terminal outcome code, if one was reached (e.g.
    /// `SENT`, `SUPPRESSED_DUPLICATE`, `POLICY_DENIED`).
    pub outcome_code: Option<String>,
}

// ---------------------------------------------------------------------------
// MetricsSummary
// ---------------------------------------------------------------------------

/// Aggregated statistics across multiple runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    /// Number of runs recorded.
    pub count: usize,
    /// Mean duration in milliseconds.
    pub mean_duration_ms: f64,
    /// Median (p50) duration in milliseconds.
    pub p50_duration_ms: f64,
    /// 99th-percentile duration in milliseconds.
    pub p99_duration_ms: f64,
    /// Total plan steps executed across all runs.
    pub total_steps_executed: u64,
    /// Total security events recorded across all runs.
    pub total_security_events: u64,
    /// Error rate (errors / total runs).
    pub error_rate: f64,
    /// Per-verb run counts (deterministic ordering).
    pub verb_counts: BTreeMap<String, usize>,
}

impl Default for MetricsSummary {
    fn default() -> Self {
        Self {
            count: 0,
            mean_duration_ms: 0.0,
            p50_duration_ms: 0.0,
            p99_duration_ms: 0.0,
            total_steps_executed: 0,
            total_security_events: 0,
            error_rate: 0.0,
            verb_counts: BTreeMap::new(),
        }
    }
}

/// Compute a percentile value from a **sorted** slice.
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Thread-safe collector for run metrics.
///
/// Wrap in an `Arc` to share across threads (the inner storage is already
/// behind a `Mutex`).
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Vec<RunMetrics>>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new, empty collector.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record a completed run's metrics.
    pub fn record(&self, metrics: RunMetrics) {
        let mut data = self.inner.lock().expect("metrics lock poisoned");
        data.push(metrics);
    }

    /// Return all recorded run metrics.
    pub fn runs(&self) -> Vec<RunMetrics> {
        let data = self.inner.lock().expect("metrics lock poisoned");
        data.clone()
    }

    /// Number of runs recorded so far.
    pub fn len(&self) -> usize {
        let data = self.inner.lock().expect("metrics lock poisoned");
        data.len()
    }

    /// Whether the collector has no recorded runs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute an aggregated summary of all recorded runs.
    pub fn summary(&self) -> MetricsSummary {
        let data = self.inner.lock().expect("metrics lock poisoned");
        if data.is_empty() {
            return MetricsSummary::default();
        }

        let count = data.len();
        let mut durations: Vec<u64> = data.iter().map(|r| r.duration_ms).collect();
        durations.sort_unstable();

        let total_duration: u64 = durations.iter().sum();
        let mean_duration_ms = total_duration as f64 / count as f64;
        let p50_duration_ms = percentile(&durations, 50.0);
        let p99_duration_ms = percentile(&durations, 99.0);

        let total_steps_executed: u64 = data.iter().map(|r| r.steps_executed).sum();
        let total_security_events: u64 = data.iter().map(|r| r.security_events_count).sum();

        let errors: u64 = data.iter().map(|r| r.errors_count).sum();
        let error_rate = errors as f64 / count as f64;

        let mut verb_counts: BTreeMap<String, usize> = BTreeMap::new();
        for r in data.iter() {
            *verb_counts.entry(r.verb.clone()).or_insert(0) += 1;
        }

        MetricsSummary {
            count,
            mean_duration_ms,
            p50_duration_ms,
            p99_duration_ms,
            total_steps_executed,
            total_security_events,
            error_rate,
            verb_counts,
        }
    }

    /// Clear all recorded metrics.
    pub fn clear(&self) {
        let mut data = self.inner.lock().expect("metrics lock poisoned");
        data.clear();
    }
}

// ---------------------------------------------------------------------------
// TelemetrySpan
// ---------------------------------------------------------------------------

/// A structured span for tracing integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySpan {
    /// Span name / operation.
    pub name: String,
    /// Arbitrary key-value attributes (deterministic ordering).
    pub attributes: BTreeMap<String, String>,
}

impl TelemetrySpan {
    /// Create a new span with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Insert an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Emit the span via `tracing::info!`.
    pub fn emit(&self) {
        info!(
            span_name = %self.name,
            attributes = ?self.attributes,
            "telemetry_span"
        );
    }
}

// ---------------------------------------------------------------------------
// TelemetryExporter
// ---------------------------------------------------------------------------

/// Trait for exporting collected metrics.
pub trait TelemetryExporter: Send + Sync {
    /// Export the given summary. Returns the serialized output on success.
    fn export(&self, summary: &MetricsSummary) -> Result<String, String>;
}

/// Exports metrics as pretty-printed JSON to a string.
#[derive(Debug, Default)]
pub struct JsonExporter;

impl TelemetryExporter for JsonExporter {
    fn export(&self, summary: &MetricsSummary) -> Result<String, String> {
        serde_json::to_string_pretty(summary).map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
