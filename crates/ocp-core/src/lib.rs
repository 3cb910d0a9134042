// SPDX-License-Identifier: MIT OR Apache-2.0
//! ocp-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Canonical, schema-shaped data model shared by every crate in the
//! workspace: [`Plan`], [`ToolPool`], [`InstructionProfile`], [`Episode`],
//! the delivery-side [`PolicyProfile`], and the small persisted records
//! ([`IdempotencyRecord`], [`RateLimitRecord`]) that back the outbound
//! pipeline's stores.
//!
//! If you only take one dependency from this workspace, take this one.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// `mova_version` stamped onto every episode.
pub const MOVA_VERSION: &str = "4.1.1";

// ---------------------------------------------------------------------------
// RequestEnvelope
// ---------------------------------------------------------------------------

/// Opaque bag passed by the caller. Preserved verbatim (after redaction) as
/// `request.envelope.json`; the interpreter never interprets its shape.
pub type RequestEnvelope = serde_json::Value;

// ---------------------------------------------------------------------------
// Plan / Step
// ---------------------------------------------------------------------------

/// A declarative, ordered sequence of side-effecting [`Step`]s.
///
/// Immutable once validated. There is no control flow, no conditions, no
/// expressions, and no embedded code: a plan is data, not a program.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    /// Canonical operation name for the whole plan (e.g. `delivery.v1`).
    pub verb: String,
    /// Opaque reference to the subject of this plan.
    pub subject_ref: String,
    /// Opaque reference to the object this plan acts on.
    pub object_ref: String,
    /// The plan body.
    pub payload: PlanPayload,
}

/// The step sequence carried by a [`Plan`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlanPayload {
    /// Ordered sequence of steps. Execution order is the array order.
    pub steps: Vec<Step>,
}

/// One unit of execution referencing one [`Tool`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    /// Identifier unique within the enclosing plan.
    pub id: String,
    /// Canonical operation name (must equal `tool.binding.driver_kind`).
    pub verb: String,
    /// References a [`Tool`] in the active [`ToolPool`].
    pub connector_id: String,
    /// Literal input, mutually exclusive with `input_from`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    /// Project input from a previously executed step's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_from: Option<StepInputSource>,
    /// Logical id of the schema the step's output must validate against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output_schema_ref: Option<String>,
    /// Whether a failure of this step stops the run or is recorded and
    /// skipped.
    #[serde(default)]
    pub on_error: OnError,
}

/// Source of a step's input when it is projected from a prior step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepInputSource {
    /// The prior step whose output is reused. Must already have executed.
    pub step_id: String,
    /// Optional dotted path projected out of that step's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Whether a step's failure is fatal to the run or merely recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Stop the run; the episode and final summary are still written.
    #[default]
    Fatal,
    /// Record the failure and continue with the next step.
    Soft,
}

// ---------------------------------------------------------------------------
// ToolPool / Tool
// ---------------------------------------------------------------------------

/// The set of [`Tool`]s available to a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct ToolPool {
    /// Tools in the pool, keyed by [`Tool::id`] at lookup time.
    pub tools: Vec<Tool>,
}

impl ToolPool {
    /// Find a tool by id.
    #[must_use]
    pub fn find(&self, id: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.id == id)
    }
}

/// A pool-scoped capability composed of a connector contract and its
/// runtime binding.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Tool {
    /// Unique id within the pool.
    pub id: String,
    /// Connector name (protocol/family the tool speaks).
    pub connector: String,
    /// Driver kind, allowlist, limits, and schema refs for this tool.
    pub binding: ToolBinding,
}

/// The runtime binding of a [`Tool`]: which driver handles it, what it may
/// reach, and what bounds apply.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolBinding {
    /// Name of the driver that executes steps bound to this tool.
    pub driver_kind: String,
    /// Allowed destination patterns (host[:port], scheme-qualified).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_allowlist: Option<Vec<String>>,
    /// Required resource bounds for this tool.
    pub limits: ToolLimits,
    /// Schema refs for this tool's input/output, if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_refs: Option<ToolSchemaRefs>,
}

/// Resource bounds attached to a [`ToolBinding`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolLimits {
    /// Required deadline for any call this tool makes.
    pub timeout_ms: u64,
    /// Optional cap on request/response payload size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_data_size: Option<u64>,
}

/// Logical schema ids bound to a tool's input/output.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct ToolSchemaRefs {
    /// Logical schema id for input validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Logical schema id for output validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

// ---------------------------------------------------------------------------
// InstructionProfile
// ---------------------------------------------------------------------------

/// Informational upper bounds and redaction hints for a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct InstructionProfile {
    /// Upper bounds checked by the policy engine.
    #[serde(default)]
    pub caps: InstructionCaps,
    /// Ordered redaction patterns applied in addition to the built-in set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redaction_rules: Option<Vec<String>>,
}

/// Upper bounds a plan must respect; violations are policy denials.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct InstructionCaps {
    /// Maximum timeout any tool binding may declare.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout_ms: Option<u64>,
    /// Maximum payload size any tool binding may declare.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_data_size: Option<u64>,
    /// Maximum number of steps a plan may contain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Per-run mutable context, created at `run_plan` entry and discarded at
/// its return. Never shared across runs.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Globally unique id for this run.
    pub run_id: Uuid,
    /// Globally unique id for the originating request.
    pub request_id: Uuid,
    /// Path to this run's evidence directory.
    pub evidence_dir: std::path::PathBuf,
    /// Opaque outputs of steps executed so far, keyed by step id.
    pub step_outputs: BTreeMap<String, serde_json::Value>,
    /// Set once any security event of severity `>= high` has fired.
    pub has_fatal_security_event: bool,
}

impl RunContext {
    /// Start a new, empty run context rooted at `evidence_dir`.
    #[must_use]
    pub fn new(request_id: Uuid, run_id: Uuid, evidence_dir: std::path::PathBuf) -> Self {
        Self {
            run_id,
            request_id,
            evidence_dir,
            step_outputs: BTreeMap::new(),
            has_fatal_security_event: false,
        }
    }

    /// Record a step's output for later projection by `input_from`.
    pub fn record_step_output(&mut self, step_id: impl Into<String>, output: serde_json::Value) {
        self.step_outputs.insert(step_id.into(), output);
    }

    /// Mark that a security event forcing run failure has occurred.
    pub fn mark_fatal_security_event(&mut self) {
        self.has_fatal_security_event = true;
    }
}

// ---------------------------------------------------------------------------
// Episode
// ---------------------------------------------------------------------------

/// Terminal/interim status of an episode or run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Not yet started.
    Pending,
    /// Currently executing.
    InProgress,
    /// Finished without error.
    Completed,
    /// Finished with a fatal error.
    Failed,
    /// Finished with some steps skipped or soft-failed.
    Partial,
    /// Aborted before completion.
    Cancelled,
    /// Never attempted.
    Skipped,
}

/// Identity of the component that produced an episode.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Executor {
    /// Component name, e.g. `"plan_interpreter"`.
    pub name: String,
    /// Component version string.
    pub version: String,
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            name: "plan_interpreter".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// An immutable record of a validated event, emitted during a run.
///
/// Episodes never mutate after being written: a correction is a new
/// episode, not an edit.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "episode_type_kind")]
pub enum Episode {
    /// A step boundary or run-summary event.
    Execution(ExecutionEpisode),
    /// A policy denial or other security-relevant event.
    Security(SecurityEventEpisode),
}

impl Episode {
    /// The common `episode_id` regardless of variant.
    #[must_use]
    pub fn episode_id(&self) -> &str {
        match self {
            Self::Execution(e) => &e.common.episode_id,
            Self::Security(e) => &e.common.episode_id,
        }
    }

    /// The common fields shared by both variants.
    #[must_use]
    pub fn common(&self) -> &EpisodeCommon {
        match self {
            Self::Execution(e) => &e.common,
            Self::Security(e) => &e.common,
        }
    }
}

/// Fields shared by every episode variant.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EpisodeCommon {
    /// Unique id, `exec_<ms>_<rand>` or `sec_<ms>_<rand>`.
    pub episode_id: String,
    /// Discriminator string, e.g. `execution_step`, `execution_run_summary`,
    /// or `security_event/policy_violation`.
    pub episode_type: String,
    /// Protocol version this episode conforms to.
    pub mova_version: String,
    /// Wall-clock time the episode was recorded.
    pub recorded_at: DateTime<Utc>,
    /// Component that produced the episode.
    pub executor: Executor,
    /// Outcome of the event this episode describes.
    pub result_status: ResultStatus,
    /// Short human-readable summary.
    pub result_summary: String,
    /// References to the input data this episode concerns.
    #[serde(default)]
    pub input_data_refs: Vec<String>,
    /// Passthrough/overflow bag: `request_id`, `run_id`, `evidence_dir`, and
    /// any field relocated here by the `additionalProperties` strip protocol.
    #[serde(default)]
    pub meta_episode: BTreeMap<String, serde_json::Value>,
}

/// An execution-step or run-summary episode.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionEpisode {
    /// Fields shared with [`SecurityEventEpisode`].
    #[serde(flatten)]
    pub common: EpisodeCommon,
}

/// A policy-violation or other security-relevant episode.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SecurityEventEpisode {
    /// Fields shared with [`ExecutionEpisode`].
    #[serde(flatten)]
    pub common: EpisodeCommon,
    /// Fine-grained kind, e.g. `destination_not_allowlisted`.
    pub security_event_type: String,
    /// Category bucket this event is filed under.
    pub security_event_category: ocp_error::SecurityEventCategory,
    /// How severe this event is.
    pub severity: ocp_error::Severity,
    /// The policy profile active when the event fired, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_profile_id: Option<String>,
    /// Version of the policy/security rule set in force.
    pub security_model_version: String,
    /// What subsystem detected and raised this event.
    pub detection_source: String,
}

// ---------------------------------------------------------------------------
// PolicyProfile (delivery) / RateLimitPolicy
// ---------------------------------------------------------------------------

/// Named document configuring the outbound delivery pipeline: targets,
/// HMAC requirement, retry, and throttle behavior.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PolicyProfile {
    /// Identifier for this profile (selected via `OCP_POLICY_PROFILE_ID`).
    pub id: String,
    /// Hosts this profile permits outbound delivery to.
    pub allowed_targets: Vec<String>,
    /// Whether a signing secret is mandatory for this profile.
    pub require_hmac: bool,
    /// Deadline applied to each outbound attempt.
    pub timeout_ms: u64,
    /// Maximum payload size, in bytes, this profile accepts.
    pub max_payload_bytes: u64,
    /// Whether real sends are permitted under this profile at all.
    pub allow_real_send: bool,
    /// Whether the retry engine is engaged for this profile.
    pub retry_enabled: bool,
    /// Maximum attempts when retry is enabled.
    pub max_attempts: u32,
    /// HTTP status codes that trigger a retry.
    pub retry_on_status: Vec<u16>,
    /// Base backoff in milliseconds for the retry schedule.
    pub base_backoff_ms: u64,
    /// Upper bound on any single backoff interval.
    pub max_backoff_ms: u64,
    /// Cooldown-based throttling configuration.
    pub rate_limit: RateLimitPolicy,
}

/// Cooldown-based throttling configuration embedded in a [`PolicyProfile`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RateLimitPolicy {
    /// Whether cooldown enforcement is active.
    pub enabled: bool,
    /// Minimum interval, in milliseconds, between successful sends sharing
    /// a rate-limit key.
    pub cooldown_ms: u64,
    /// Strict profiles reject requests within cooldown; non-strict ones
    /// record and suppress without rejecting the caller.
    pub strict: bool,
}

// ---------------------------------------------------------------------------
// IdempotencyRecord / RateLimitRecord
// ---------------------------------------------------------------------------

/// One entry in the idempotency store, keyed externally by the caller's
/// idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IdempotencyRecord {
    /// Hex-encoded SHA-256 of the canonical payload that was sent.
    pub payload_sha256: String,
    /// Path to the `evidence.json` of the first delivery with this key.
    pub first_evidence_path: String,
    /// Epoch milliseconds the record was created.
    pub created_at_ms: u64,
}

/// One entry in the rate-limit store, keyed externally by target + path
/// (+ optional driver id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RateLimitRecord {
    /// Epoch milliseconds of the last successful send under this key.
    pub last_sent_ms: u64,
}

// ---------------------------------------------------------------------------
// DeliveryResult
// ---------------------------------------------------------------------------

/// The deterministic result of one `delivery.v1` orchestration, plus
/// pointers to the evidence written for it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeliveryResult {
    /// Deterministic subset of the outcome (safe to compare byte-for-byte
    /// across runs, up to `request_id`/`run_id`).
    pub result_core: ResultCore,
    /// Paths to the artifacts this run produced.
    pub evidence: DeliveryEvidencePaths,
}

/// Deterministic fields of a delivery outcome. Timestamps, hashes, policy
/// decisions, and latencies never appear here — see `evidence.json`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResultCore {
    /// The originating request id.
    pub request_id: Uuid,
    /// This run's id.
    pub run_id: Uuid,
    /// Always `"http_webhook_delivery_v1"` for this verb.
    pub driver_kind: String,
    /// The destination URL.
    pub target_url: String,
    /// Whether the payload was actually delivered (2xx response).
    pub delivered: bool,
    /// HTTP status code of the final attempt, if any request was made.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Always `false`: this runtime performs real sends only.
    pub dry_run: bool,
}

/// Paths to the artifacts a delivery run wrote.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeliveryEvidencePaths {
    /// Path to the redacted request artifact.
    pub request_path: String,
    /// Path to `result_core.json`.
    pub result_core_path: String,
    /// Path to the rich `evidence.json`.
    pub evidence_path: String,
}
