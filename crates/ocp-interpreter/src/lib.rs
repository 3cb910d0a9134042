// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Deterministic, single-threaded plan interpreter (component C5).
//!
//! `run_plan` validates a [`Plan`], [`ToolPool`], and [`InstructionProfile`]
//! against their schemas, creates an isolated evidence directory, then
//! executes the plan's steps strictly in order: resolving each step's
//! input, enforcing policy and the optional token budget, dispatching to
//! the resolved driver, validating the output, and recording a step log and
//! execution episode before moving to the next step. Steps never run
//! concurrently within one run.

pub mod budget;

use budget::{BudgetAction, BudgetCheck, BudgetEnforcer, TokenBudgetContract};
use chrono::Utc;
use ocp_core::{
    InstructionProfile, OnError, Plan, RequestEnvelope, ResultStatus, RunContext, Step,
    StepInputSource, ToolPool,
};
use ocp_driver::{Driver, DriverContext, DriverRegistry};
use ocp_episode::EpisodeWriter;
use ocp_error::{ErrorCode, MovaError, MovaErrorDto};
use ocp_policy::{PolicyEngine, StepContext};
use ocp_schema::SchemaRegistry;
use serde_json::{Value, json};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Schema id the caller-supplied `Plan` is validated against.
pub const PLAN_SCHEMA_ID: &str = "plan";
/// Schema id the caller-supplied `ToolPool` is validated against.
pub const TOOL_POOL_SCHEMA_ID: &str = "tool_pool";
/// Schema id the caller-supplied `InstructionProfile` is validated against.
pub const INSTRUCTION_PROFILE_SCHEMA_ID: &str = "instruction_profile";
/// Schema id the caller-supplied request envelope is validated against.
pub const REQUEST_ENVELOPE_SCHEMA_ID: &str = "request_envelope";

/// Top-level failure of a `run_plan` call. Every variant carries a stable
/// [`ErrorCode`] so the caller and the episode it produced agree on
/// classification.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The plan, tool pool, instruction profile, or request envelope failed
    /// schema validation.
    #[error("{kind} failed schema validation: {errors:?}")]
    ValidationFailed {
        /// Which artifact failed (`"plan"`, `"tool_pool"`, ...).
        kind: &'static str,
        /// Structured validation errors.
        errors: Vec<String>,
    },
    /// A step's `input_from` referenced a step id that has not executed.
    #[error("step {step_id} references unexecuted prior step {missing_step_id}")]
    UnknownPriorStep {
        /// The step whose `input_from` could not be resolved.
        step_id: String,
        /// The referenced step id that was never executed.
        missing_step_id: String,
    },
    /// No driver is registered under the step's `binding.driver_kind`.
    #[error("no driver registered for step {step_id}'s driver kind {driver_kind:?}")]
    HandlerNotFound {
        /// The step that could not resolve a driver.
        step_id: String,
        /// The driver kind that was requested.
        driver_kind: String,
    },
    /// Writing evidence or an episode failed.
    #[error(transparent)]
    Evidence(#[from] ocp_evidence::EvidenceError),
    /// Writing an episode failed after exhausting the strip protocol.
    #[error(transparent)]
    Episode(#[from] ocp_episode::EpisodeWriteError),
}

impl RuntimeError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::ValidationFailed { .. } => ErrorCode::ValidationFailed,
            Self::UnknownPriorStep { .. } => ErrorCode::InputValidationFailed,
            Self::HandlerNotFound { .. } => ErrorCode::HandlerNotFound,
            Self::Evidence(_) | Self::Episode(_) => ErrorCode::ExecutionError,
        }
    }
}

/// Everything `run_plan` needs to execute one plan.
///
/// `token_budget` arrives already resolved: reading and parsing
/// `token_budget_path` from disk is an ambient-config concern handled
/// upstream, the same way [`ocp_delivery::DeliveryEnv`] never reads
/// `std::env` itself.
pub struct RunPlanRequest {
    /// Opaque caller payload, preserved verbatim (after redaction) as
    /// `request.envelope.json`.
    pub request_envelope: RequestEnvelope,
    /// The plan to execute.
    pub plan: Plan,
    /// The tool pool steps may bind against.
    pub tool_pool: ToolPool,
    /// Caps and redaction hints in force for this run.
    pub instruction_profile: InstructionProfile,
    /// Resolved token-budget contract, if `token_budget_path` was supplied.
    pub token_budget: Option<TokenBudgetContract>,
}

/// The result of one `run_plan` call: whether the run succeeded, and the
/// `run_summary.json` document that was written to the evidence directory.
#[derive(Debug, Clone)]
pub struct RunPlanOutcome {
    /// `true` iff the run completed with no fatal security event and no
    /// unrecovered execution error.
    pub success: bool,
    /// The final `execution_run_summary` document.
    pub run_summary: Value,
    /// Path to the run's evidence directory.
    pub evidence_dir: std::path::PathBuf,
}

/// Execute `request` to completion. Schemas must already be loaded into
/// `schemas` and drivers into `drivers`; both are process-lifetime,
/// effectively-immutable resources shared across runs. `artifacts_root` is
/// the root evidence directory (see `ocp_evidence::run_dir`).
pub async fn run_plan(
    request: RunPlanRequest,
    schemas: &SchemaRegistry,
    drivers: &DriverRegistry,
    artifacts_root: &Path,
) -> RunPlanOutcome {
    let request_id = Uuid::new_v4();
    let run_id = Uuid::new_v4();
    let evidence_dir = ocp_evidence::run_dir(artifacts_root, request_id, run_id);
    let _ = ocp_evidence::create_run_dir(&evidence_dir);

    let mut ctx = RunContext::new(request_id, run_id, evidence_dir.clone());
    let episodes = EpisodeWriter::new(&evidence_dir, schemas, request_id, run_id);

    // Step 2: validate the four boundary artifacts.
    if let Err(err) = validate_boundary_artifacts(schemas, &request) {
        record_security_event(&episodes, &mut ctx, &err, "schema_validation");
        return finish_failed(&evidence_dir, &err, ctx.has_fatal_security_event);
    }

    // Step 3: persist the four resolved artifacts.
    let _ = ocp_evidence::write_artifact(&evidence_dir, "request.envelope.json", &request.request_envelope);
    let _ = ocp_evidence::write_artifact(&evidence_dir, "plan.envelope.json", &request.plan);
    let _ = ocp_evidence::write_artifact(&evidence_dir, "tool_pool.resolved.json", &request.tool_pool);
    let _ = ocp_evidence::write_artifact(
        &evidence_dir,
        "instruction_profile.resolved.json",
        &request.instruction_profile,
    );

    // Step 4: token budget contract, if any.
    if let Some(contract) = &request.token_budget {
        let _ = ocp_evidence::write_artifact(&evidence_dir, "token_budget.resolved.json", contract);
    }
    let budget = BudgetEnforcer::from_optional(request.token_budget.clone());

    let policy = PolicyEngine::with_default_rules(&request.tool_pool, None);
    let caps = request.instruction_profile.caps.clone();
    if ocp_policy::exceeds_step_count_cap(&caps, request.plan.payload.steps.len()) {
        let err = RuntimeError::ValidationFailed {
            kind: "plan",
            errors: vec!["plan exceeds instruction_profile.caps.max_steps".to_string()],
        };
        record_security_event(&episodes, &mut ctx, &err, "max_steps_cap");
        return finish_failed(&evidence_dir, &err, true);
    }

    let mut exec_error: Option<RuntimeError> = None;

    // Step 5: execute steps strictly in order.
    for step in &request.plan.payload.steps {
        let tool = request.tool_pool.find(&step.connector_id);

        let input = match resolve_step_input(step, &ctx) {
            Ok(v) => v,
            Err(err) => {
                record_security_event(&episodes, &mut ctx, &err, "input_resolution");
                exec_error = Some(err);
                break;
            }
        };

        if let Some(schema_ref) = &step.expected_output_schema_ref {
            let outcome = schemas.validate(schema_ref, &input);
            if !outcome.ok {
                let err = RuntimeError::ValidationFailed {
                    kind: "step_input",
                    errors: outcome.errors.iter().map(|e| e.message.clone()).collect(),
                };
                let fatal = step.on_error == OnError::Fatal;
                record_denied_step(&episodes, &mut ctx, step, &err, fatal);
                if fatal {
                    exec_error = Some(err);
                    break;
                }
                continue;
            }
        }

        // Policy enforcement (§4.4).
        let decision = policy.evaluate(&StepContext { step, tool, caps: &caps });
        if !decision.allowed {
            let code = decision.error_code.unwrap_or(ErrorCode::ValidationFailed);
            tracing::warn!(step_id = %step.id, rule_id = %decision.rule_id, "policy denied step");
            let fatal = step.on_error == OnError::Fatal || code.severity().forces_run_failure();
            record_policy_denial(&episodes, &mut ctx, step, &decision.rule_id, &decision.reason, code, fatal);
            if step.on_error == OnError::Fatal {
                exec_error_from_code(&mut exec_error, code, &decision.reason);
                break;
            }
            continue;
        }

        // Token-budget allowance (§4.5 step d). Input size stands in for an
        // estimated token count; drivers with real usage accounting can
        // supply it via a future richer contract.
        let estimated_tokens = input.to_string().len() as u64;
        match budget.check_allowance(estimated_tokens) {
            BudgetCheck::Allow => {}
            BudgetCheck::Warn(violation) => {
                tracing::warn!(step_id = %step.id, %violation, "token budget warning");
                let _ = episodes.write_security_event(json!({
                    "result_summary": format!("token budget warning on step {}", step.id),
                    "security_event_type": "token_budget_warning",
                    "security_event_category": "policy_violation",
                    "severity": "medium",
                    "detection_source": "ocp-interpreter::budget",
                }));
            }
            BudgetCheck::Deny(violation) => {
                tracing::warn!(step_id = %step.id, %violation, "token budget exceeded, denying step");
                let err = RuntimeError::ValidationFailed {
                    kind: "token_budget",
                    errors: vec![violation.to_string()],
                };
                let fatal = step.on_error == OnError::Fatal;
                record_denied_step(&episodes, &mut ctx, step, &err, fatal);
                if fatal {
                    exec_error = Some(err);
                    break;
                }
                continue;
            }
        }

        // Resolve and execute the driver (steps e, f).
        let Some(tool) = tool else {
            // tool-in-pool was already enforced by policy above; unreachable
            // in practice, but handled defensively without panicking.
            continue;
        };
        let driver = match drivers.get(&tool.binding.driver_kind) {
            Ok(d) => d,
            Err(_) => {
                let err = RuntimeError::HandlerNotFound {
                    step_id: step.id.clone(),
                    driver_kind: tool.binding.driver_kind.clone(),
                };
                record_security_event(&episodes, &mut ctx, &err, "driver_resolution");
                exec_error = Some(err);
                break;
            }
        };
        let driver_ctx = DriverContext {
            driver_name: tool.binding.driver_kind.clone(),
            allowlist: tool.binding.destination_allowlist.clone(),
            limits: tool.binding.limits.clone(),
            binding: tool.binding.clone(),
        };

        let output = match driver.execute(input.clone(), &driver_ctx).await {
            Ok(v) => v,
            Err(e) => {
                let reason = e.to_string();
                let err_code = ErrorCode::ExecutionError;
                let fatal = step.on_error == OnError::Fatal;
                record_policy_denial(&episodes, &mut ctx, step, "driver-execution", &reason, err_code, fatal);
                if fatal {
                    exec_error_from_code(&mut exec_error, err_code, &reason);
                    break;
                }
                continue;
            }
        };

        // Step g: output byte cap and budget recording.
        let output_bytes = output.to_string().len() as u64;
        if let Some(max) = caps.max_data_size {
            if output_bytes > max {
                let err = RuntimeError::ValidationFailed {
                    kind: "step_output",
                    errors: vec![format!("output {output_bytes} bytes exceeds caps.max_data_size {max}")],
                };
                let fatal = step.on_error == OnError::Fatal;
                record_denied_step(&episodes, &mut ctx, step, &err, fatal);
                if fatal {
                    exec_error = Some(err);
                    break;
                }
                continue;
            }
        }
        budget.record_call(output_bytes);

        // Step h: output schema validation.
        if let Some(schema_refs) = &tool.binding.schema_refs {
            if let Some(output_schema) = &schema_refs.output {
                let outcome = schemas.validate(output_schema, &output);
                if !outcome.ok {
                    let err = RuntimeError::ValidationFailed {
                        kind: "step_output",
                        errors: outcome.errors.iter().map(|e| e.message.clone()).collect(),
                    };
                    let fatal = step.on_error == OnError::Fatal;
                    record_denied_step(&episodes, &mut ctx, step, &err, fatal);
                    if fatal {
                        exec_error = Some(err);
                        break;
                    }
                    continue;
                }
            }
        }

        // Step i: step log and completed episode.
        ctx.record_step_output(step.id.clone(), output.clone());
        let _ = ocp_evidence::append_line(
            &evidence_dir.join("logs"),
            &format!("{}.log", step.id),
            &json!({"input": input, "output": output, "ts": Utc::now().to_rfc3339()}).to_string(),
        );
        let _ = episodes.write_execution(json!({
            "result_status": "completed",
            "result_summary": format!("step {} completed", step.id),
            "input_data_refs": [step.id.clone()],
        }));
    }

    // Step 6: final run summary.
    let success = !ctx.has_fatal_security_event && exec_error.is_none();
    let status = if success { ResultStatus::Completed } else { ResultStatus::Failed };
    let _ = episodes.write_execution(json!({
        "episode_type": "execution_run_summary",
        "result_status": serde_json::to_value(status).unwrap_or(Value::Null),
        "result_summary": if success { "run completed".to_string() } else {
            exec_error.as_ref().map(ToString::to_string).unwrap_or_else(|| "run failed".to_string())
        },
    }));

    let usage = budget.usage();
    let _ = ocp_evidence::write_artifact(&evidence_dir, "token_usage.json", &usage);

    let run_summary = json!({
        "request_id": request_id,
        "run_id": run_id,
        "success": success,
        "steps_executed": ctx.step_outputs.len(),
        "has_fatal_security_event": ctx.has_fatal_security_event,
        "token_usage": usage,
    });
    let _ = ocp_evidence::write_artifact(&evidence_dir, "run_summary.json", &run_summary);

    RunPlanOutcome { success, run_summary, evidence_dir }
}

fn exec_error_from_code(slot: &mut Option<RuntimeError>, code: ErrorCode, reason: &str) {
    *slot = Some(RuntimeError::ValidationFailed {
        kind: code.as_str(),
        errors: vec![reason.to_string()],
    });
}

fn validate_boundary_artifacts(schemas: &SchemaRegistry, request: &RunPlanRequest) -> Result<(), RuntimeError> {
    let checks: [(&'static str, &'static str, Value); 4] = [
        (
            "request_envelope",
            REQUEST_ENVELOPE_SCHEMA_ID,
            request.request_envelope.clone(),
        ),
        (
            "plan",
            PLAN_SCHEMA_ID,
            serde_json::to_value(&request.plan).unwrap_or(Value::Null),
        ),
        (
            "tool_pool",
            TOOL_POOL_SCHEMA_ID,
            serde_json::to_value(&request.tool_pool).unwrap_or(Value::Null),
        ),
        (
            "instruction_profile",
            INSTRUCTION_PROFILE_SCHEMA_ID,
            serde_json::to_value(&request.instruction_profile).unwrap_or(Value::Null),
        ),
    ];
    for (kind, schema_id, value) in checks {
        let outcome = schemas.validate(schema_id, &value);
        if !outcome.ok {
            return Err(RuntimeError::ValidationFailed {
                kind,
                errors: outcome.errors.into_iter().map(|e| e.message).collect(),
            });
        }
    }
    Ok(())
}

/// Resolve a step's input: literal `input`, or projected from a previously
/// executed step's output via `input_from`, optionally narrowed by a dotted
/// path.
fn resolve_step_input(step: &Step, ctx: &RunContext) -> Result<Value, RuntimeError> {
    if let Some(input) = &step.input {
        return Ok(input.clone());
    }
    let Some(StepInputSource { step_id, path }) = &step.input_from else {
        return Ok(Value::Null);
    };
    let Some(prior_output) = ctx.step_outputs.get(step_id) else {
        return Err(RuntimeError::UnknownPriorStep {
            step_id: step.id.clone(),
            missing_step_id: step_id.clone(),
        });
    };
    Ok(match path {
        Some(dotted) => project_dotted_path(prior_output, dotted),
        None => prior_output.clone(),
    })
}

fn project_dotted_path(value: &Value, dotted: &str) -> Value {
    dotted
        .split('.')
        .fold(Some(value), |cur, segment| cur.and_then(|v| v.get(segment)))
        .cloned()
        .unwrap_or(Value::Null)
}

fn record_security_event(episodes: &EpisodeWriter<'_>, ctx: &mut RunContext, err: &RuntimeError, source: &str) {
    let code = err.error_code();
    ctx.mark_fatal_security_event();
    let _ = episodes.write_security_event(json!({
        "result_summary": err.to_string(),
        "security_event_type": code.as_str().to_ascii_lowercase(),
        "security_event_category": code.category(),
        "severity": code.severity(),
        "detection_source": source,
    }));
}

fn record_policy_denial(
    episodes: &EpisodeWriter<'_>,
    ctx: &mut RunContext,
    step: &Step,
    rule_id: &str,
    reason: &str,
    code: ErrorCode,
    fatal: bool,
) {
    if fatal || code.severity().forces_run_failure() {
        ctx.mark_fatal_security_event();
    }
    let _ = episodes.write_execution(json!({
        "result_status": "failed",
        "result_summary": format!("step {} denied by {}: {}", step.id, rule_id, reason),
        "input_data_refs": [step.id.clone()],
    }));
    let _ = episodes.write_security_event(json!({
        "result_summary": reason,
        "security_event_type": rule_id,
        "security_event_category": code.category(),
        "severity": code.severity(),
        "detection_source": "ocp-policy",
    }));
}

fn record_denied_step(episodes: &EpisodeWriter<'_>, ctx: &mut RunContext, step: &Step, err: &RuntimeError, fatal: bool) {
    let code = err.error_code();
    record_policy_denial(episodes, ctx, step, code.as_str(), &err.to_string(), code, fatal);
}

fn finish_failed(evidence_dir: &Path, err: &RuntimeError, fatal: bool) -> RunPlanOutcome {
    let dto = MovaError::new(err.error_code(), err.to_string());
    let dto: MovaErrorDto = (&dto).into();
    let run_summary = json!({
        "success": false,
        "has_fatal_security_event": fatal,
        "error": dto,
    });
    let _ = ocp_evidence::write_artifact(evidence_dir, "run_summary.json", &run_summary);
    RunPlanOutcome { success: false, run_summary, evidence_dir: evidence_dir.to_path_buf() }
}
