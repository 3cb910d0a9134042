#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Composes the policy, driver, retry, rate-limit, and idempotency
//! components into the `delivery.v1` outbound webhook verb (component
//! C11).

use chrono::Utc;
use ocp_core::{DeliveryEvidencePaths, DeliveryResult, PolicyProfile, ResultCore};
use ocp_driver::{DriverContext, DriverRegistry};
use ocp_error::OutcomeCode;
use ocp_idempotency::{IdempotencyDecision, IdempotencyStore};
use ocp_ratelimit::{RateLimitCheck, RateLimitStore, evaluate_rate_limit, throttled_outcome};
use ocp_retry::{AttemptOutcome, RetryOutcome, RetryPolicy, run_with_retry};
use serde_json::{Value, json};
use std::path::Path;
use uuid::Uuid;

/// Wire name of this verb's driver, and the deterministic `driver_kind`
/// recorded in [`ResultCore`].
pub const DRIVER_KIND: &str = "http_webhook_delivery_v1";

/// Environment-derived configuration the orchestrator consumes.
///
/// Reading the underlying `OCP_*`/`WEBHOOK_*` variables is ambient
/// configuration concern handled upstream (by the CLI or embedding host);
/// this orchestrator only ever sees the resolved struct, never `std::env`
/// directly, so it stays unit-testable without process-global state.
#[derive(Debug, Clone, Default)]
pub struct DeliveryEnv {
    /// `OCP_ENABLE_REAL_SEND == "1"`: the process-wide arming switch for
    /// real outbound sends.
    pub real_send_armed: bool,
    /// `WEBHOOK_SIGNING_SECRET`, read once and never logged or persisted.
    pub signing_secret: Option<String>,
    /// `OCP_REQUIRE_IDEMPOTENCY == "1"`.
    pub require_idempotency: bool,
    /// `ALLOW_NOOP_ONLY == "1"`: restrict the driver registry to the
    /// `noop_*` drivers regardless of what the profile would otherwise
    /// allow, for dev-safe environments.
    pub allow_noop_only: bool,
}

/// One outbound delivery request.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Destination URL.
    pub target_url: String,
    /// JSON payload to deliver.
    pub payload: Value,
    /// Caller-supplied idempotency key, if any.
    pub idempotency_key: Option<String>,
    /// Request id this delivery belongs to. Generated by the caller so it
    /// can correlate a delivery with an originating plan run, if any.
    pub request_id: Uuid,
}

/// Why a request was rejected before any store or driver was consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// `target_url`'s host is not in `policy.allowed_targets`.
    HostNotAllowed,
    /// Payload exceeds `policy.max_payload_bytes`.
    PayloadTooLarge,
    /// `policy.require_hmac` is set but no signing secret was supplied.
    MissingSigningSecret,
    /// The policy/arming decision denied a real send.
    PolicyDenied(String),
}

impl RejectionReason {
    fn outcome_code(&self) -> OutcomeCode {
        match self {
            Self::HostNotAllowed | Self::PolicyDenied(_) => OutcomeCode::PolicyDenied,
            Self::PayloadTooLarge => OutcomeCode::BadRequest,
            Self::MissingSigningSecret => OutcomeCode::Unauthorized,
        }
    }
}

/// The full outcome of [`run_delivery`]: the deterministic result plus the
/// stable outcome classification evidence.json records.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    /// The deterministic result and evidence paths, when a run directory
    /// was created. `None` only for a rejection that happens before the
    /// run directory is created (never in the current design, since step
    /// 4 always creates it first per §4.11 — kept `Option` for forward
    /// compatibility with pre-directory rejections).
    pub result: DeliveryResult,
    /// Stable outcome code recorded in `evidence.json`.
    pub outcome_code: OutcomeCode,
}

/// Run the `delivery.v1` verb end to end: assert request shape, evaluate
/// the inline policy, consult idempotency and rate-limit stores, invoke
/// the resolved driver (optionally through the retry engine), and persist
/// `request.json` / `result_core.json` / `evidence.json`.
#[allow(clippy::too_many_arguments)]
pub async fn run_delivery(
    request: DeliveryRequest,
    profile: &PolicyProfile,
    env: &DeliveryEnv,
    drivers: &DriverRegistry,
    idempotency_store: &mut IdempotencyStore,
    rate_limit_store: &mut RateLimitStore,
    artifacts_root: &Path,
) -> DeliveryOutcome {
    let run_id = Uuid::new_v4();
    let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
    let host = ocp_policy::extract_host(&request.target_url);

    let run_dir = ocp_evidence::delivery_run_dir(artifacts_root, "delivery.v1", request.request_id, run_id);
    let _ = ocp_evidence::create_run_dir(&run_dir);

    // Step 2: assert request shape.
    if let Some(rejection) = assert_request_shape(&request, profile, &host, env) {
        return finish_rejected(&request, run_id, &run_dir, &host, rejection);
    }

    // Step 3: inline policy engine — allow-real-send / deny-host / deny-missing-secret.
    if let Some(rejection) = evaluate_inline_policy(&request, profile, &host, env) {
        return finish_rejected(&request, run_id, &run_dir, &host, rejection);
    }

    // Step 5: body hash.
    let body = ocp_webhook::canonical_body(&request.payload).unwrap_or_default();
    let payload_sha256 = ocp_webhook::body_sha256(&body);

    // Step 6: idempotency.
    let idempotency_decision = idempotency_store.check(
        request.idempotency_key.as_deref(),
        &payload_sha256,
        env.require_idempotency,
    );
    if !matches!(idempotency_decision, IdempotencyDecision::Proceed) {
        let outcome_code = idempotency_decision
            .outcome_code()
            .unwrap_or(OutcomeCode::PolicyDenied);
        return finish(
            &request,
            run_id,
            &run_dir,
            &host,
            outcome_code,
            false,
            None,
            Vec::new(),
            json!({"idempotency_decision": format!("{idempotency_decision:?}")}),
        );
    }

    // Step 7: rate limiting.
    let rate_limit_key = ocp_ratelimit::derive_key(&request.target_url, Some(DRIVER_KIND));
    if profile.rate_limit.enabled {
        let decision = evaluate_rate_limit(RateLimitCheck {
            now_ms,
            cooldown_ms: profile.rate_limit.cooldown_ms,
            last_sent_ms: rate_limit_store.get_last_sent(&rate_limit_key),
        });
        if !decision.allowed {
            let outcome_code = throttled_outcome(profile.rate_limit.strict);
            return finish(
                &request,
                run_id,
                &run_dir,
                &host,
                outcome_code,
                false,
                None,
                Vec::new(),
                json!({"remaining_ms": decision.remaining_ms}),
            );
        }
    }

    // Step 8: invoke the driver, directly or through the retry engine.
    let driver_name = if env.allow_noop_only { "noop_webhook_v0" } else { DRIVER_KIND };
    let driver = match drivers.get(driver_name) {
        Ok(d) => d,
        Err(e) => {
            return finish(
                &request,
                run_id,
                &run_dir,
                &host,
                OutcomeCode::NetworkError,
                false,
                None,
                Vec::new(),
                json!({"driver_error": e.to_string()}),
            );
        }
    };

    let driver_input = json!({
        "target_url": request.target_url,
        "payload": request.payload,
        "signing_secret": env.signing_secret.clone().unwrap_or_default(),
    });
    let ctx = DriverContext {
        driver_name: driver_name.to_string(),
        allowlist: Some(profile.allowed_targets.clone()),
        limits: ocp_core::ToolLimits {
            timeout_ms: profile.timeout_ms,
            max_data_size: Some(profile.max_payload_bytes),
        },
        binding: ocp_core::ToolBinding {
            driver_kind: driver_name.to_string(),
            destination_allowlist: Some(profile.allowed_targets.clone()),
            limits: ocp_core::ToolLimits {
                timeout_ms: profile.timeout_ms,
                max_data_size: Some(profile.max_payload_bytes),
            },
            schema_refs: None,
        },
    };

    let retry_policy = RetryPolicy {
        retry_enabled: profile.retry_enabled,
        max_attempts: profile.max_attempts,
        retry_on_status: profile.retry_on_status.clone(),
        base_backoff_ms: profile.base_backoff_ms,
        max_backoff_ms: profile.max_backoff_ms,
    };

    let RetryOutcome {
        result,
        attempts,
        outcome_code,
        last_error,
    } = run_with_retry(&retry_policy, |_attempt| {
        let driver = driver.clone();
        let input = driver_input.clone();
        let ctx = ctx.clone();
        async move {
            match driver.execute(input, &ctx).await {
                Ok(output) => {
                    let status = output.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
                    AttemptOutcome::Http { status, response: output }
                }
                Err(e) => AttemptOutcome::Network { error: e.to_string() },
            }
        }
    })
    .await;

    let delivered = matches!(outcome_code, OutcomeCode::Delivered);
    let status_code = result.as_ref().and_then(|r| r.get("status")).and_then(Value::as_u64).map(|s| s as u16);

    if delivered {
        idempotency_store
            .record(
                request.idempotency_key.as_deref().unwrap_or(&payload_sha256),
                payload_sha256.clone(),
                run_dir.join("evidence.json").display().to_string(),
                now_ms,
            )
            .ok();
        rate_limit_store.set_last_sent(&rate_limit_key, now_ms).ok();
    }

    finish(
        &request,
        run_id,
        &run_dir,
        &host,
        outcome_code,
        delivered,
        status_code,
        attempts
            .into_iter()
            .map(|a| serde_json::to_value(a).unwrap_or(Value::Null))
            .collect(),
        json!({"last_error": last_error}),
    )
}

fn assert_request_shape(
    request: &DeliveryRequest,
    profile: &PolicyProfile,
    host: &str,
    env: &DeliveryEnv,
) -> Option<RejectionReason> {
    if request.target_url.trim().is_empty() {
        return Some(RejectionReason::HostNotAllowed);
    }
    if !profile.allowed_targets.iter().any(|allowed| allowed == host) {
        return Some(RejectionReason::HostNotAllowed);
    }
    let body = ocp_webhook::canonical_body(&request.payload).unwrap_or_default();
    if body.len() as u64 > profile.max_payload_bytes {
        return Some(RejectionReason::PayloadTooLarge);
    }
    if profile.require_hmac && env.signing_secret.as_deref().unwrap_or("").is_empty() {
        return Some(RejectionReason::MissingSigningSecret);
    }
    None
}

fn evaluate_inline_policy(
    _request: &DeliveryRequest,
    profile: &PolicyProfile,
    host: &str,
    env: &DeliveryEnv,
) -> Option<RejectionReason> {
    let host_allowed = profile.allowed_targets.iter().any(|allowed| allowed == host);
    if !host_allowed {
        return Some(RejectionReason::PolicyDenied(format!("{host} is not in allowed_targets")));
    }
    if profile.require_hmac && env.signing_secret.is_none() {
        return Some(RejectionReason::PolicyDenied(
            "require_hmac is set but no signing secret is configured".to_string(),
        ));
    }
    let real_send_allowed = env.real_send_armed && profile.allow_real_send && host_allowed;
    if !real_send_allowed && !env.allow_noop_only {
        return Some(RejectionReason::PolicyDenied(
            "real send is not armed for this profile/environment".to_string(),
        ));
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn finish(
    request: &DeliveryRequest,
    run_id: Uuid,
    run_dir: &Path,
    host: &str,
    outcome_code: OutcomeCode,
    delivered: bool,
    status_code: Option<u16>,
    attempts: Vec<Value>,
    extra_evidence: Value,
) -> DeliveryOutcome {
    let result_core = ResultCore {
        request_id: request.request_id,
        run_id,
        driver_kind: DRIVER_KIND.to_string(),
        target_url: request.target_url.clone(),
        delivered,
        status_code,
        dry_run: false,
    };

    let attempts_total = attempts.len();

    let request_path = ocp_evidence::write_artifact(
        run_dir,
        "request.json",
        &json!({"target_url": request.target_url, "payload": request.payload, "idempotency_key": request.idempotency_key}),
    )
    .map(|p| p.display().to_string())
    .unwrap_or_default();
    let result_core_path = ocp_evidence::write_artifact(run_dir, "result_core.json", &result_core)
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let evidence_path = ocp_evidence::write_artifact(
        run_dir,
        "evidence.json",
        &json!({
            "target_host": host,
            "outcome_code": outcome_code,
            "attempts": attempts,
            "attempts_total": attempts_total,
            "extra": extra_evidence,
        }),
    )
    .map(|p| p.display().to_string())
    .unwrap_or_default();

    DeliveryOutcome {
        result: DeliveryResult {
            result_core,
            evidence: DeliveryEvidencePaths {
                request_path,
                result_core_path,
                evidence_path,
            },
        },
        outcome_code,
    }
}

fn finish_rejected(
    request: &DeliveryRequest,
    run_id: Uuid,
    run_dir: &Path,
    host: &str,
    rejection: RejectionReason,
) -> DeliveryOutcome {
    let outcome_code = rejection.outcome_code();
    finish(
        request,
        run_id,
        run_dir,
        host,
        outcome_code,
        false,
        None,
        Vec::new(),
        json!({"rejection": format!("{rejection:?}")}),
    )
}
