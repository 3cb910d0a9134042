//! ocp-policy
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Deny-by-default policy engine (component C4). A step is evaluated
//! against a prioritized list of rules: tool-in-pool membership,
//! driver-kind agreement, destination allowlisting, required limits,
//! dangerous-content guards, and instruction-profile caps. Rules are
//! evaluated from highest priority to lowest; the first rule whose
//! predicate matches wins. `log` rules record a side effect and continue.
//! If nothing else matches, the base `default-deny` rule (priority 0,
//! always matching) denies the step — a safety net that should never
//! actually fire, since [`default_rules`] always installs an allow-all
//! rule above it.

use ocp_core::{InstructionCaps, Step, Tool, ToolPool};
use ocp_error::ErrorCode;
use ocp_glob::{IncludeExcludeGlobs, MatchDecision};
use serde_json::Value;

/// What a matched [`PolicyRule`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Permit the step.
    Allow,
    /// Reject the step.
    Deny,
    /// Record a side effect and keep evaluating lower-priority rules.
    Log,
}

/// Context a [`PolicyRule`] predicate evaluates against.
pub struct StepContext<'a> {
    /// The step under evaluation.
    pub step: &'a Step,
    /// The tool the step's `connector_id` resolved to, if any.
    pub tool: Option<&'a Tool>,
    /// The active instruction profile's caps.
    pub caps: &'a InstructionCaps,
}

/// One entry in the prioritized rule list.
pub struct PolicyRule {
    /// Stable identifier, surfaced in [`PolicyDecision::rule_id`].
    pub id: &'static str,
    /// Higher priority rules are evaluated first.
    pub priority: u32,
    /// What happens when the predicate matches.
    pub action: PolicyAction,
    /// Human-readable description, surfaced on denial.
    pub description: &'static str,
    /// The error kind a denial under this rule maps to.
    pub error_code: Option<ErrorCode>,
    predicate: Box<dyn Fn(&StepContext<'_>) -> bool + Send + Sync>,
}

impl PolicyRule {
    fn new(
        id: &'static str,
        priority: u32,
        action: PolicyAction,
        description: &'static str,
        error_code: Option<ErrorCode>,
        predicate: impl Fn(&StepContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            priority,
            action,
            description,
            error_code,
            predicate: Box::new(predicate),
        }
    }
}

/// Outcome of evaluating a step against a [`PolicyEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Id of the rule that decided the outcome.
    pub rule_id: String,
    /// `true` for an allow, `false` for a deny.
    pub allowed: bool,
    /// Human-readable description of why.
    pub reason: String,
    /// Error kind to classify this denial under, when `!allowed`.
    pub error_code: Option<ErrorCode>,
}

impl PolicyDecision {
    fn allow(rule_id: &str, reason: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            allowed: true,
            reason: reason.to_string(),
            error_code: None,
        }
    }

    fn deny(rule_id: &str, reason: String, error_code: ErrorCode) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            allowed: false,
            reason,
            error_code: Some(error_code),
        }
    }
}

/// A prioritized list of rules evaluated against a [`StepContext`].
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
}

impl PolicyEngine {
    /// Build an engine from an explicit rule list, e.g. for tests that
    /// want to exercise the generic priority/log semantics directly.
    #[must_use]
    pub fn new(mut rules: Vec<PolicyRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { rules }
    }

    /// Build the engine the interpreter uses: the six composed checks
    /// from [`default_rules`], plus the base `default-deny` and
    /// `allow-all` rules.
    #[must_use]
    pub fn with_default_rules(pool: &ToolPool, destination_override: Option<&[String]>) -> Self {
        Self::new(default_rules(pool, destination_override))
    }

    /// Evaluate a step's context, returning the decision of the
    /// highest-priority matching rule. `log`-action rules match but do not
    /// terminate evaluation.
    #[must_use]
    pub fn evaluate(&self, ctx: &StepContext<'_>) -> PolicyDecision {
        for rule in &self.rules {
            if (rule.predicate)(ctx) {
                match rule.action {
                    PolicyAction::Allow => return PolicyDecision::allow(rule.id, rule.description),
                    PolicyAction::Deny => {
                        let code = rule.error_code.unwrap_or(ErrorCode::ValidationFailed);
                        return PolicyDecision::deny(rule.id, rule.description.to_string(), code);
                    }
                    PolicyAction::Log => continue,
                }
            }
        }
        PolicyDecision::deny(
            "default-deny",
            "no rule matched; denying by default".to_string(),
            ErrorCode::ValidationFailed,
        )
    }
}

// ---------------------------------------------------------------------------
// Content guards
// ---------------------------------------------------------------------------

/// Path sequences that may never appear anywhere in a step's input.
pub const FORBIDDEN_PATH_SEQUENCES: &[&str] = &["..", "/etc/", "/root/", "/proc/", "/sys/"];

/// Command tokens that may never appear anywhere in a step's input
/// (case-insensitive).
pub const FORBIDDEN_COMMAND_TOKENS: &[&str] = &[
    "rm -rf",
    "rm ",
    "chmod",
    "chown",
    "mv /",
    "cp /etc/",
    "cat /etc/",
    "echo > /etc/",
    "sudo ",
    "su ",
    "eval ",
    "exec(",
    "exec ",
    "shell_exec",
    "system(",
    "passthru",
];

/// `true` if any string leaf of `value` contains a forbidden path
/// sequence or command token.
#[must_use]
pub fn contains_dangerous_content(value: &Value) -> bool {
    match value {
        Value::String(s) => {
            let lower = s.to_ascii_lowercase();
            FORBIDDEN_PATH_SEQUENCES.iter().any(|p| s.contains(p))
                || FORBIDDEN_COMMAND_TOKENS.iter().any(|t| lower.contains(t))
        }
        Value::Array(items) => items.iter().any(contains_dangerous_content),
        Value::Object(map) => map.values().any(contains_dangerous_content),
        _ => false,
    }
}

fn step_input(step: &Step) -> Value {
    step.input.clone().unwrap_or(Value::Null)
}

fn step_destination(step: &Step) -> Option<String> {
    let input = step_input(step);
    input
        .get("url")
        .or_else(|| input.get("endpoint"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Extract the bare host (no scheme, no path, no port) from a URL-shaped
/// string, so allowlist globs like `example.com` or `*.example.com` match
/// the destination regardless of path or query.
/// Pull the bare host (no scheme, no port, no path) out of a destination
/// string such as `https://example.com:8443/hook`.
#[must_use]
pub fn extract_host(dest: &str) -> String {
    let after_scheme = dest.split("://").nth(1).unwrap_or(dest);
    let host_and_port = after_scheme
        .split('/')
        .next()
        .unwrap_or(after_scheme);
    host_and_port.split(':').next().unwrap_or(host_and_port).to_string()
}

/// Plan-level companion to the `instruction-caps` rule: `max_steps` bounds
/// the whole plan, not a single step, so the interpreter checks it once
/// before evaluating any step.
#[must_use]
pub fn exceeds_step_count_cap(caps: &InstructionCaps, step_count: usize) -> bool {
    caps.max_steps
        .is_some_and(|max| step_count > max as usize)
}

/// Build the six composed checks from §4.4, in priority order, plus the
/// `allow-all` and `default-deny` safety-net rules.
#[must_use]
pub fn default_rules(pool: &ToolPool, destination_override: Option<&[String]>) -> Vec<PolicyRule> {
    let pool = pool.clone();
    let override_list: Option<Vec<String>> = destination_override.map(<[String]>::to_vec);

    vec![
        // 1. Tool-in-pool check.
        PolicyRule::new(
            "tool-in-pool",
            60,
            PolicyAction::Deny,
            "step's connector_id is not present in the active tool pool",
            Some(ErrorCode::ToolNotAllowlisted),
            move |ctx| ctx.tool.is_none() && pool.find(&ctx.step.connector_id).is_none(),
        ),
        // 2. Driver-kind agreement.
        PolicyRule::new(
            "driver-kind-agreement",
            50,
            PolicyAction::Deny,
            "step's verb does not match the tool's binding.driver_kind",
            Some(ErrorCode::ValidationFailed),
            |ctx| {
                ctx.tool
                    .is_some_and(|tool| tool.binding.driver_kind != ctx.step.verb)
            },
        ),
        // 3. Destination allowlist.
        PolicyRule::new(
            "destination-allowlist",
            40,
            PolicyAction::Deny,
            "step's destination host is not in the tool's allowlist",
            Some(ErrorCode::DestinationNotAllowlisted),
            move |ctx| {
                let Some(tool) = ctx.tool else { return false };
                let Some(dest) = step_destination(ctx.step) else {
                    return false;
                };
                let host = extract_host(&dest);
                let allowlist = override_list
                    .as_deref()
                    .or(tool.binding.destination_allowlist.as_deref());
                match allowlist {
                    None => tool.binding.driver_kind == "http",
                    Some(list) => {
                        let globs = IncludeExcludeGlobs::new(
                            &list.iter().map(ToString::to_string).collect::<Vec<_>>(),
                            &[],
                        )
                        .unwrap_or_else(|_| {
                            IncludeExcludeGlobs::new(&[], &[]).expect("empty globs compile")
                        });
                        !matches!(globs.decide_str(&host), MatchDecision::Allowed)
                    }
                }
            },
        ),
        // 4. Limits present.
        PolicyRule::new(
            "limits-present",
            30,
            PolicyAction::Deny,
            "tool binding is missing required limits.timeout_ms",
            Some(ErrorCode::LimitsNotSpecified),
            |ctx| ctx.tool.is_some_and(|tool| tool.binding.limits.timeout_ms == 0),
        ),
        // 5. Content guards.
        PolicyRule::new(
            "content-guard",
            20,
            PolicyAction::Deny,
            "step input contains a forbidden path sequence or command token",
            Some(ErrorCode::ValidationFailed),
            |ctx| contains_dangerous_content(&step_input(ctx.step)),
        ),
        // 6. Instruction-profile caps.
        PolicyRule::new(
            "instruction-caps",
            15,
            PolicyAction::Deny,
            "step exceeds an instruction-profile cap",
            Some(ErrorCode::ResourceBudgetExceeded),
            |ctx| {
                let Some(tool) = ctx.tool else { return false };
                if let Some(max_timeout) = ctx.caps.max_timeout_ms
                    && tool.binding.limits.timeout_ms > max_timeout
                {
                    return true;
                }
                if let (Some(max_size), Some(size)) =
                    (ctx.caps.max_data_size, tool.binding.limits.max_data_size)
                    && size > max_size
                {
                    return true;
                }
                false
            },
        ),
        // Allow-all: everything that survived the six checks above.
        PolicyRule::new("allow-all", 1, PolicyAction::Allow, "step passed all policy checks", None, |_ctx| true),
        // Base rule: documented safety net, never reached in practice.
        PolicyRule::new(
            "default-deny",
            0,
            PolicyAction::Deny,
            "no rule matched; denying by default",
            Some(ErrorCode::ValidationFailed),
            |_ctx| true,
        ),
    ]
}
