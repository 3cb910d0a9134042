//! Unified error taxonomy for the plan interpreter runtime.
//!
//! Every error raised anywhere in the workspace — from plan validation
//! through policy denial to delivery failure — carries a stable
//! [`ErrorCode`] (which also determines a default [`SecurityEventCategory`]
//! and [`Severity`]), a human-readable message, an optional cause, and
//! arbitrary structured context. Use the builder returned by
//! [`MovaError::new`] to construct errors fluently.
//!
//! [`OutcomeCode`] is a separate, smaller vocabulary: the terminal state of
//! one delivery attempt, not a process error.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// SecurityEventCategory / Severity
// ---------------------------------------------------------------------------

/// Category bucket a security event is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventCategory {
    /// Authentication failures.
    Auth,
    /// Authorization / allowlist denials.
    Authorization,
    /// A policy rule was violated.
    PolicyViolation,
    /// An instruction profile cap was exceeded or misused.
    InstructionMisuse,
    /// Unauthorized or out-of-policy data access.
    DataAccess,
    /// Rate limiting or deadline-related events.
    RateLimit,
    /// Configuration problems (missing limits, bad profile).
    Config,
    /// Infrastructure / execution failures.
    Infrastructure,
    /// Anything that doesn't fit the above.
    Other,
}

impl fmt::Display for SecurityEventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::Authorization => "authorization",
            Self::PolicyViolation => "policy_violation",
            Self::InstructionMisuse => "instruction_misuse",
            Self::DataAccess => "data_access",
            Self::RateLimit => "rate_limit",
            Self::Config => "config",
            Self::Infrastructure => "infrastructure",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Severity of a security event. Severity `>= High` forces a run's final
/// status to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational only.
    Info,
    /// Low severity.
    Low,
    /// Medium severity.
    Medium,
    /// High severity — forces run status `failed`.
    High,
    /// Critical severity.
    Critical,
}

impl Severity {
    /// Returns `true` if this severity is high enough to force the run's
    /// final status to `failed`.
    #[must_use]
    pub fn forces_run_failure(&self) -> bool {
        *self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serializes to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Plan, tool pool, or instruction profile failed schema validation.
    ValidationFailed,
    /// A step's connector is not present in the active tool pool.
    ToolNotAllowlisted,
    /// A step's destination host/protocol/port is not in the allowlist.
    DestinationNotAllowlisted,
    /// A tool binding is missing required limits (e.g. `timeout_ms`).
    LimitsNotSpecified,
    /// A step's resolved input failed schema validation.
    InputValidationFailed,
    /// A step's output failed schema validation.
    OutputValidationFailed,
    /// No driver is registered for the requested driver kind.
    HandlerNotFound,
    /// The driver raised an unexpected error while executing.
    ExecutionError,
    /// An outbound call exceeded its deadline.
    Timeout,
    /// An instruction-profile or token-budget cap was exceeded.
    ResourceBudgetExceeded,
}

impl ErrorCode {
    /// Returns the default [`SecurityEventCategory`] this code files under.
    #[must_use]
    pub fn category(&self) -> SecurityEventCategory {
        match self {
            Self::ValidationFailed => SecurityEventCategory::PolicyViolation,
            Self::ToolNotAllowlisted | Self::DestinationNotAllowlisted => {
                SecurityEventCategory::Authorization
            }
            Self::LimitsNotSpecified => SecurityEventCategory::Config,
            Self::InputValidationFailed | Self::OutputValidationFailed => {
                SecurityEventCategory::PolicyViolation
            }
            Self::HandlerNotFound => SecurityEventCategory::Config,
            Self::ExecutionError => SecurityEventCategory::Infrastructure,
            Self::Timeout => SecurityEventCategory::RateLimit,
            Self::ResourceBudgetExceeded => SecurityEventCategory::PolicyViolation,
        }
    }

    /// Returns the default [`Severity`] this code is reported at.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::ValidationFailed
            | Self::ToolNotAllowlisted
            | Self::DestinationNotAllowlisted
            | Self::HandlerNotFound
            | Self::ExecutionError
            | Self::Timeout
            | Self::ResourceBudgetExceeded => Severity::High,
            Self::LimitsNotSpecified => Severity::Medium,
            Self::InputValidationFailed | Self::OutputValidationFailed => Severity::Medium,
        }
    }

    /// Stable `&'static str` representation (e.g. `"VALIDATION_FAILED"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::ToolNotAllowlisted => "TOOL_NOT_ALLOWLISTED",
            Self::DestinationNotAllowlisted => "DESTINATION_NOT_ALLOWLISTED",
            Self::LimitsNotSpecified => "LIMITS_NOT_SPECIFIED",
            Self::InputValidationFailed => "INPUT_VALIDATION_FAILED",
            Self::OutputValidationFailed => "OUTPUT_VALIDATION_FAILED",
            Self::HandlerNotFound => "HANDLER_NOT_FOUND",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ResourceBudgetExceeded => "RESOURCE_BUDGET_EXCEEDED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OutcomeCode
// ---------------------------------------------------------------------------

/// Terminal outcome of one delivery attempt. Distinct from [`ErrorCode`]:
/// an outcome is not necessarily an error (`Delivered` is a success), and
/// outcomes are recorded in evidence, not raised as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeCode {
    /// Delivered with a 2xx response.
    Delivered,
    /// Suppressed because of a matching idempotency key + payload hash.
    SuppressedDuplicate,
    /// Same idempotency key, different payload hash.
    IdempotencyConflict,
    /// Idempotency required but no key was supplied.
    MissingIdempotencyKey,
    /// Within cooldown, non-strict: request recorded, not sent.
    Throttled,
    /// Within cooldown, strict: request rejected.
    ThrottledStrict,
    /// Retries exhausted without a 2xx response.
    RetryExhausted,
    /// A non-retryable HTTP status was returned.
    NonRetryableHttpStatus,
    /// A transport-level (non-HTTP) failure occurred.
    NetworkError,
    /// The policy engine denied the request before any send was attempted.
    PolicyDenied,
    /// The request itself was malformed.
    BadRequest,
    /// The request lacked required authorization (e.g. signing secret).
    Unauthorized,
}

impl OutcomeCode {
    /// `true` if this outcome represents a successful delivery.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Delivered | Self::SuppressedDuplicate)
    }
}

impl fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).unwrap_or_default();
        f.write_str(json.trim_matches('"'))
    }
}

// ---------------------------------------------------------------------------
// MovaError
// ---------------------------------------------------------------------------

/// Unified runtime error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
/// Secrets must never be placed in `message` or `context` — presence and
/// length only.
///
/// # Examples
///
/// ```
/// use ocp_error::{MovaError, ErrorCode};
///
/// let err = MovaError::new(ErrorCode::Timeout, "outbound call exceeded deadline")
///     .with_context("timeout_ms", 5_000);
/// assert_eq!(err.code, ErrorCode::Timeout);
/// ```
pub struct MovaError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl MovaError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialization
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> SecurityEventCategory {
        self.code.category()
    }

    /// Shorthand for `self.code.severity()`.
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }
}

impl fmt::Debug for MovaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("MovaError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for MovaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for MovaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serializable snapshot of a [`MovaError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MovaErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&MovaError> for MovaErrorDto {
    fn from(err: &MovaError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}
