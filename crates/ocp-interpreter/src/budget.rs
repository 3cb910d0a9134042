// SPDX-License-Identifier: MIT OR Apache-2.0
//! Token-budget enforcement for one `run_plan` call (spec §4.5 step d).
//!
//! A run may carry an optional [`TokenBudgetContract`], loaded from the
//! `token_budget_path` argument. Before each step's driver is invoked, the
//! [`BudgetEnforcer`] is asked whether one more model-call allowance is
//! available; on exhaustion it reports the contract's configured
//! [`BudgetAction`] rather than deciding unilaterally what the run should do
//! next — that decision belongs to the interpreter's step loop.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::Relaxed};

/// What the interpreter does when a step would exceed the token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAction {
    /// Run the step anyway; nothing is recorded.
    Continue,
    /// Run the step, but the caller should record a warning-severity event.
    Warn,
    /// Treat the step as a fatal policy denial; do not execute it.
    #[default]
    Fail,
}

/// Resolved token-budget document, optionally read from `token_budget_path`
/// and persisted verbatim as `token_budget.resolved.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudgetContract {
    /// Maximum tokens any single step's model call may consume. `None`
    /// means no per-call cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_per_call: Option<u64>,
    /// Maximum tokens the whole run may consume across all steps. `None`
    /// means no run-wide cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_total: Option<u64>,
    /// Maximum number of model calls the run may make. `None` means
    /// unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_calls: Option<u32>,
    /// What to do when a step would exceed any of the above.
    #[serde(default)]
    pub on_exceeded: BudgetAction,
}

impl Default for TokenBudgetContract {
    fn default() -> Self {
        Self {
            max_tokens_per_call: None,
            max_tokens_total: None,
            max_calls: None,
            on_exceeded: BudgetAction::Continue,
        }
    }
}

/// Outcome of one [`BudgetEnforcer::check_allowance`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetCheck {
    /// Within every configured dimension.
    Allow,
    /// Over a dimension, but the contract's action is `warn`: the step
    /// still executes, with the violation attached for a warning episode.
    Warn(BudgetViolation),
    /// Over a dimension and the contract's action is `fail`; the step must
    /// not execute.
    Deny(BudgetViolation),
}

/// Which dimension was exceeded and by how much.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetViolation {
    /// A single call's estimated cost alone exceeds `max_tokens_per_call`.
    PerCallExceeded {
        /// The call's estimated token cost.
        estimated: u64,
        /// Configured per-call cap.
        limit: u64,
    },
    /// Total tokens used so far, plus this call, would exceed
    /// `max_tokens_total`.
    TotalExceeded {
        /// Tokens used so far plus this call's estimate.
        projected: u64,
        /// Configured run-total cap.
        limit: u64,
    },
    /// One more call would exceed `max_calls`.
    CallCountExceeded {
        /// The call number this would become.
        calls_made: u32,
        /// Configured call-count cap.
        limit: u32,
    },
}

impl std::fmt::Display for BudgetViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PerCallExceeded { estimated, limit } => {
                write!(f, "estimated call cost {estimated} exceeds max_tokens_per_call {limit}")
            }
            Self::TotalExceeded { projected, limit } => {
                write!(f, "projected run total {projected} exceeds max_tokens_total {limit}")
            }
            Self::CallCountExceeded { calls_made, limit } => {
                write!(f, "call {calls_made} would exceed max_calls {limit}")
            }
        }
    }
}

/// Snapshot of cumulative usage, persisted as `token_usage.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsageSnapshot {
    /// Tokens consumed across all recorded calls so far.
    pub tokens_used: u64,
    /// Number of calls recorded so far.
    pub calls_made: u32,
}

/// Thread-safe budget tracker for one run, backed by atomic counters so
/// step execution (even if later made concurrent) never races the count.
pub struct BudgetEnforcer {
    contract: TokenBudgetContract,
    tokens_used: AtomicU64,
    calls_made: AtomicU32,
}

impl BudgetEnforcer {
    /// Build an enforcer from a resolved contract.
    #[must_use]
    pub fn new(contract: TokenBudgetContract) -> Self {
        Self {
            contract,
            tokens_used: AtomicU64::new(0),
            calls_made: AtomicU32::new(0),
        }
    }

    /// Build an enforcer for a run with no token-budget contract: every
    /// call is allowed and nothing is enforced.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(TokenBudgetContract::default())
    }

    /// Build an enforcer from an optional contract, defaulting to
    /// [`Self::unlimited`] when `None` (no `token_budget_path` was given).
    #[must_use]
    pub fn from_optional(contract: Option<TokenBudgetContract>) -> Self {
        contract.map_or_else(Self::unlimited, Self::new)
    }

    /// Check whether one more model call estimated at `estimated_tokens`
    /// may proceed, per §4.5 step (d). The contract's `on_exceeded` action
    /// decides whether an over-budget call is still reported as
    /// [`BudgetCheck::Allow`]/[`BudgetCheck::Warn`] or as
    /// [`BudgetCheck::Deny`] (fatal).
    #[must_use]
    pub fn check_allowance(&self, estimated_tokens: u64) -> BudgetCheck {
        match self.first_violation(estimated_tokens) {
            None => BudgetCheck::Allow,
            Some(v) => match self.contract.on_exceeded {
                BudgetAction::Continue => BudgetCheck::Allow,
                BudgetAction::Warn => BudgetCheck::Warn(v),
                BudgetAction::Fail => BudgetCheck::Deny(v),
            },
        }
    }

    fn first_violation(&self, estimated_tokens: u64) -> Option<BudgetViolation> {
        if let Some(limit) = self.contract.max_tokens_per_call {
            if estimated_tokens > limit {
                return Some(BudgetViolation::PerCallExceeded { estimated: estimated_tokens, limit });
            }
        }
        if let Some(limit) = self.contract.max_tokens_total {
            let projected = self.tokens_used.load(Relaxed) + estimated_tokens;
            if projected > limit {
                return Some(BudgetViolation::TotalExceeded { projected, limit });
            }
        }
        if let Some(limit) = self.contract.max_calls {
            let next_call = self.calls_made.load(Relaxed) + 1;
            if next_call > limit {
                return Some(BudgetViolation::CallCountExceeded { calls_made: next_call, limit });
            }
        }
        None
    }

    /// Record that a call actually consumed `tokens` and counted as one
    /// model call. Called after a step's driver returns successfully.
    pub fn record_call(&self, tokens: u64) {
        self.tokens_used.fetch_add(tokens, Relaxed);
        self.calls_made.fetch_add(1, Relaxed);
    }

    /// Snapshot of cumulative usage for `token_usage.json`.
    #[must_use]
    pub fn usage(&self) -> TokenUsageSnapshot {
        TokenUsageSnapshot {
            tokens_used: self.tokens_used.load(Relaxed),
            calls_made: self.calls_made.load(Relaxed),
        }
    }
}
