//! Monthly quota policy and the guard that applies it.
//!
//! The guard is a pure function of (usage, policy). Only the top
//! threshold is enforced by the dispatcher; the lower two are advisory
//! and are surfaced as [`Decision::AllowWithWarning`] for callers to act
//! on (log, prompt, abort a batch).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ledger::UsageMonth;
use crate::{HeimdallError, Result};

/// Request-count thresholds for one calendar month.
///
/// There are no built-in defaults: every deployment supplies its own
/// numbers. A typical plan with ~3000 calls/month might use
/// `warn = 2000`, `hard = 2500`, `block = 3000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    warn_threshold: u64,
    hard_threshold: u64,
    block_threshold: u64,
}

impl QuotaPolicy {
    /// Validate and build a policy. Requires `warn <= hard <= block` and
    /// a non-zero block threshold.
    pub fn new(warn_threshold: u64, hard_threshold: u64, block_threshold: u64) -> Result<Self> {
        if block_threshold == 0 {
            return Err(HeimdallError::Configuration(
                "block_threshold must be greater than zero".to_string(),
            ));
        }
        if warn_threshold > hard_threshold || hard_threshold > block_threshold {
            return Err(HeimdallError::Configuration(format!(
                "quota thresholds must satisfy warn <= hard <= block \
                 (got warn={warn_threshold}, hard={hard_threshold}, block={block_threshold})"
            )));
        }
        Ok(Self {
            warn_threshold,
            hard_threshold,
            block_threshold,
        })
    }

    pub fn warn_threshold(&self) -> u64 {
        self.warn_threshold
    }

    pub fn hard_threshold(&self) -> u64 {
        self.hard_threshold
    }

    pub fn block_threshold(&self) -> u64 {
        self.block_threshold
    }
}

/// Outcome of a quota evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Below the warning threshold.
    Allow,
    /// At or above the warning threshold. When `requires_confirmation` is
    /// set, usage has reached the hard threshold and callers should get
    /// explicit confirmation before continuing; the dispatcher itself does
    /// not enforce this.
    AllowWithWarning {
        usage: u64,
        threshold: u64,
        requires_confirmation: bool,
    },
    /// At or above the block threshold; no network call may be made.
    Block { usage: u64, threshold: u64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Block { .. })
    }

    pub fn requires_confirmation(&self) -> bool {
        matches!(
            self,
            Decision::AllowWithWarning {
                requires_confirmation: true,
                ..
            }
        )
    }

    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::AllowWithWarning {
                requires_confirmation: false,
                ..
            } => "warn",
            Decision::AllowWithWarning { .. } => "confirm",
            Decision::Block { .. } => "block",
        }
    }
}

/// Evaluate `usage` against `policy`.
pub fn evaluate(usage: u64, policy: &QuotaPolicy) -> Decision {
    if usage >= policy.block_threshold {
        Decision::Block {
            usage,
            threshold: policy.block_threshold,
        }
    } else if usage >= policy.hard_threshold {
        Decision::AllowWithWarning {
            usage,
            threshold: policy.hard_threshold,
            requires_confirmation: true,
        }
    } else if usage >= policy.warn_threshold {
        Decision::AllowWithWarning {
            usage,
            threshold: policy.warn_threshold,
            requires_confirmation: false,
        }
    } else {
        Decision::Allow
    }
}

/// Applies a fixed [`QuotaPolicy`].
#[derive(Debug, Clone)]
pub struct QuotaGuard {
    policy: QuotaPolicy,
}

impl QuotaGuard {
    pub fn new(policy: QuotaPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Decision for the next call given current monthly usage.
    pub fn evaluate(&self, usage: u64) -> Decision {
        evaluate(usage, &self.policy)
    }

    /// Decision for the last of `planned` further calls, i.e. whether a
    /// batch of that size would cross a threshold before finishing.
    pub fn evaluate_projected(&self, usage: u64, planned: u64) -> Decision {
        if planned == 0 {
            return self.evaluate(usage);
        }
        evaluate(usage.saturating_add(planned - 1), &self.policy)
    }

    /// Calls that can still be made this month before blocking.
    pub fn remaining(&self, usage: u64) -> u64 {
        self.policy.block_threshold.saturating_sub(usage)
    }

    pub fn status(&self, usage: u64) -> QuotaStatus {
        QuotaStatus::classify(usage, &self.policy)
    }

    /// Everything known about `month` given its recorded usage.
    pub fn snapshot(&self, month: UsageMonth, usage: u64) -> QuotaSnapshot {
        QuotaSnapshot {
            month,
            usage,
            policy: self.policy,
            decision: self.evaluate(usage),
            status: self.status(usage),
            remaining: self.remaining(usage),
        }
    }
}

/// Coarse health label for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    /// Below 80% of the warning threshold.
    Good,
    /// Approaching the warning threshold.
    Caution,
    /// Past the warning threshold.
    Warning,
    /// Past the hard threshold.
    Critical,
    /// Past the block threshold.
    Blocked,
}

impl QuotaStatus {
    pub fn classify(usage: u64, policy: &QuotaPolicy) -> Self {
        if usage >= policy.block_threshold {
            Self::Blocked
        } else if usage >= policy.hard_threshold {
            Self::Critical
        } else if usage >= policy.warn_threshold {
            Self::Warning
        } else if usage.saturating_mul(5) >= policy.warn_threshold.saturating_mul(4) {
            Self::Caution
        } else {
            Self::Good
        }
    }
}

impl fmt::Display for QuotaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Good => "GOOD - within safe range",
            Self::Caution => "CAUTION - approaching warning threshold",
            Self::Warning => "WARNING - over warning threshold",
            Self::Critical => "CRITICAL - over hard threshold, confirm before fetching",
            Self::Blocked => "BLOCKED - monthly quota exhausted",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of quota consumption for one month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub month: UsageMonth,
    pub usage: u64,
    pub policy: QuotaPolicy,
    pub decision: Decision,
    pub status: QuotaStatus,
    pub remaining: u64,
}
