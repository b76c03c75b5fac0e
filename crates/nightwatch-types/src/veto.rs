//! Veto records and how they were cleared.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::VetoTier;

/// Where a veto sits in its recovery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VetoStatus {
    /// The condition is still violated (or unknown).
    Triggered,
    /// The condition cleared; waiting for `holdoff_until`.
    Holdoff,
    /// Holdoff finished but the veto needs an operator to clear it.
    AwaitingOperator,
}

/// An active prohibition keyed by `reason`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Veto {
    pub reason: String,
    pub tier: VetoTier,
    pub raised_at: DateTime<Utc>,
    /// Configured quiet period once the condition clears.
    pub holdoff: Duration,
    /// Set while a holdoff countdown runs.
    pub holdoff_until: Option<DateTime<Utc>>,
    pub auto_clearable: bool,
    pub status: VetoStatus,
    /// Human-readable cause, e.g. `"wind_speed 32 exceeds limit 25"`.
    pub detail: String,
}

impl Veto {
    /// Whether an operator may clear this veto at `now` without an override.
    pub fn is_ready_to_clear(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            VetoStatus::AwaitingOperator => true,
            VetoStatus::Holdoff => self.holdoff_until.is_some_and(|until| until <= now),
            VetoStatus::Triggered => false,
        }
    }

    /// Time left before an operator clear is allowed.
    pub fn remaining_holdoff(&self, now: DateTime<Utc>) -> Duration {
        match (self.status, self.holdoff_until) {
            (VetoStatus::AwaitingOperator, _) => Duration::ZERO,
            (VetoStatus::Holdoff, Some(until)) => (until - now).to_std().unwrap_or(Duration::ZERO),
            _ => self.holdoff,
        }
    }
}

impl fmt::Display for Veto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.tier, self.reason, self.detail)
    }
}

/// Who or what removed a veto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum ClearedBy {
    /// Holdoff elapsed on an auto-clearable veto.
    Recovery,
    Operator { operator: String },
    /// Administrative clear before holdoff elapsed.
    Override {
        operator: String,
        justification: String,
    },
    /// Operator resume after an E-STOP.
    Resume { operator: String },
}

impl fmt::Display for ClearedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClearedBy::Recovery => f.write_str("holdoff elapsed"),
            ClearedBy::Operator { operator } => write!(f, "operator {operator}"),
            ClearedBy::Override {
                operator,
                justification,
            } => write!(f, "override by {operator}: {justification}"),
            ClearedBy::Resume { operator } => write!(f, "resume by {operator}"),
        }
    }
}
