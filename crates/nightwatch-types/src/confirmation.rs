//! Tool descriptions, confirmation tiers and the decisions the gate returns.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::emergency::EffectorCommand;

/// How much operator involvement a tool invocation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationTier {
    /// Execute immediately.
    None,
    /// Announce, then execute without waiting.
    Announce,
    /// One confirmation round.
    Confirm,
    /// Two rounds; the second needs an operation-specific phrase.
    Double,
}

impl ConfirmationTier {
    /// One tier stricter, saturating at [`ConfirmationTier::Double`].
    pub fn escalate(self) -> Self {
        match self {
            ConfirmationTier::None => ConfirmationTier::Announce,
            ConfirmationTier::Announce => ConfirmationTier::Confirm,
            ConfirmationTier::Confirm | ConfirmationTier::Double => ConfirmationTier::Double,
        }
    }

    /// One tier looser, saturating at [`ConfirmationTier::None`].
    pub fn relax(self) -> Self {
        match self {
            ConfirmationTier::None | ConfirmationTier::Announce => ConfirmationTier::None,
            ConfirmationTier::Confirm => ConfirmationTier::Announce,
            ConfirmationTier::Double => ConfirmationTier::Confirm,
        }
    }
}

impl fmt::Display for ConfirmationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConfirmationTier::None => "NONE",
            ConfirmationTier::Announce => "ANNOUNCE",
            ConfirmationTier::Confirm => "CONFIRM",
            ConfirmationTier::Double => "DOUBLE",
        };
        f.write_str(label)
    }
}

/// Closed set of tool categories the gate distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClass {
    /// Abort / stop / emergency actions. Never gated.
    Abort,
    /// Moves the mount or the enclosure.
    Hardware,
    /// Changes session state (imaging, guiding) without moving hardware.
    Session,
    /// Read-only queries.
    Query,
}

/// What an approved tool does. The executor dispatches on this, never on the
/// tool's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAction {
    /// Drive one effector command and wait for it to take effect.
    Effector(EffectorCommand),
    /// Slew the mount to the [`SlewTarget`] passed with the invocation.
    SlewTo,
    StartImaging,
    StopImaging,
    ReportStatus,
    ReportWeather,
}

impl ToolAction {
    pub fn effector_command(&self) -> Option<EffectorCommand> {
        match self {
            ToolAction::Effector(command) => Some(*command),
            _ => None,
        }
    }

    /// Whether a tool of `class` may carry this action.
    pub fn fits(&self, class: ToolClass) -> bool {
        match (class, self) {
            (ToolClass::Abort, ToolAction::Effector(command)) => {
                matches!(command, EffectorCommand::AbortSlew | EffectorCommand::DisableMotors)
            }
            (ToolClass::Hardware, ToolAction::Effector(_) | ToolAction::SlewTo) => true,
            (ToolClass::Session, ToolAction::StartImaging | ToolAction::StopImaging) => true,
            (ToolClass::Query, ToolAction::ReportStatus | ToolAction::ReportWeather) => true,
            _ => false,
        }
    }
}

/// Registry entry for one invocable tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub class: ToolClass,
    pub action: ToolAction,
    pub base_tier: ConfirmationTier,
    /// Escalated one tier while imaging is active.
    pub disruptive: bool,
    /// Moves the observatory toward its safe state (park, close). Stays
    /// available at CONFIRM under critical vetoes and manual recovery.
    #[serde(default)]
    pub safe_ward: bool,
    pub announcement: Option<String>,
    /// Phrase required in the second round of a double confirmation.
    pub confirm_phrase: Option<String>,
}

impl ToolSpec {
    pub fn is_abort(&self) -> bool {
        self.class == ToolClass::Abort
    }

    pub fn targets_effector(&self) -> bool {
        self.class == ToolClass::Hardware
    }

    pub fn effector(&self) -> Option<EffectorCommand> {
        self.action.effector_command()
    }

    pub fn is_unpark(&self) -> bool {
        self.effector() == Some(EffectorCommand::Unpark)
    }

    pub fn is_estop(&self) -> bool {
        self.is_abort() && self.effector() == Some(EffectorCommand::DisableMotors)
    }

    /// The phrase round two must match, e.g. `"confirm park telescope"`.
    pub fn phrase(&self) -> String {
        self.confirm_phrase
            .clone()
            .unwrap_or_else(|| format!("confirm {}", self.name.replace('_', " ")))
    }

    pub fn announcement_text(&self) -> String {
        self.announcement
            .clone()
            .unwrap_or_else(|| format!("Executing {}.", self.name.replace('_', " ")))
    }
}

/// Horizontal coordinates of a slew target, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlewTarget {
    pub altitude_deg: f64,
    pub azimuth_deg: f64,
}

impl fmt::Display for SlewTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alt {:.1}° az {:.1}°", self.altitude_deg, self.azimuth_deg)
    }
}

/// Per-invocation arguments. Most tools take none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolArgs {
    pub target: Option<SlewTarget>,
}

impl ToolArgs {
    pub fn slew(altitude_deg: f64, azimuth_deg: f64) -> Self {
        Self {
            target: Some(SlewTarget {
                altitude_deg,
                azimuth_deg,
            }),
        }
    }
}

/// Operational state the gate consults when scoring an invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub imaging_active: bool,
    pub mount_parked: bool,
    pub emergency_active: bool,
}

/// A question put to the operator. Lives only for the duration of one
/// invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRequest {
    pub tool_name: String,
    pub base_tier: ConfirmationTier,
    pub effective_tier: ConfirmationTier,
    pub prompt: String,
    pub valid_responses: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub timeout: Duration,
}

/// How an invocation was resolved. Every outcome is audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    /// No confirmation needed.
    Executed,
    Announced,
    Confirmed,
    Cancelled,
    TimedOut,
    Preempted,
    Rejected,
    /// Abort-class tool, gate skipped.
    Bypassed,
}

impl fmt::Display for ConfirmationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConfirmationOutcome::Executed => "executed",
            ConfirmationOutcome::Announced => "announced",
            ConfirmationOutcome::Confirmed => "confirmed",
            ConfirmationOutcome::Cancelled => "cancelled",
            ConfirmationOutcome::TimedOut => "timed out",
            ConfirmationOutcome::Preempted => "preempted",
            ConfirmationOutcome::Rejected => "rejected",
            ConfirmationOutcome::Bypassed => "bypassed",
        };
        f.write_str(label)
    }
}

/// Result of an invocation that was allowed to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionDecision {
    pub tool: String,
    pub base_tier: ConfirmationTier,
    pub effective_tier: ConfirmationTier,
    pub outcome: ConfirmationOutcome,
    /// Executor output.
    pub output: String,
}

/// Coarse classification of a free-text operator reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyClass {
    Confirm,
    Cancel,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorReply {
    pub text: String,
    pub class: ReplyClass,
}

const AFFIRMATIVE: &[&str] = &[
    "yes",
    "y",
    "confirm",
    "confirmed",
    "proceed",
    "affirmative",
    "do it",
];
const NEGATIVE: &[&str] = &["no", "n", "cancel", "stop", "abort", "negative", "never mind"];

impl OperatorReply {
    /// Keyword classification for text consoles. Voice pipelines classify
    /// upstream and build the reply directly.
    pub fn classify(text: &str) -> Self {
        let normalized = normalize(text);
        let class = if AFFIRMATIVE.contains(&normalized.as_str()) {
            ReplyClass::Confirm
        } else if NEGATIVE.contains(&normalized.as_str()) {
            ReplyClass::Cancel
        } else {
            ReplyClass::Unrecognized
        };
        Self {
            text: text.trim().to_string(),
            class,
        }
    }

    /// Whether the reply text equals `phrase`, ignoring case, punctuation
    /// and repeated whitespace.
    pub fn matches_phrase(&self, phrase: &str) -> bool {
        normalize(&self.text) == normalize(phrase)
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
