//! `nightwatch-types` – shared vocabulary of the safety supervisory core.
//!
//! Conditions, thresholds and verdicts; vetoes; emergencies and effector
//! commands; tool descriptions and confirmation tiers; bus events and the
//! [`SafetyError`] type used across the workspace.

pub mod condition;
pub mod confirmation;
pub mod emergency;
mod error;
pub mod event;
pub mod veto;

pub use condition::{
    Comparison, ConditionValue, SafetyCondition, Threshold, Verdict, VerdictTransition, VetoTier,
};
pub use confirmation::{
    ConfirmationOutcome, ConfirmationRequest, ConfirmationTier, ExecutionDecision, OperatorReply,
    ReplyClass, SessionContext, SlewTarget, ToolAction, ToolArgs, ToolClass, ToolSpec,
};
pub use emergency::{
    EffectorCommand, Emergency, EmergencyKind, EmergencyState, ResponseEvent, ResponseLogRecord,
    ResponseStep,
};
pub use error::SafetyError;
pub use event::{AlertLevel, AuditCategory, Event, PlantState, SafetyEvent, SafetyStatus};
pub use veto::{ClearedBy, Veto, VetoStatus};
