use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type shared by every supervisory component. Each `Display` string is
/// meant to be read back to the operator as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyError {
    #[error("Sensor '{condition}' has no reading within its {limit_secs}s staleness limit")]
    SensorStale { condition: String, limit_secs: u64 },

    #[error("Reading for '{condition}' rejected: {details}")]
    InvalidReading { condition: String, details: String },

    #[error("Cannot clear veto '{reason}': holdoff has {remaining_secs}s remaining")]
    HoldoffNotElapsed { reason: String, remaining_secs: u64 },

    #[error("Response step '{step}' failed: {details}")]
    ResponseStepFailed { step: String, details: String },

    #[error("Manual recovery required: {reason}")]
    ManualRecoveryRequired { reason: String },

    #[error("Confirmation for '{tool}' timed out")]
    ConfirmationTimeout { tool: String },

    #[error("Confirmation for '{tool}' cancelled: {reason}")]
    ConfirmationCancelled { tool: String, reason: String },

    #[error("'{tool}' was preempted by emergency {emergency}")]
    PreemptedByEmergency { tool: String, emergency: String },

    #[error("Cannot run '{tool}': emergency response {emergency} owns the effectors")]
    SafetyOverrideActive { tool: String, emergency: String },

    #[error("Cannot run '{tool}'. {reasons}")]
    VetoActive { tool: String, reasons: String },

    #[error("Cannot run '{tool}': {reason}")]
    InterlockBlocked { tool: String, reason: String },

    #[error("Override of '{reason}' rejected: {details}")]
    OverrideRejected { reason: String, details: String },

    #[error("E-STOP is latched; an operator resume is required")]
    EStopLatched,

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("No active veto named '{0}'")]
    UnknownVeto(String),

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("Channel error: {0}")]
    Channel(String),
}
