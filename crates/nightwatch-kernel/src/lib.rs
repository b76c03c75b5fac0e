//! `nightwatch-kernel` – Safety Supervisory Core
//!
//! The decision logic of NIGHTWATCH. Nothing in this crate performs I/O or
//! waits on a clock: every method takes the current time explicitly and
//! returns what the runtime must do next.
//!
//! # Modules
//!
//! - [`condition_evaluator`] – [`ConditionEvaluator`][condition_evaluator::ConditionEvaluator]:
//!   applies a validated [`ThresholdSet`][condition_evaluator::ThresholdSet]
//!   to sensor snapshots and publishes verdict transitions. Stale or missing
//!   data is `Unknown`, never safe.
//! - [`veto_manager`] – [`VetoManager`][veto_manager::VetoManager]:
//!   the set of active vetoes keyed by reason, with idempotent raises,
//!   in-place escalation, operator clears and audited overrides.
//! - [`recovery`] – [`RecoveryManager`][recovery::RecoveryManager]:
//!   holdoff countdowns that decide when a cleared condition may lift its
//!   veto.
//! - [`emergency_controller`] – [`EmergencyController`][emergency_controller::EmergencyController]:
//!   the emergency state machine, priority preemption, response scripts and
//!   the E-STOP latch.
//! - [`tool_registry`] – [`ToolRegistry`][tool_registry::ToolRegistry]:
//!   the closed set of tools the confirmation gate will run.
//! - [`confirmation_policy`] – [`GatePolicy`][confirmation_policy::GatePolicy]:
//!   scores an invocation into a bypass, a rejection or an effective tier.
//! - [`safety_core`] – [`SafetyCore`][safety_core::SafetyCore]:
//!   composes the above behind a single owner.

pub mod condition_evaluator;
pub mod confirmation_policy;
pub mod emergency_controller;
pub mod recovery;
pub mod safety_core;
pub mod tool_registry;
pub mod veto_manager;

pub use condition_evaluator::{
    ConditionEvaluator, DEFAULT_CLOCK_SKEW, ESTOP_VETO, MANUAL_RECOVERY_PREFIX, ThresholdSet,
};
pub use confirmation_policy::{GateDecision, GatePolicy, InterlockLimits};
pub use emergency_controller::{
    ControllerAction, EmergencyController, ResponsePlan, ResponseTiming, manual_recovery_reason,
};
pub use recovery::{RecoveryManager, RecoveryOutcome};
pub use safety_core::{DEFAULT_BATTERY_CONDITION, Effect, SafetyCore};
pub use tool_registry::{ToolRegistry, standard_tools};
pub use veto_manager::{VetoChange, VetoManager};
