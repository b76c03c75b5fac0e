//! [`SafetyCore`] – composes the supervisory components behind one owner.
//!
//! The core wires the evaluator, veto manager, recovery manager and
//! emergency controller together so that every input is handled in one
//! place and in one order:
//!
//! ```text
//! snapshot ─▶ ConditionEvaluator ─▶ VetoManager ─┬─▶ RecoveryManager
//!                                                └─▶ EmergencyController
//! ```
//!
//! All methods are synchronous and take an explicit `now`. They return
//! [`Effect`]s for the runtime to carry out: events to publish, response
//! runs to start or cancel, and effector commands to issue.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nightwatch_types::{
    AlertLevel, ClearedBy, ConditionValue, EffectorCommand, Emergency, EmergencyKind, PlantState,
    ResponseEvent, SafetyCondition, SafetyError, SafetyEvent, SafetyStatus, SessionContext,
    Verdict, VerdictTransition, Veto, VetoStatus, VetoTier,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::condition_evaluator::{
    ConditionEvaluator, ESTOP_VETO, MANUAL_RECOVERY_PREFIX, ThresholdSet,
};
use crate::emergency_controller::{
    ControllerAction, EmergencyController, ResponsePlan, ResponseTiming,
};
use crate::recovery::{RecoveryManager, RecoveryOutcome};
use crate::veto_manager::{VetoChange, VetoManager};

/// Work the runtime must carry out after a core call.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Emit(SafetyEvent),
    /// Spawn a response run.
    Start(ResponsePlan),
    /// Abort the response run with this id.
    Cancel(Uuid),
    /// E-STOP: disable motors within the E-STOP bound and report back via
    /// [`SafetyCore::estop_outcome`].
    DisableMotors { emergency_id: Uuid },
    /// Operator abort command, issued directly.
    Issue(EffectorCommand),
}

/// Single-writer owner of all supervisory state.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use chrono::Utc;
/// use nightwatch_kernel::condition_evaluator::ThresholdSet;
/// use nightwatch_kernel::emergency_controller::ResponseTiming;
/// use nightwatch_kernel::safety_core::{Effect, SafetyCore};
/// use nightwatch_types::{
///     Comparison, ConditionValue, EmergencyKind, SafetyCondition, Threshold, VetoTier,
/// };
///
/// let wind = Threshold {
///     reason: "wind".into(),
///     condition: "wind_speed".into(),
///     comparison: Comparison::Max,
///     limit: 25.0,
///     tier: VetoTier::Critical,
///     hysteresis: 0.0,
///     holdoff: Duration::from_secs(600),
///     auto_clearable: true,
///     emergency: Some(EmergencyKind::HighWind),
/// };
/// let thresholds = ThresholdSet::new(vec![wind]).unwrap();
/// let mut core = SafetyCore::new(thresholds, ResponseTiming::default());
///
/// let now = Utc::now();
/// let reading = SafetyCondition::new(
///     "wind_speed",
///     ConditionValue::Numeric(32.0),
///     "anemometer",
///     Duration::from_secs(120),
/// )
/// .observed_at(now);
/// let effects = core.ingest(reading, now);
///
/// assert_eq!(core.active_tier(), Some(VetoTier::Critical));
/// assert!(effects.iter().any(|e| matches!(e, Effect::Start(_))));
/// ```
pub struct SafetyCore {
    evaluator: ConditionEvaluator,
    vetoes: VetoManager,
    recovery: RecoveryManager,
    emergencies: EmergencyController,
    session: SessionContext,
    /// Condition reporting UPS charge, surfaced in [`PlantState`].
    battery_condition: String,
}

/// Condition name the UPS adapter reports under.
pub const DEFAULT_BATTERY_CONDITION: &str = "ups_battery";

impl SafetyCore {
    pub fn new(thresholds: ThresholdSet, timing: ResponseTiming) -> Self {
        Self {
            evaluator: ConditionEvaluator::new(thresholds),
            vetoes: VetoManager::new(),
            recovery: RecoveryManager::new(),
            emergencies: EmergencyController::new(timing),
            session: SessionContext::default(),
            battery_condition: DEFAULT_BATTERY_CONDITION.to_string(),
        }
    }

    /// Readings stamped further ahead than `skew` are refused.
    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.evaluator = self.evaluator.with_max_clock_skew(skew);
        self
    }

    pub fn with_battery_condition(mut self, condition: impl Into<String>) -> Self {
        self.battery_condition = condition.into();
        self
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    /// Feed one sensor snapshot. A future-stamped reading is refused with a
    /// warning alert and changes nothing else.
    pub fn ingest(&mut self, reading: SafetyCondition, now: DateTime<Utc>) -> Vec<Effect> {
        let mut out = Vec::new();
        if let Err(err) = self.evaluator.check_timestamp(&reading, now) {
            warn!(condition = %reading.name, source = %reading.source, %err, "reading refused");
            out.push(Effect::Emit(SafetyEvent::Alert {
                level: AlertLevel::Warning,
                message: format!("{err} (from {})", reading.source),
            }));
            return out;
        }
        let transitions = self.evaluator.ingest(reading, now);
        self.on_transitions(transitions, now, &mut out);
        self.tick_recovery(now, &mut out);
        out
    }

    /// Periodic re-evaluation and holdoff tick.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        let mut out = Vec::new();
        let transitions = self.evaluator.sweep(now);
        self.on_transitions(transitions, now, &mut out);
        self.tick_recovery(now, &mut out);
        out
    }

    /// Operator E-STOP. Idempotent while latched.
    pub fn estop(&mut self, source: &str, now: DateTime<Utc>) -> Vec<Effect> {
        let mut out = Vec::new();
        let actions = self.emergencies.estop(source, now);
        if actions.is_empty() {
            return out;
        }
        self.run(actions, now, &mut out);
        for change in self.vetoes.raise_latch(&format!("E-STOP by {source}"), now) {
            if let VetoChange::Raised(veto) = change {
                out.push(Effect::Emit(raised_event(&veto)));
            }
        }
        out
    }

    /// Record how the E-STOP motor disable went.
    pub fn estop_outcome(
        &mut self,
        result: Result<std::time::Duration, SafetyError>,
        now: DateTime<Utc>,
    ) -> Vec<Effect> {
        let mut out = Vec::new();
        let actions = self.emergencies.record_estop_result(result, now);
        self.run(actions, now, &mut out);
        out
    }

    /// Release the E-STOP latch. The next queued emergency, if any, starts.
    ///
    /// # Errors
    ///
    /// [`SafetyError::UnknownVeto`] when no E-STOP is latched.
    pub fn resume(
        &mut self,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, SafetyError> {
        let actions = self.emergencies.resume(now)?;
        self.vetoes.remove_latch();
        info!(operator, "E-STOP released");
        let mut out = vec![Effect::Emit(SafetyEvent::VetoCleared {
            reason: ESTOP_VETO.to_string(),
            by: ClearedBy::Resume {
                operator: operator.to_string(),
            },
        })];
        self.run(actions, now, &mut out);
        Ok(out)
    }

    /// Operator clear of a veto whose holdoff has elapsed.
    ///
    /// # Errors
    ///
    /// See [`VetoManager::clear`].
    pub fn clear_veto(
        &mut self,
        reason: &str,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, SafetyError> {
        self.vetoes.clear(reason, now)?;
        self.recovery.cancel(reason);
        let mut out = vec![Effect::Emit(SafetyEvent::VetoCleared {
            reason: reason.to_string(),
            by: ClearedBy::Operator {
                operator: operator.to_string(),
            },
        })];
        let actions = self.emergencies.on_veto_cleared(reason, now);
        self.run(actions, now, &mut out);
        Ok(out)
    }

    /// Administrative override that removes a veto regardless of holdoff.
    ///
    /// If the condition is still violated the veto is not re-raised until
    /// its verdict next changes.
    ///
    /// # Errors
    ///
    /// See [`VetoManager::override_clear`].
    pub fn override_veto(
        &mut self,
        reason: &str,
        operator: &str,
        justification: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, SafetyError> {
        self.vetoes.override_clear(reason, operator, justification)?;
        self.recovery.cancel(reason);
        let mut out = vec![Effect::Emit(SafetyEvent::VetoCleared {
            reason: reason.to_string(),
            by: ClearedBy::Override {
                operator: operator.to_string(),
                justification: justification.to_string(),
            },
        })];
        let actions = self.emergencies.on_veto_cleared(reason, now);
        self.run(actions, now, &mut out);
        Ok(out)
    }

    /// Administrative threshold replacement. Rules are re-evaluated at once.
    pub fn update_thresholds(
        &mut self,
        thresholds: ThresholdSet,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Vec<Effect> {
        let count = thresholds.len();
        warn!(operator, count, "thresholds replaced");
        self.evaluator.replace_thresholds(thresholds);
        let mut out = vec![Effect::Emit(SafetyEvent::ThresholdsUpdated {
            count,
            operator: operator.to_string(),
        })];
        out.extend(self.sweep(now));
        out
    }

    /// Orchestration-owned session flags. `emergency_active` is derived and
    /// ignored here.
    pub fn set_session(&mut self, session: SessionContext) {
        self.session = SessionContext {
            emergency_active: false,
            ..session
        };
    }

    /// Track mount state after a command completed outside a response run.
    pub fn record_command(&mut self, command: EffectorCommand) {
        match command {
            EffectorCommand::Park => self.session.mount_parked = true,
            EffectorCommand::Unpark => self.session.mount_parked = false,
            _ => {}
        }
    }

    /// Abort-class operator tool.
    pub fn operator_abort(&mut self, command: EffectorCommand, now: DateTime<Utc>) -> Vec<Effect> {
        let mut out = Vec::new();
        let actions = self.emergencies.operator_abort(command, now);
        self.run(actions, now, &mut out);
        out
    }

    /// Progress report from a response run.
    pub fn response_progress(&mut self, run_id: Uuid, event: ResponseEvent, now: DateTime<Utc>) {
        let parked = matches!(
            event,
            ResponseEvent::StepSucceeded {
                command: EffectorCommand::Park,
                ..
            }
        );
        if self.emergencies.record_progress(run_id, event, now) && parked {
            self.session.mount_parked = true;
        }
    }

    /// A response run ended.
    pub fn response_finished(
        &mut self,
        run_id: Uuid,
        result: Result<(), SafetyError>,
        now: DateTime<Utc>,
    ) -> Vec<Effect> {
        let mut out = Vec::new();
        let actions = self.emergencies.finish(run_id, result, now);
        self.run(actions, now, &mut out);
        out
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn active_tier(&self) -> Option<VetoTier> {
        self.vetoes.active_tier()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.vetoes.reasons().into_iter().collect()
    }

    pub fn current_emergency(&self) -> Option<&Emergency> {
        self.emergencies.current()
    }

    pub fn veto(&self, reason: &str) -> Option<&Veto> {
        self.vetoes.get(reason)
    }

    pub fn evaluator(&self) -> &ConditionEvaluator {
        &self.evaluator
    }

    pub fn emergencies(&self) -> &EmergencyController {
        &self.emergencies
    }

    pub fn session(&self) -> SessionContext {
        SessionContext {
            emergency_active: self.emergencies.current().is_some(),
            ..self.session
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> SafetyStatus {
        SafetyStatus {
            active_tier: self.vetoes.active_tier(),
            vetoes: self.vetoes.vetoes().cloned().collect(),
            current_emergency: self.emergencies.current().cloned(),
            responding: self.emergencies.responding().is_some(),
            estop_latched: self.emergencies.is_halted(),
            manual_recovery: self
                .vetoes
                .reasons()
                .into_iter()
                .filter(|r| r.starts_with(MANUAL_RECOVERY_PREFIX))
                .collect(),
            emergency_epoch: self.emergencies.epoch(),
            session: self.session(),
            plant: PlantState {
                enclosure_open: None,
                battery_percent: self
                    .evaluator
                    .reading(&self.battery_condition, now)
                    .ok()
                    .and_then(|r| match r.value {
                        ConditionValue::Numeric(v) if v.is_finite() => Some(v),
                        _ => None,
                    }),
            },
            updated_at: Some(now),
        }
    }

    // -----------------------------------------------------------------------
    // Internal wiring
    // -----------------------------------------------------------------------

    fn on_transitions(
        &mut self,
        transitions: Vec<VerdictTransition>,
        now: DateTime<Utc>,
        out: &mut Vec<Effect>,
    ) {
        for transition in transitions {
            let changes = self.vetoes.apply(&transition);
            let emergency = match transition.to {
                Verdict::Unknown => Some(EmergencyKind::SensorFailure),
                _ => transition.threshold.emergency,
            };
            out.push(Effect::Emit(SafetyEvent::VerdictChanged(transition)));
            self.on_veto_changes(changes, emergency, now, out);
        }
    }

    fn on_veto_changes(
        &mut self,
        changes: Vec<VetoChange>,
        emergency: Option<EmergencyKind>,
        now: DateTime<Utc>,
        out: &mut Vec<Effect>,
    ) {
        for change in changes {
            match change {
                VetoChange::Raised(veto) => {
                    out.push(Effect::Emit(raised_event(&veto)));
                    if veto.tier == VetoTier::Critical
                        && let Some(kind) = emergency
                    {
                        let actions = self.emergencies.detect(kind, &veto.reason, now);
                        self.run(actions, now, out);
                    }
                }
                VetoChange::Escalated { reason, from, to } => {
                    out.push(Effect::Emit(SafetyEvent::VetoEscalated {
                        reason: reason.clone(),
                        from,
                        to,
                    }));
                    if to == VetoTier::Critical
                        && let Some(kind) = emergency
                    {
                        let actions = self.emergencies.detect(kind, &reason, now);
                        self.run(actions, now, out);
                    }
                }
                VetoChange::Retriggered { reason } => {
                    self.recovery.cancel(&reason);
                    out.push(Effect::Emit(SafetyEvent::VetoRetriggered {
                        reason: reason.clone(),
                    }));
                    let actions = self.emergencies.on_holdoff_cancelled(&reason, now);
                    self.run(actions, now, out);
                }
                VetoChange::HandOff {
                    reason,
                    holdoff,
                    auto_clearable,
                } => {
                    let until = self.recovery.start(&reason, holdoff, auto_clearable, now);
                    self.vetoes.enter_holdoff(&reason, until);
                    out.push(Effect::Emit(SafetyEvent::HoldoffStarted {
                        reason: reason.clone(),
                        until,
                        auto_clearable,
                    }));
                    let actions = self.emergencies.on_holdoff_started(&reason, now);
                    self.run(actions, now, out);
                }
            }
        }
    }

    fn tick_recovery(&mut self, now: DateTime<Utc>, out: &mut Vec<Effect>) {
        for outcome in self.recovery.tick(now) {
            match outcome {
                RecoveryOutcome::AutoClear(reason) => {
                    if self.vetoes.release(&reason).is_some() {
                        out.push(Effect::Emit(SafetyEvent::VetoCleared {
                            reason: reason.clone(),
                            by: ClearedBy::Recovery,
                        }));
                        let actions = self.emergencies.on_veto_cleared(&reason, now);
                        self.run(actions, now, out);
                    }
                }
                RecoveryOutcome::AwaitOperator(reason) => {
                    if self.vetoes.mark_ready(&reason) {
                        out.push(Effect::Emit(SafetyEvent::ReadyToClear { reason }));
                    }
                }
            }
        }
    }

    /// Carry out controller actions. Actions that feed back into the
    /// controller append to the same queue.
    fn run(&mut self, actions: Vec<ControllerAction>, now: DateTime<Utc>, out: &mut Vec<Effect>) {
        let mut pending: VecDeque<ControllerAction> = actions.into();
        while let Some(action) = pending.pop_front() {
            match action {
                ControllerAction::Start(plan) => out.push(Effect::Start(plan)),
                ControllerAction::Cancel { run_id } => out.push(Effect::Cancel(run_id)),
                ControllerAction::DisableMotors { emergency_id } => {
                    out.push(Effect::DisableMotors { emergency_id })
                }
                ControllerAction::Issue(command) => out.push(Effect::Issue(command)),
                ControllerAction::Emit(event) => out.push(Effect::Emit(event)),
                ControllerAction::RaiseManualVeto { reason, detail } => {
                    for change in self.vetoes.raise_manual(&reason, &detail, now) {
                        if let VetoChange::Raised(veto) = change {
                            out.push(Effect::Emit(raised_event(&veto)));
                        }
                    }
                }
                ControllerAction::SafeStateReached { veto_reason } => {
                    match self.vetoes.get(&veto_reason).map(|v| v.status) {
                        None => pending.extend(self.emergencies.on_veto_cleared(&veto_reason, now)),
                        Some(VetoStatus::Holdoff | VetoStatus::AwaitingOperator) => {
                            pending.extend(self.emergencies.on_holdoff_started(&veto_reason, now))
                        }
                        Some(VetoStatus::Triggered) => {}
                    }
                }
            }
        }
    }
}

fn raised_event(veto: &Veto) -> SafetyEvent {
    SafetyEvent::VetoRaised {
        reason: veto.reason.clone(),
        tier: veto.tier,
        detail: veto.detail.clone(),
    }
}
