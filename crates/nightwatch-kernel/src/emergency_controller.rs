//! [`EmergencyController`] – emergency escalation state machine.
//!
//! ```text
//! DETECTED ─▶ RESPONDING ─▶ SAFE_STATE_REACHED ─▶ HOLDOFF ─▶ CLEARED
//!                  │                  ▲              │
//!                  │                  └──────────────┘ (re-violated)
//!                  └─▶ MANUAL_RECOVERY_REQUIRED
//!
//! E-STOP ─▶ HALTED ─▶ (operator resume) ─▶ CLEARED
//! ```
//!
//! The controller is pure bookkeeping: it never awaits hardware. Every call
//! returns [`ControllerAction`]s that the runtime carries out (spawn or
//! cancel a response run, disable motors, raise a manual-recovery veto,
//! publish an event). At most one emergency is RESPONDING at any time; a
//! detection with a strictly lower priority number preempts it, anything
//! else waits in a queue ordered by `(priority, detected_at)`.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nightwatch_types::{
    AlertLevel, EffectorCommand, Emergency, EmergencyKind, EmergencyState, ResponseEvent,
    ResponseStep, SafetyError, SafetyEvent,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::condition_evaluator::{ESTOP_VETO, MANUAL_RECOVERY_PREFIX};
use crate::recovery::deadline;

/// Terminal emergencies kept for inspection.
const HISTORY_LIMIT: usize = 64;

// ────────────────────────────────────────────────────────────────────────────
// Response scripts
// ────────────────────────────────────────────────────────────────────────────

/// Step deadlines, overall deadlines and retry policy for response scripts.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseTiming {
    pub abort_slew: Duration,
    pub park: Duration,
    pub close_enclosure: Duration,
    pub disable_motors: Duration,
    /// Overall bound for weather, power and sensor responses.
    pub weather_overall: Duration,
    /// Overall bound for mount faults.
    pub fault_overall: Duration,
    /// Bound on E-STOP to motors disabled.
    pub estop: Duration,
    /// Retries after the first attempt of each step.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for ResponseTiming {
    fn default() -> Self {
        Self {
            abort_slew: Duration::from_secs(5),
            park: Duration::from_secs(25),
            close_enclosure: Duration::from_secs(25),
            disable_motors: Duration::from_secs(2),
            weather_overall: Duration::from_secs(60),
            fault_overall: Duration::from_secs(10),
            estop: Duration::from_millis(100),
            max_retries: 2,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl ResponseTiming {
    /// Ordered effector steps for `kind`.
    pub fn script(&self, kind: EmergencyKind) -> Vec<ResponseStep> {
        let step = |command, await_confirmation, deadline| ResponseStep {
            command,
            await_confirmation,
            deadline,
        };
        let abort = step(EffectorCommand::AbortSlew, false, self.abort_slew);
        let park = step(EffectorCommand::Park, true, self.park);
        let close = step(EffectorCommand::CloseEnclosure, true, self.close_enclosure);
        match kind {
            EmergencyKind::Rain
            | EmergencyKind::PowerFailure
            | EmergencyKind::SensorFailure
            | EmergencyKind::WeatherUnsafe => vec![abort, park, close],
            EmergencyKind::HighWind => vec![abort, park],
            EmergencyKind::MountFault => vec![
                abort,
                step(EffectorCommand::DisableMotors, false, self.disable_motors),
            ],
            EmergencyKind::EStop => vec![step(EffectorCommand::DisableMotors, false, self.estop)],
        }
    }

    pub fn overall(&self, kind: EmergencyKind) -> Duration {
        match kind {
            EmergencyKind::EStop => self.estop,
            EmergencyKind::MountFault => self.fault_overall,
            _ => self.weather_overall,
        }
    }
}

/// Everything a runner needs to execute one response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsePlan {
    pub emergency_id: Uuid,
    /// Identifies this attempt; results from cancelled runs carry a stale id.
    pub run_id: Uuid,
    pub kind: EmergencyKind,
    pub steps: Vec<ResponseStep>,
    pub overall: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

/// Side effects requested by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerAction {
    Start(ResponsePlan),
    /// Abort the in-flight run.
    Cancel { run_id: Uuid },
    /// E-STOP path: issue `disable_motors` within the E-STOP bound.
    DisableMotors { emergency_id: Uuid },
    /// Operator abort command.
    Issue(EffectorCommand),
    RaiseManualVeto { reason: String, detail: String },
    /// A response finished; sync the emergency with its veto's holdoff.
    SafeStateReached { veto_reason: String },
    Emit(SafetyEvent),
}

/// Veto reason raised when an emergency of `kind` needs manual recovery.
pub fn manual_recovery_reason(kind: EmergencyKind) -> String {
    format!("{MANUAL_RECOVERY_PREFIX}{}", kind.to_string().to_lowercase())
}

// ────────────────────────────────────────────────────────────────────────────
// EmergencyController
// ────────────────────────────────────────────────────────────────────────────

struct Running {
    emergency: Emergency,
    run_id: Uuid,
}

/// Owns every emergency from detection to a terminal state.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use nightwatch_kernel::emergency_controller::{ControllerAction, EmergencyController};
/// use nightwatch_types::{EmergencyKind, EmergencyState};
///
/// let mut controller = EmergencyController::default();
/// let actions = controller.detect(EmergencyKind::Rain, "rain", Utc::now());
///
/// assert!(actions.iter().any(|a| matches!(a, ControllerAction::Start(_))));
/// assert_eq!(controller.responding().unwrap().state, EmergencyState::Responding);
/// ```
#[derive(Default)]
pub struct EmergencyController {
    timing: ResponseTiming,
    responding: Option<Running>,
    halted: Option<Emergency>,
    queue: Vec<Emergency>,
    recovering: Vec<Emergency>,
    history: VecDeque<Emergency>,
    epoch: u64,
}

impl EmergencyController {
    pub fn new(timing: ResponseTiming) -> Self {
        Self {
            timing,
            ..Self::default()
        }
    }

    // -----------------------------------------------------------------------
    // Detection
    // -----------------------------------------------------------------------

    /// Handle a veto that newly reached CRITICAL.
    ///
    /// A second detection for a veto whose emergency is still live is
    /// ignored.
    pub fn detect(
        &mut self,
        kind: EmergencyKind,
        veto_reason: &str,
        now: DateTime<Utc>,
    ) -> Vec<ControllerAction> {
        let mut actions = Vec::new();
        if self.is_live(veto_reason) {
            debug!(%kind, veto_reason, "emergency already live for veto");
            return actions;
        }

        let mut emergency = Emergency::new(kind, veto_reason, now);
        warn!(%kind, veto_reason, priority = kind.priority(), "emergency detected");
        actions.push(ControllerAction::Emit(SafetyEvent::EmergencyTransition {
            id: emergency.id,
            kind,
            from: None,
            to: EmergencyState::Detected,
        }));

        if self.halted.is_some() {
            emergency.log(
                now,
                ResponseEvent::Deferred {
                    behind: EmergencyKind::EStop,
                },
            );
            self.queue.push(emergency);
            return actions;
        }

        match self.responding.take() {
            None => self.start(emergency, now, &mut actions),
            Some(running) if kind.preempts(running.emergency.kind) => {
                self.preempt(running, kind, now, &mut actions);
                self.start(emergency, now, &mut actions);
            }
            Some(mut running) => {
                let active = running.emergency.kind;
                running
                    .emergency
                    .log(now, ResponseEvent::Superseding { queued: kind });
                emergency.log(now, ResponseEvent::Deferred { behind: active });
                info!(%kind, %active, "emergency queued behind active response");
                self.responding = Some(running);
                self.queue.push(emergency);
            }
        }
        actions
    }

    /// Operator E-STOP. Interrupts any running response and latches until
    /// [`Self::resume`].
    pub fn estop(&mut self, source: &str, now: DateTime<Utc>) -> Vec<ControllerAction> {
        let mut actions = Vec::new();
        if self.halted.is_some() {
            info!(source, "E-STOP already latched");
            return actions;
        }

        let mut estop = Emergency::new(EmergencyKind::EStop, ESTOP_VETO, now);
        error!(source, "E-STOP");
        actions.push(ControllerAction::Emit(SafetyEvent::EStopTriggered {
            source: source.to_string(),
        }));
        actions.push(ControllerAction::Emit(SafetyEvent::EmergencyTransition {
            id: estop.id,
            kind: EmergencyKind::EStop,
            from: None,
            to: EmergencyState::Detected,
        }));

        if let Some(running) = self.responding.take() {
            self.preempt(running, EmergencyKind::EStop, now, &mut actions);
        }
        actions.push(ControllerAction::DisableMotors {
            emergency_id: estop.id,
        });
        estop.deadline = Some(deadline(now, self.timing.estop));
        transition(&mut estop, EmergencyState::Halted, now, &mut actions);
        self.epoch += 1;
        self.halted = Some(estop);
        actions
    }

    /// Record how the E-STOP motor disable went.
    pub fn record_estop_result(
        &mut self,
        result: Result<Duration, SafetyError>,
        now: DateTime<Utc>,
    ) -> Vec<ControllerAction> {
        let Some(estop) = self.halted.as_mut() else {
            return Vec::new();
        };
        match result {
            Ok(elapsed) => {
                estop.log(
                    now,
                    ResponseEvent::StepSucceeded {
                        command: EffectorCommand::DisableMotors,
                        attempt: 1,
                    },
                );
                estop.log(
                    now,
                    ResponseEvent::Note {
                        message: format!("motors disabled in {} ms", elapsed.as_millis()),
                    },
                );
                Vec::new()
            }
            Err(err) => {
                error!(%err, "E-STOP could not disable motors");
                estop.log(
                    now,
                    ResponseEvent::StepFailed {
                        command: EffectorCommand::DisableMotors,
                        attempt: 1,
                        error: err.to_string(),
                    },
                );
                vec![ControllerAction::Emit(SafetyEvent::Alert {
                    level: AlertLevel::Emergency,
                    message: format!("E-STOP could not disable motors: {err}"),
                })]
            }
        }
    }

    /// Operator resume after an E-STOP.
    ///
    /// # Errors
    ///
    /// [`SafetyError::UnknownVeto`] when no E-STOP is latched.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<Vec<ControllerAction>, SafetyError> {
        let mut estop = self
            .halted
            .take()
            .ok_or_else(|| SafetyError::UnknownVeto(ESTOP_VETO.to_string()))?;
        let mut actions = Vec::new();
        transition(&mut estop, EmergencyState::Cleared, now, &mut actions);
        self.archive(estop);
        self.activate_next(now, &mut actions);
        Ok(actions)
    }

    // -----------------------------------------------------------------------
    // Response runs
    // -----------------------------------------------------------------------

    /// Append a runner progress event to the active emergency's log. Returns
    /// `false` for runs that are no longer current.
    pub fn record_progress(
        &mut self,
        run_id: Uuid,
        event: ResponseEvent,
        now: DateTime<Utc>,
    ) -> bool {
        match self.responding.as_mut() {
            Some(running) if running.run_id == run_id => {
                running.emergency.log(now, event);
                true
            }
            _ => false,
        }
    }

    /// A response run ended. Results from runs that were cancelled are
    /// ignored.
    pub fn finish(
        &mut self,
        run_id: Uuid,
        result: Result<(), SafetyError>,
        now: DateTime<Utc>,
    ) -> Vec<ControllerAction> {
        let mut actions = Vec::new();
        let Some(Running { mut emergency, .. }) = self.responding.take_if(|r| r.run_id == run_id)
        else {
            debug!(%run_id, "ignoring result of stale response run");
            return actions;
        };
        emergency.deadline = None;

        match result {
            Ok(()) => {
                transition(&mut emergency, EmergencyState::SafeStateReached, now, &mut actions);
                actions.push(ControllerAction::SafeStateReached {
                    veto_reason: emergency.veto_reason.clone(),
                });
                self.recovering.push(emergency);
            }
            Err(err) => {
                let kind = emergency.kind;
                emergency.log(
                    now,
                    ResponseEvent::Note {
                        message: err.to_string(),
                    },
                );
                transition(
                    &mut emergency,
                    EmergencyState::ManualRecoveryRequired,
                    now,
                    &mut actions,
                );
                error!(%kind, %err, "emergency response failed; manual recovery required");
                actions.push(ControllerAction::RaiseManualVeto {
                    reason: manual_recovery_reason(kind),
                    detail: format!("{kind} response failed: {err}"),
                });
                actions.push(ControllerAction::Emit(SafetyEvent::Alert {
                    level: AlertLevel::Emergency,
                    message: format!("{kind} response failed, manual recovery required: {err}"),
                }));
                self.archive(emergency);
            }
        }
        self.activate_next(now, &mut actions);
        actions
    }

    /// An abort-class operator command. Any running response is interrupted
    /// and handed to the operator, then the command is issued.
    pub fn operator_abort(
        &mut self,
        command: EffectorCommand,
        now: DateTime<Utc>,
    ) -> Vec<ControllerAction> {
        let mut actions = Vec::new();
        if let Some(Running {
            mut emergency,
            run_id,
        }) = self.responding.take()
        {
            let kind = emergency.kind;
            actions.push(ControllerAction::Cancel { run_id });
            emergency.deadline = None;
            emergency.log(
                now,
                ResponseEvent::Note {
                    message: format!("interrupted by operator {command}"),
                },
            );
            transition(
                &mut emergency,
                EmergencyState::ManualRecoveryRequired,
                now,
                &mut actions,
            );
            warn!(%kind, %command, "emergency response interrupted by operator");
            actions.push(ControllerAction::RaiseManualVeto {
                reason: manual_recovery_reason(kind),
                detail: format!("{kind} response interrupted by operator {command}"),
            });
            actions.push(ControllerAction::Emit(SafetyEvent::Alert {
                level: AlertLevel::Critical,
                message: format!("{kind} response interrupted by operator {command}"),
            }));
            self.archive(emergency);
        }
        actions.push(ControllerAction::Issue(command));
        self.activate_next(now, &mut actions);
        actions
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// The veto behind a recovering emergency started its holdoff.
    pub fn on_holdoff_started(
        &mut self,
        veto_reason: &str,
        now: DateTime<Utc>,
    ) -> Vec<ControllerAction> {
        let mut actions = Vec::new();
        for e in self
            .recovering
            .iter_mut()
            .filter(|e| e.veto_reason == veto_reason && e.state == EmergencyState::SafeStateReached)
        {
            transition(e, EmergencyState::Holdoff, now, &mut actions);
        }
        actions
    }

    /// The veto was violated again before its holdoff finished.
    pub fn on_holdoff_cancelled(
        &mut self,
        veto_reason: &str,
        now: DateTime<Utc>,
    ) -> Vec<ControllerAction> {
        let mut actions = Vec::new();
        for e in self
            .recovering
            .iter_mut()
            .filter(|e| e.veto_reason == veto_reason && e.state == EmergencyState::Holdoff)
        {
            transition(e, EmergencyState::SafeStateReached, now, &mut actions);
        }
        actions
    }

    /// The veto was removed. Recovering emergencies clear; queued ones that
    /// never ran are dropped.
    pub fn on_veto_cleared(
        &mut self,
        veto_reason: &str,
        now: DateTime<Utc>,
    ) -> Vec<ControllerAction> {
        let mut actions = Vec::new();

        let (done, recovering): (Vec<_>, Vec<_>) = std::mem::take(&mut self.recovering)
            .into_iter()
            .partition(|e| e.veto_reason == veto_reason);
        self.recovering = recovering;

        let (dropped, queue): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queue)
            .into_iter()
            .partition(|e| e.veto_reason == veto_reason);
        self.queue = queue;

        for mut e in done {
            transition(&mut e, EmergencyState::Cleared, now, &mut actions);
            self.archive(e);
        }
        for mut e in dropped {
            e.log(
                now,
                ResponseEvent::Note {
                    message: "condition cleared before the response ran".to_string(),
                },
            );
            transition(&mut e, EmergencyState::Cleared, now, &mut actions);
            self.archive(e);
        }
        actions
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Most urgent live emergency: halted, then responding, then recovering,
    /// then queued.
    pub fn current(&self) -> Option<&Emergency> {
        self.halted
            .as_ref()
            .or(self.responding.as_ref().map(|r| &r.emergency))
            .or_else(|| self.recovering.iter().min_by_key(|e| (e.priority, e.started_at)))
            .or_else(|| self.queue.iter().min_by_key(|e| (e.priority, e.started_at)))
    }

    pub fn responding(&self) -> Option<&Emergency> {
        self.responding.as_ref().map(|r| &r.emergency)
    }

    pub fn current_run(&self) -> Option<Uuid> {
        self.responding.as_ref().map(|r| r.run_id)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Incremented whenever an emergency starts responding or halts.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn queued(&self) -> &[Emergency] {
        &self.queue
    }

    pub fn recovering(&self) -> &[Emergency] {
        &self.recovering
    }

    pub fn history(&self) -> impl Iterator<Item = &Emergency> {
        self.history.iter()
    }

    /// Every emergency the controller knows about: halted, responding,
    /// queued, recovering, then history.
    pub fn iter(&self) -> impl Iterator<Item = &Emergency> {
        self.halted
            .iter()
            .chain(self.responding.iter().map(|r| &r.emergency))
            .chain(self.queue.iter())
            .chain(self.recovering.iter())
            .chain(self.history.iter())
    }

    /// Look up an emergency in any state by id.
    pub fn find(&self, id: Uuid) -> Option<&Emergency> {
        self.iter().find(|e| e.id == id)
    }

    pub fn timing(&self) -> &ResponseTiming {
        &self.timing
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn is_live(&self, veto_reason: &str) -> bool {
        self.responding
            .as_ref()
            .is_some_and(|r| r.emergency.veto_reason == veto_reason)
            || self.queue.iter().any(|e| e.veto_reason == veto_reason)
            || self.recovering.iter().any(|e| e.veto_reason == veto_reason)
    }

    fn start(
        &mut self,
        mut emergency: Emergency,
        now: DateTime<Utc>,
        actions: &mut Vec<ControllerAction>,
    ) {
        let kind = emergency.kind;
        if emergency.was_preempted() {
            emergency.log(
                now,
                ResponseEvent::Note {
                    message: "restarting response script".to_string(),
                },
            );
        }
        let overall = self.timing.overall(kind);
        emergency.deadline = Some(deadline(now, overall));
        transition(&mut emergency, EmergencyState::Responding, now, actions);
        self.epoch += 1;

        let run_id = Uuid::new_v4();
        actions.push(ControllerAction::Start(ResponsePlan {
            emergency_id: emergency.id,
            run_id,
            kind,
            steps: self.timing.script(kind),
            overall,
            max_retries: self.timing.max_retries,
            retry_backoff: self.timing.retry_backoff,
        }));
        self.responding = Some(Running { emergency, run_id });
    }

    fn preempt(
        &mut self,
        running: Running,
        by: EmergencyKind,
        now: DateTime<Utc>,
        actions: &mut Vec<ControllerAction>,
    ) {
        let Running {
            mut emergency,
            run_id,
        } = running;
        actions.push(ControllerAction::Cancel { run_id });
        warn!(kind = %emergency.kind, %by, "response preempted");
        emergency.log(now, ResponseEvent::PreemptedByEmergency { by });
        actions.push(ControllerAction::Emit(SafetyEvent::EmergencyPreempted {
            id: emergency.id,
            kind: emergency.kind,
            by,
        }));
        emergency.deadline = None;
        transition(&mut emergency, EmergencyState::Detected, now, actions);
        self.queue.push(emergency);
    }

    fn activate_next(&mut self, now: DateTime<Utc>, actions: &mut Vec<ControllerAction>) {
        if self.halted.is_some() || self.responding.is_some() {
            return;
        }
        let next = self
            .queue
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.priority, e.started_at))
            .map(|(i, _)| i);
        if let Some(index) = next {
            let emergency = self.queue.remove(index);
            self.start(emergency, now, actions);
        }
    }

    fn archive(&mut self, emergency: Emergency) {
        self.history.push_back(emergency);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }
}

fn transition(
    emergency: &mut Emergency,
    to: EmergencyState,
    now: DateTime<Utc>,
    actions: &mut Vec<ControllerAction>,
) {
    let from = emergency.transition(to, now);
    info!(kind = %emergency.kind, %from, %to, "emergency transition");
    actions.push(ControllerAction::Emit(SafetyEvent::EmergencyTransition {
        id: emergency.id,
        kind: emergency.kind,
        from: Some(from),
        to,
    }));
}
