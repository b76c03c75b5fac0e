//! Emergency kinds, lifecycle states, effector commands and response logs.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What triggered an emergency. Each kind carries a fixed priority; a lower
/// number preempts a higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyKind {
    EStop,
    Rain,
    PowerFailure,
    HighWind,
    SensorFailure,
    MountFault,
    WeatherUnsafe,
}

impl EmergencyKind {
    pub fn priority(self) -> u8 {
        match self {
            EmergencyKind::EStop => 0,
            EmergencyKind::Rain | EmergencyKind::PowerFailure => 1,
            EmergencyKind::HighWind | EmergencyKind::SensorFailure | EmergencyKind::MountFault => 2,
            EmergencyKind::WeatherUnsafe => 3,
        }
    }

    /// E-STOP and power failures always need an operator to recover.
    pub fn auto_clearable_allowed(self) -> bool {
        !matches!(self, EmergencyKind::EStop | EmergencyKind::PowerFailure)
    }

    /// Whether `self` preempts a response already running for `active`.
    pub fn preempts(self, active: EmergencyKind) -> bool {
        self.priority() < active.priority()
    }
}

impl fmt::Display for EmergencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EmergencyKind::EStop => "E-STOP",
            EmergencyKind::Rain => "RAIN",
            EmergencyKind::PowerFailure => "POWER_FAILURE",
            EmergencyKind::HighWind => "HIGH_WIND",
            EmergencyKind::SensorFailure => "SENSOR_FAILURE",
            EmergencyKind::MountFault => "MOUNT_FAULT",
            EmergencyKind::WeatherUnsafe => "WEATHER_UNSAFE",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyState {
    Detected,
    Responding,
    SafeStateReached,
    Holdoff,
    Cleared,
    ManualRecoveryRequired,
    /// E-STOP latched; waits for an operator resume.
    Halted,
}

impl EmergencyState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EmergencyState::Cleared | EmergencyState::ManualRecoveryRequired
        )
    }
}

impl fmt::Display for EmergencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EmergencyState::Detected => "DETECTED",
            EmergencyState::Responding => "RESPONDING",
            EmergencyState::SafeStateReached => "SAFE_STATE_REACHED",
            EmergencyState::Holdoff => "HOLDOFF",
            EmergencyState::Cleared => "CLEARED",
            EmergencyState::ManualRecoveryRequired => "MANUAL_RECOVERY_REQUIRED",
            EmergencyState::Halted => "HALTED",
        };
        f.write_str(label)
    }
}

/// Commands understood by the mount and enclosure effectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectorCommand {
    AbortSlew,
    Park,
    Unpark,
    CloseEnclosure,
    OpenEnclosure,
    DisableMotors,
}

impl fmt::Display for EffectorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EffectorCommand::AbortSlew => "abort_slew",
            EffectorCommand::Park => "park",
            EffectorCommand::Unpark => "unpark",
            EffectorCommand::CloseEnclosure => "close_enclosure",
            EffectorCommand::OpenEnclosure => "open_enclosure",
            EffectorCommand::DisableMotors => "disable_motors",
        };
        f.write_str(label)
    }
}

/// One step of a response script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStep {
    pub command: EffectorCommand,
    /// Wait for the effector to report the commanded state.
    pub await_confirmation: bool,
    pub deadline: Duration,
}

/// Entries recorded in an emergency's response log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResponseEvent {
    StateChanged {
        from: EmergencyState,
        to: EmergencyState,
    },
    StepStarted {
        command: EffectorCommand,
        attempt: u32,
    },
    StepSucceeded {
        command: EffectorCommand,
        attempt: u32,
    },
    StepFailed {
        command: EffectorCommand,
        attempt: u32,
        error: String,
    },
    /// Interrupted by a higher-priority emergency.
    PreemptedByEmergency { by: EmergencyKind },
    /// Queued behind a response that was already running.
    Deferred { behind: EmergencyKind },
    /// A lower-or-equal priority detection arrived while this one ran.
    Superseding { queued: EmergencyKind },
    Note { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseLogRecord {
    pub at: DateTime<Utc>,
    pub event: ResponseEvent,
}

/// A detected hazard and the response taken against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emergency {
    pub id: Uuid,
    pub kind: EmergencyKind,
    pub priority: u8,
    pub state: EmergencyState,
    /// Detection time; orders same-priority emergencies in the queue.
    pub started_at: DateTime<Utc>,
    /// Overall response deadline while responding.
    pub deadline: Option<DateTime<Utc>>,
    /// The veto this emergency recovers through.
    pub veto_reason: String,
    pub response_log: Vec<ResponseLogRecord>,
}

impl Emergency {
    pub fn new(kind: EmergencyKind, veto_reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            priority: kind.priority(),
            state: EmergencyState::Detected,
            started_at: now,
            deadline: None,
            veto_reason: veto_reason.into(),
            response_log: Vec::new(),
        }
    }

    pub fn log(&mut self, at: DateTime<Utc>, event: ResponseEvent) {
        self.response_log.push(ResponseLogRecord { at, event });
    }

    /// Move to `to`, recording the change in the response log.
    pub fn transition(&mut self, to: EmergencyState, at: DateTime<Utc>) -> EmergencyState {
        let from = self.state;
        self.state = to;
        self.log(at, ResponseEvent::StateChanged { from, to });
        from
    }

    pub fn was_preempted(&self) -> bool {
        self.response_log
            .iter()
            .any(|r| matches!(r.event, ResponseEvent::PreemptedByEmergency { .. }))
    }
}

impl fmt::Display for Emergency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] via {}", self.kind, self.state, self.veto_reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estop_preempts_everything() {
        for kind in [
            EmergencyKind::Rain,
            EmergencyKind::PowerFailure,
            EmergencyKind::HighWind,
            EmergencyKind::WeatherUnsafe,
        ] {
            assert!(EmergencyKind::EStop.preempts(kind));
            assert!(!kind.preempts(EmergencyKind::EStop));
        }
    }

    #[test]
    fn same_priority_does_not_preempt() {
        assert!(!EmergencyKind::Rain.preempts(EmergencyKind::PowerFailure));
        assert!(!EmergencyKind::HighWind.preempts(EmergencyKind::HighWind));
        assert!(EmergencyKind::Rain.preempts(EmergencyKind::HighWind));
    }

    #[test]
    fn transition_is_logged() {
        let now = Utc::now();
        let mut e = Emergency::new(EmergencyKind::Rain, "rain", now);
        let from = e.transition(EmergencyState::Responding, now);
        assert_eq!(from, EmergencyState::Detected);
        assert_eq!(e.state, EmergencyState::Responding);
        assert!(matches!(
            e.response_log[0].event,
            ResponseEvent::StateChanged {
                from: EmergencyState::Detected,
                to: EmergencyState::Responding
            }
        ));
    }

    #[test]
    fn estop_and_power_failure_never_auto_clear() {
        assert!(!EmergencyKind::EStop.auto_clearable_allowed());
        assert!(!EmergencyKind::PowerFailure.auto_clearable_allowed());
        assert!(EmergencyKind::HighWind.auto_clearable_allowed());
    }
}
