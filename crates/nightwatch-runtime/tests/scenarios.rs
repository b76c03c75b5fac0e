//! End-to-end runs of the supervisor, response runner and confirmation gate
//! against the simulated observatory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use nightwatch_hal::{Effector, MountState, ObservatoryState, SimObservatory};
use nightwatch_kernel::{
    GatePolicy, ResponseTiming, SafetyCore, ThresholdSet, ToolRegistry, standard_tools,
};
use nightwatch_memory::AuditLog;
use nightwatch_middleware::{EventBus, ScriptedChannel};
use nightwatch_runtime::{
    ConfirmationGate, ObservatoryExecutor, Supervisor, SupervisorConfig, SupervisorHandle,
};
use nightwatch_types::{
    Comparison, ConditionValue, ConfirmationOutcome, ConfirmationTier, EffectorCommand, Emergency,
    EmergencyKind, EmergencyState, ResponseEvent, SafetyCondition, SafetyError, SafetyStatus,
    SessionContext, Threshold, VetoStatus, VetoTier,
};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);
const HOLDOFF: Duration = Duration::from_millis(300);

// ────────────────────────────────────────────────────────────────────────────
// Fixture
// ────────────────────────────────────────────────────────────────────────────

fn thresholds() -> ThresholdSet {
    ThresholdSet::new(vec![
        Threshold {
            reason: "wind".into(),
            condition: "wind_speed".into(),
            comparison: Comparison::Max,
            limit: 25.0,
            tier: VetoTier::Critical,
            hysteresis: 0.0,
            holdoff: HOLDOFF,
            auto_clearable: true,
            emergency: Some(EmergencyKind::HighWind),
        },
        Threshold {
            reason: "rain".into(),
            condition: "rain_detected".into(),
            comparison: Comparison::BooleanTrue,
            limit: 0.0,
            tier: VetoTier::Critical,
            hysteresis: 0.0,
            holdoff: HOLDOFF,
            auto_clearable: false,
            emergency: Some(EmergencyKind::Rain),
        },
    ])
    .unwrap()
}

fn timing() -> ResponseTiming {
    ResponseTiming {
        abort_slew: Duration::from_millis(500),
        park: Duration::from_secs(1),
        close_enclosure: Duration::from_secs(10),
        retry_backoff: Duration::from_millis(20),
        weather_overall: Duration::from_secs(20),
        ..ResponseTiming::default()
    }
}

struct Observatory {
    sim: Arc<SimObservatory>,
    supervisor: SupervisorHandle,
    gate: Arc<ConfirmationGate>,
    channel: Arc<ScriptedChannel>,
    task: JoinHandle<()>,
}

impl Observatory {
    fn start(sim: SimObservatory, timing: ResponseTiming, confirmation_timeout: Duration) -> Self {
        Self::with_audit(sim, timing, confirmation_timeout, AuditLog::open_in_memory().unwrap())
    }

    fn with_audit(
        sim: SimObservatory,
        timing: ResponseTiming,
        confirmation_timeout: Duration,
        audit: AuditLog,
    ) -> Self {
        let sim = Arc::new(sim);
        let effector: Arc<dyn Effector> = sim.clone();
        let (supervisor, task) = Supervisor::spawn(
            SafetyCore::new(thresholds(), timing),
            audit,
            EventBus::default(),
            Arc::clone(&effector),
            SupervisorConfig {
                sweep_interval: Duration::from_millis(50),
                ..SupervisorConfig::default()
            },
        );
        let channel = Arc::new(ScriptedChannel::default());
        let executor = Arc::new(ObservatoryExecutor::new(
            effector,
            supervisor.clone(),
            Duration::from_secs(1),
        ));
        let gate = Arc::new(ConfirmationGate::new(
            ToolRegistry::new(standard_tools()).unwrap(),
            GatePolicy {
                confirmation_timeout,
                ..GatePolicy::default()
            },
            supervisor.clone(),
            channel.clone(),
            executor,
        ));
        Self {
            sim,
            supervisor,
            gate,
            channel,
            task,
        }
    }

    async fn wind(&self, speed: f64) {
        self.supervisor
            .push_snapshot(reading("wind_speed", ConditionValue::Numeric(speed)))
            .await
            .unwrap();
    }

    async fn rain(&self, wet: bool) {
        self.supervisor
            .push_snapshot(reading("rain_detected", ConditionValue::Flag(wet)))
            .await
            .unwrap();
    }

    /// Both sensors reporting safe values.
    async fn calm(&self) {
        self.wind(10.0).await;
        self.rain(false).await;
        self.until("no vetoes", |s| s.vetoes.is_empty()).await;
    }

    async fn until(
        &self,
        what: &str,
        condition: impl FnMut(&SafetyStatus) -> bool,
    ) -> SafetyStatus {
        let mut status = self.supervisor.subscribe_status();
        let seen = tokio::time::timeout(WAIT, status.wait_for(condition))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .expect("supervisor stopped")
            .clone();
        seen
    }

    async fn emergency(&self, kind: EmergencyKind) -> Emergency {
        self.supervisor
            .emergencies()
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.kind == kind)
            .unwrap_or_else(|| panic!("no {kind} emergency"))
    }

    async fn until_commanded(&self, command: EffectorCommand) {
        let started = Instant::now();
        while !self.sim.commands().contains(&command) {
            assert!(started.elapsed() < WAIT, "{command} never issued");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn reading(name: &str, value: ConditionValue) -> SafetyCondition {
    SafetyCondition::new(name, value, "test-adapter", Duration::from_secs(120))
}

fn veto_status(status: &SafetyStatus, reason: &str) -> Option<VetoStatus> {
    status.vetoes.iter().find(|v| v.reason == reason).map(|v| v.status)
}

fn current_is(status: &SafetyStatus, kind: EmergencyKind, state: EmergencyState) -> bool {
    status
        .current_emergency
        .as_ref()
        .is_some_and(|e| e.kind == kind && e.state == state)
}

// ────────────────────────────────────────────────────────────────────────────
// Scenario A: high wind
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn high_wind_parks_then_holds_off_after_the_wind_drops() {
    let obs = Observatory::start(SimObservatory::new(), timing(), Duration::from_secs(1));
    obs.calm().await;

    obs.wind(32.0).await;
    let status = obs
        .until("high wind safe state", |s| {
            current_is(s, EmergencyKind::HighWind, EmergencyState::SafeStateReached)
        })
        .await;
    assert_eq!(status.active_tier, Some(VetoTier::Critical));
    assert_eq!(
        obs.sim.commands(),
        vec![EffectorCommand::AbortSlew, EffectorCommand::Park]
    );
    assert_eq!(obs.sim.state().mount, MountState::Parked);
    assert!(status.session.mount_parked);

    // Still above the limit: the holdoff must not start.
    obs.wind(30.0).await;
    tokio::time::sleep(HOLDOFF * 2).await;
    assert_eq!(
        veto_status(&obs.supervisor.status(), "wind"),
        Some(VetoStatus::Triggered)
    );

    obs.wind(24.0).await;
    obs.until("wind holdoff", |s| {
        veto_status(s, "wind") == Some(VetoStatus::Holdoff)
    })
    .await;
    obs.until("wind auto-clear", |s| {
        s.vetoes.is_empty() && s.current_emergency.is_none()
    })
    .await;
    assert_eq!(
        obs.emergency(EmergencyKind::HighWind).await.state,
        EmergencyState::Cleared
    );
}

// ────────────────────────────────────────────────────────────────────────────
// Scenario B: rain preempts wind
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rain_preempts_wind_and_closes_up_in_order() {
    let sim = SimObservatory::new();
    sim.set_latency(EffectorCommand::Park, Duration::from_millis(200));
    let obs = Observatory::start(sim, timing(), Duration::from_secs(1));
    obs.calm().await;

    obs.wind(32.0).await;
    obs.until("wind response", |s| {
        current_is(s, EmergencyKind::HighWind, EmergencyState::Responding)
    })
    .await;

    let rain_started = Instant::now();
    obs.rain(true).await;
    obs.until("rain response", |s| {
        s.current_emergency
            .as_ref()
            .is_some_and(|e| e.kind == EmergencyKind::Rain)
    })
    .await;
    obs.until_commanded(EffectorCommand::CloseEnclosure).await;
    let rain = loop {
        let rain = obs.emergency(EmergencyKind::Rain).await;
        if rain.state == EmergencyState::SafeStateReached {
            break rain;
        }
        assert!(rain_started.elapsed() < WAIT, "rain response did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert!(rain_started.elapsed() < Duration::from_secs(60));

    let commands = obs.sim.commands();
    let close = commands
        .iter()
        .position(|c| *c == EffectorCommand::CloseEnclosure)
        .unwrap();
    assert_eq!(
        commands[close - 2..=close],
        [
            EffectorCommand::AbortSlew,
            EffectorCommand::Park,
            EffectorCommand::CloseEnclosure
        ]
    );
    assert!(rain.response_log.iter().any(|r| matches!(
        r.event,
        ResponseEvent::StepSucceeded {
            command: EffectorCommand::CloseEnclosure,
            ..
        }
    )));

    let wind = obs.emergency(EmergencyKind::HighWind).await;
    assert!(wind.response_log.iter().any(|r| matches!(
        r.event,
        ResponseEvent::PreemptedByEmergency {
            by: EmergencyKind::Rain
        }
    )));

    // Dry again: rain holds off, then waits for an operator.
    obs.rain(false).await;
    obs.until("rain ready to clear", |s| {
        veto_status(s, "rain") == Some(VetoStatus::AwaitingOperator)
    })
    .await;
    tokio::time::sleep(HOLDOFF).await;
    assert!(obs.supervisor.reasons().contains(&"rain".to_string()));

    obs.supervisor.clear_veto("rain", "alice").await.unwrap();
    assert!(!obs.supervisor.reasons().contains(&"rain".to_string()));
}

#[tokio::test]
async fn early_clear_is_refused() {
    let obs = Observatory::start(SimObservatory::new(), timing(), Duration::from_secs(1));
    obs.calm().await;
    obs.rain(true).await;
    obs.until("rain veto", |s| veto_status(s, "rain").is_some()).await;

    assert!(matches!(
        obs.supervisor.clear_veto("rain", "alice").await,
        Err(SafetyError::HoldoffNotElapsed { .. })
    ));
    obs.supervisor
        .override_veto("rain", "alice", "sensor wet from dew, sky verified clear")
        .await
        .unwrap();
    assert!(!obs.supervisor.reasons().contains(&"rain".to_string()));
}

#[tokio::test]
async fn operator_can_close_up_under_a_rain_veto_but_not_reopen() {
    let obs = Observatory::start(SimObservatory::new(), timing(), Duration::from_secs(1));
    obs.calm().await;
    obs.rain(true).await;
    obs.until("rain safe state", |s| {
        current_is(s, EmergencyKind::Rain, EmergencyState::SafeStateReached) && !s.responding
    })
    .await;

    assert!(matches!(
        obs.gate
            .request_invocation("open_enclosure", &SessionContext::default())
            .await,
        Err(SafetyError::VetoActive { .. })
    ));
    assert!(obs.channel.prompts().is_empty());

    obs.channel.push("yes", Duration::ZERO);
    let decision = obs
        .gate
        .request_invocation("close_enclosure", &SessionContext::default())
        .await
        .unwrap();
    assert_eq!(decision.effective_tier, ConfirmationTier::Confirm);
    assert_eq!(decision.outcome, ConfirmationOutcome::Confirmed);
    assert_eq!(obs.channel.prompts().len(), 1);
    assert_eq!(obs.supervisor.status().plant.enclosure_open, Some(false));
}

#[tokio::test]
async fn reading_from_the_future_cannot_hide_rain() {
    let obs = Observatory::start(SimObservatory::new(), timing(), Duration::from_secs(1));
    obs.calm().await;

    let ahead = Utc::now() + chrono::Duration::hours(1);
    obs.supervisor
        .push_snapshot(reading("rain_detected", ConditionValue::Flag(false)).observed_at(ahead))
        .await
        .unwrap();
    obs.rain(true).await;
    obs.until("rain veto", |s| veto_status(s, "rain").is_some()).await;
    obs.until_commanded(EffectorCommand::CloseEnclosure).await;
}

// ────────────────────────────────────────────────────────────────────────────
// Scenario C: double confirmation while imaging
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn park_while_imaging_needs_the_phrase_not_yes() {
    let obs = Observatory::start(SimObservatory::new(), timing(), Duration::from_millis(300));
    obs.calm().await;
    obs.channel.push("yes", Duration::ZERO);
    obs.channel.push("yes", Duration::ZERO);

    let imaging = SessionContext {
        imaging_active: true,
        ..SessionContext::default()
    };
    let err = obs
        .gate
        .request_invocation("park_telescope", &imaging)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        SafetyError::ConfirmationTimeout {
            tool: "park_telescope".into()
        }
    );
    let prompts = obs.channel.prompts();
    assert_eq!(prompts[0], "Confirm park telescope? (yes/no)");
    assert!(prompts[1..]
        .iter()
        .all(|p| p == "To proceed, say 'confirm park telescope'."));
    assert!(!obs.sim.commands().contains(&EffectorCommand::Park));
}

#[tokio::test]
async fn park_while_imaging_runs_with_the_phrase() {
    let obs = Observatory::start(SimObservatory::new(), timing(), Duration::from_secs(1));
    obs.calm().await;
    obs.channel.push("yes", Duration::ZERO);
    obs.channel.push("confirm park telescope", Duration::ZERO);

    let imaging = SessionContext {
        imaging_active: true,
        ..SessionContext::default()
    };
    let decision = obs
        .gate
        .request_invocation("park_telescope", &imaging)
        .await
        .unwrap();
    assert_eq!(decision.base_tier, ConfirmationTier::Confirm);
    assert_eq!(decision.effective_tier, ConfirmationTier::Double);
    assert_eq!(decision.outcome, ConfirmationOutcome::Confirmed);
    assert_eq!(obs.sim.state().mount, MountState::Parked);
}

// ────────────────────────────────────────────────────────────────────────────
// Scenario D: unpark while parked
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unpark_while_parked_executes_immediately() {
    let parked = ObservatoryState {
        mount: MountState::Parked,
        ..ObservatoryState::default()
    };
    let obs = Observatory::start(
        SimObservatory::new().with_state(parked),
        timing(),
        Duration::from_secs(1),
    );
    obs.calm().await;

    let session = SessionContext {
        mount_parked: true,
        ..SessionContext::default()
    };
    let decision = obs
        .gate
        .request_invocation("unpark_telescope", &session)
        .await
        .unwrap();

    assert_eq!(decision.base_tier, ConfirmationTier::Announce);
    assert_eq!(decision.effective_tier, ConfirmationTier::None);
    assert_eq!(decision.outcome, ConfirmationOutcome::Executed);
    assert!(obs.channel.prompts().is_empty());
    assert!(obs.channel.announcements().is_empty());
    assert_eq!(obs.sim.state().mount, MountState::Idle);
}

#[tokio::test]
async fn hardware_tools_are_refused_during_a_response() {
    let sim = SimObservatory::new();
    sim.set_latency(EffectorCommand::Park, Duration::from_millis(500));
    let obs = Observatory::start(sim, timing(), Duration::from_secs(1));
    obs.calm().await;
    obs.wind(32.0).await;
    obs.until("wind response", |s| s.responding).await;

    let err = obs
        .gate
        .request_invocation("open_enclosure", &SessionContext::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SafetyError::SafetyOverrideActive {
            tool: "open_enclosure".into(),
            emergency: "HIGH_WIND".into()
        }
    );
}

// ────────────────────────────────────────────────────────────────────────────
// Scenario E: E-STOP during the rain response
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn estop_interrupts_rain_close_and_disables_motors() {
    let sim = SimObservatory::new();
    sim.set_latency(EffectorCommand::CloseEnclosure, Duration::from_secs(5));
    let obs = Observatory::start(sim, timing(), Duration::from_secs(1));
    obs.calm().await;

    obs.rain(true).await;
    obs.until_commanded(EffectorCommand::CloseEnclosure).await;

    let pressed = Instant::now();
    obs.supervisor.estop("console").await.unwrap();
    assert!(pressed.elapsed() < Duration::from_millis(100));
    assert!(!obs.sim.state().motors_enabled);

    let status = obs.supervisor.status();
    assert!(status.estop_latched);
    assert!(current_is(&status, EmergencyKind::EStop, EmergencyState::Halted));

    let rain = obs.emergency(EmergencyKind::Rain).await;
    assert!(rain.response_log.iter().any(|r| matches!(
        r.event,
        ResponseEvent::PreemptedByEmergency {
            by: EmergencyKind::EStop
        }
    )));
    assert_eq!(rain.state, EmergencyState::Detected);

    // Nothing else runs until an operator resumes.
    assert!(matches!(
        obs.gate
            .request_invocation("park_telescope", &SessionContext::default())
            .await,
        Err(SafetyError::SafetyOverrideActive { .. })
    ));
    obs.supervisor.resume("alice").await.unwrap();
    obs.until("rain restarts", |s| {
        current_is(s, EmergencyKind::Rain, EmergencyState::Responding)
    })
    .await;
}

#[tokio::test]
async fn emergency_preempts_a_pending_confirmation() {
    let obs = Observatory::start(SimObservatory::new(), timing(), Duration::from_secs(5));
    obs.calm().await;

    let pending = {
        let gate = Arc::clone(&obs.gate);
        tokio::spawn(async move {
            gate.request_invocation("open_enclosure", &SessionContext::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    obs.rain(true).await;

    let err = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap().unwrap_err();
    assert_eq!(
        err,
        SafetyError::PreemptedByEmergency {
            tool: "open_enclosure".into(),
            emergency: "RAIN".into()
        }
    );
}

#[tokio::test]
async fn abort_tool_interrupts_response_and_requires_manual_recovery() {
    let sim = SimObservatory::new();
    sim.set_latency(EffectorCommand::Park, Duration::from_millis(500));
    let obs = Observatory::start(sim, timing(), Duration::from_secs(1));
    obs.calm().await;
    obs.wind(32.0).await;
    obs.until("wind response", |s| s.responding).await;

    let decision = obs
        .gate
        .request_invocation("abort_slew", &SessionContext::default())
        .await
        .unwrap();
    assert_eq!(decision.outcome, ConfirmationOutcome::Bypassed);

    let status = obs
        .until("manual recovery", |s| !s.manual_recovery.is_empty())
        .await;
    assert_eq!(status.manual_recovery, vec!["manual_recovery:high_wind".to_string()]);
    assert!(matches!(
        obs.gate
            .request_invocation("start_imaging", &SessionContext::default())
            .await,
        Err(SafetyError::ManualRecoveryRequired { .. })
    ));
    // Queries still run; the wind veto makes them ask first.
    obs.channel.push("yes", Duration::ZERO);
    assert!(obs
        .gate
        .request_invocation("get_status", &SessionContext::default())
        .await
        .is_ok());

    // The operator can still finish parking by hand.
    obs.channel.push("yes", Duration::ZERO);
    let decision = obs
        .gate
        .request_invocation("park_telescope", &SessionContext::default())
        .await
        .unwrap();
    assert_eq!(decision.effective_tier, ConfirmationTier::Confirm);
    assert_eq!(decision.outcome, ConfirmationOutcome::Confirmed);
    assert_eq!(obs.sim.state().mount, MountState::Parked);
}

// ────────────────────────────────────────────────────────────────────────────
// Failure handling and persistence
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_park_escalates_to_manual_recovery() {
    let sim = SimObservatory::new();
    sim.never_confirm(EffectorCommand::Park);
    let timing = ResponseTiming {
        park: Duration::from_millis(50),
        ..timing()
    };
    let obs = Observatory::start(sim, timing, Duration::from_secs(1));
    obs.calm().await;
    obs.wind(32.0).await;

    obs.until("manual recovery", |s| !s.manual_recovery.is_empty())
        .await;
    let wind = obs.emergency(EmergencyKind::HighWind).await;
    assert_eq!(wind.state, EmergencyState::ManualRecoveryRequired);
    let park_attempts = obs
        .sim
        .commands()
        .iter()
        .filter(|c| **c == EffectorCommand::Park)
        .count();
    assert_eq!(park_attempts, 3);

    obs.supervisor
        .clear_veto("manual_recovery:high_wind", "alice")
        .await
        .unwrap();
    assert!(obs.supervisor.status().manual_recovery.is_empty());
}

#[tokio::test]
async fn stale_sensor_triggers_sensor_failure() {
    let obs = Observatory::start(SimObservatory::new(), timing(), Duration::from_secs(1));
    obs.calm().await;
    obs.supervisor
        .push_snapshot(
            SafetyCondition::new(
                "wind_speed",
                ConditionValue::Numeric(5.0),
                "test-adapter",
                Duration::from_millis(100),
            ),
        )
        .await
        .unwrap();

    let status = obs
        .until("sensor failure", |s| {
            s.current_emergency
                .as_ref()
                .is_some_and(|e| e.kind == EmergencyKind::SensorFailure)
        })
        .await;
    assert_eq!(status.active_tier, Some(VetoTier::Critical));
}

#[tokio::test]
async fn audit_trail_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.db");

    let obs = Observatory::with_audit(
        SimObservatory::new(),
        timing(),
        Duration::from_secs(1),
        AuditLog::open(&path).unwrap(),
    );
    obs.calm().await;
    obs.supervisor.estop("console").await.unwrap();
    obs.supervisor.resume("alice").await.unwrap();
    obs.supervisor.shutdown().await.unwrap();
    obs.task.await.unwrap();

    let audit = AuditLog::open(&path).unwrap();
    let tags: Vec<String> = audit.recent(50).unwrap().into_iter().map(|e| e.tag).collect();
    assert!(tags.contains(&"E-STOP".to_string()));
    assert!(tags.contains(&"estop".to_string()));
}
