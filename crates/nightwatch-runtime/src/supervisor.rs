//! [`Supervisor`] – the single serialized loop that owns all safety state.
//!
//! Sensor adapters, the confirmation gate and the operator console never
//! touch [`SafetyCore`] directly. They send messages through a
//! [`SupervisorHandle`]; the loop applies them one at a time, carries out the
//! resulting [`Effect`]s, audits and broadcasts every event, and publishes a
//! fresh [`SafetyStatus`] on a `watch` channel after each message.
//!
//! ```text
//!  adapters ──┐                          ┌─▶ EventBus
//!  gate ──────┼─▶ mpsc ─▶ Supervisor ────┼─▶ AuditLog
//!  console ───┘      ▲        │          └─▶ watch<SafetyStatus>
//!                    │        ▼
//!                    └── ResponseRunner (spawned per response)
//! ```
//!
//! A `tokio::time::interval` drives the periodic sweep that ages readings
//! into UNKNOWN and expires holdoffs. E-STOP is handled inline: the running
//! response is aborted and `disable_motors` is awaited under the E-STOP
//! bound before the loop takes the next message.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use nightwatch_hal::{Effector, EnclosureState};
use nightwatch_kernel::{Effect, ResponsePlan, SafetyCore, ThresholdSet};
use nightwatch_memory::{AuditEntry, AuditLog};
use nightwatch_middleware::EventBus;
use nightwatch_types::{
    AlertLevel, EffectorCommand, Emergency, Event, SafetyCondition, SafetyError, SafetyEvent,
    SafetyStatus, SessionContext, VetoTier,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::response::ResponseRunner;

/// Source tag on every event the supervisor publishes.
pub const SUPERVISOR_SOURCE: &str = "nightwatch-runtime::supervisor";

/// Loop tunables.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Period of the staleness sweep and holdoff tick.
    pub sweep_interval: Duration,
    /// Bounded capacity of the command queue.
    pub queue_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            queue_capacity: 256,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, SafetyError>>;

/// Messages accepted by the supervisor loop.
pub(crate) enum Command {
    Snapshot(SafetyCondition),
    EStop {
        source: String,
        reply: Reply<()>,
    },
    Resume {
        operator: String,
        reply: Reply<()>,
    },
    ClearVeto {
        reason: String,
        operator: String,
        reply: Reply<()>,
    },
    OverrideVeto {
        reason: String,
        operator: String,
        justification: String,
        reply: Reply<()>,
    },
    UpdateThresholds {
        thresholds: ThresholdSet,
        operator: String,
        reply: Reply<()>,
    },
    SetSession(SessionContext),
    RecordCommand(EffectorCommand),
    OperatorAbort {
        command: EffectorCommand,
        reply: Reply<()>,
    },
    /// An event raised outside the core (gate outcomes, announcements).
    Record(SafetyEvent),
    ResponseProgress {
        run_id: Uuid,
        event: nightwatch_types::ResponseEvent,
    },
    ResponseFinished {
        run_id: Uuid,
        result: Result<(), SafetyError>,
    },
    RecentAudit {
        limit: usize,
        reply: Reply<Vec<AuditEntry>>,
    },
    Emergencies {
        reply: Reply<Vec<Emergency>>,
    },
    Readings {
        reply: Reply<Vec<SafetyCondition>>,
    },
    Thresholds {
        reply: Reply<ThresholdSet>,
    },
    Shutdown,
}

// ────────────────────────────────────────────────────────────────────────────
// Handle
// ────────────────────────────────────────────────────────────────────────────

/// Cloneable front door to a running [`Supervisor`].
///
/// Status queries read the latest `watch` snapshot and never wait on the
/// loop. Everything else is a message; calls that can fail wait for the
/// loop's answer.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SafetyStatus>,
}

impl SupervisorHandle {
    /// Feed one sensor snapshot.
    pub async fn push_snapshot(&self, reading: SafetyCondition) -> Result<(), SafetyError> {
        self.send(Command::Snapshot(reading)).await
    }

    /// Trigger an E-STOP. Returns once motors were commanded off (or the
    /// E-STOP bound passed) and the latch is published.
    pub async fn estop(&self, source: &str) -> Result<(), SafetyError> {
        let source = source.to_string();
        self.request(|reply| Command::EStop { source, reply }).await?
    }

    /// Release the E-STOP latch.
    ///
    /// # Errors
    ///
    /// [`SafetyError::UnknownVeto`] when no E-STOP is latched.
    pub async fn resume(&self, operator: &str) -> Result<(), SafetyError> {
        let operator = operator.to_string();
        self.request(|reply| Command::Resume { operator, reply }).await?
    }

    /// Operator clear of a veto whose holdoff has elapsed.
    ///
    /// # Errors
    ///
    /// [`SafetyError::HoldoffNotElapsed`], [`SafetyError::UnknownVeto`] or
    /// [`SafetyError::EStopLatched`].
    pub async fn clear_veto(&self, reason: &str, operator: &str) -> Result<(), SafetyError> {
        let (reason, operator) = (reason.to_string(), operator.to_string());
        self.request(|reply| Command::ClearVeto {
            reason,
            operator,
            reply,
        })
        .await?
    }

    /// Administrative override; logged separately from ordinary clears.
    pub async fn override_veto(
        &self,
        reason: &str,
        operator: &str,
        justification: &str,
    ) -> Result<(), SafetyError> {
        let (reason, operator, justification) =
            (reason.to_string(), operator.to_string(), justification.to_string());
        self.request(|reply| Command::OverrideVeto {
            reason,
            operator,
            justification,
            reply,
        })
        .await?
    }

    /// Replace the threshold set; rules are re-evaluated immediately.
    pub async fn update_thresholds(
        &self,
        thresholds: ThresholdSet,
        operator: &str,
    ) -> Result<(), SafetyError> {
        let operator = operator.to_string();
        self.request(|reply| Command::UpdateThresholds {
            thresholds,
            operator,
            reply,
        })
        .await?
    }

    pub async fn set_session(&self, session: SessionContext) -> Result<(), SafetyError> {
        self.send(Command::SetSession(session)).await
    }

    /// Report an effector command that completed outside a response run.
    pub async fn record_command(&self, command: EffectorCommand) -> Result<(), SafetyError> {
        self.send(Command::RecordCommand(command)).await
    }

    /// Abort-class operator command. Interrupts any running response.
    pub async fn operator_abort(&self, command: EffectorCommand) -> Result<(), SafetyError> {
        self.request(|reply| Command::OperatorAbort { command, reply })
            .await?
    }

    /// Audit and broadcast an event raised outside the core.
    pub async fn record(&self, event: SafetyEvent) -> Result<(), SafetyError> {
        self.send(Command::Record(event)).await
    }

    /// The newest `limit` audit entries, oldest first.
    pub async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, SafetyError> {
        self.request(|reply| Command::RecentAudit { limit, reply })
            .await?
    }

    /// Every emergency the controller tracks, live ones first.
    pub async fn emergencies(&self) -> Result<Vec<Emergency>, SafetyError> {
        self.request(|reply| Command::Emergencies { reply }).await?
    }

    /// Latest stored reading per condition.
    pub async fn readings(&self) -> Result<Vec<SafetyCondition>, SafetyError> {
        self.request(|reply| Command::Readings { reply }).await?
    }

    pub async fn thresholds(&self) -> Result<ThresholdSet, SafetyError> {
        self.request(|reply| Command::Thresholds { reply }).await?
    }

    /// Stop the loop. Running responses are aborted.
    pub async fn shutdown(&self) -> Result<(), SafetyError> {
        self.send(Command::Shutdown).await
    }

    // -----------------------------------------------------------------------
    // Snapshot reads
    // -----------------------------------------------------------------------

    pub fn status(&self) -> SafetyStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SafetyStatus> {
        self.status.clone()
    }

    pub fn active_tier(&self) -> Option<VetoTier> {
        self.status.borrow().active_tier
    }

    pub fn reasons(&self) -> Vec<String> {
        self.status.borrow().reasons()
    }

    pub fn current_emergency(&self) -> Option<Emergency> {
        self.status.borrow().current_emergency.clone()
    }

    // -----------------------------------------------------------------------

    async fn send(&self, command: Command) -> Result<(), SafetyError> {
        self.commands.send(command).await.map_err(|_| stopped())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<Result<T, SafetyError>, SafetyError> {
        let (reply, answer) = oneshot::channel();
        self.send(make(reply)).await?;
        answer.await.map_err(|_| stopped())
    }
}

fn stopped() -> SafetyError {
    SafetyError::Channel("supervisor is not running".to_string())
}

// ────────────────────────────────────────────────────────────────────────────
// Supervisor
// ────────────────────────────────────────────────────────────────────────────

/// Owner of [`SafetyCore`] and the [`AuditLog`]. Construct with
/// [`Supervisor::spawn`].
pub struct Supervisor {
    core: SafetyCore,
    audit: AuditLog,
    bus: EventBus,
    effector: Arc<dyn Effector>,
    config: SupervisorConfig,
    commands: mpsc::Receiver<Command>,
    /// Handed to response runners. Weak so the loop alone does not keep the
    /// queue open.
    reports: mpsc::WeakSender<Command>,
    status: watch::Sender<SafetyStatus>,
    runs: HashMap<Uuid, AbortHandle>,
}

impl Supervisor {
    /// Start the loop on the current Tokio runtime.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use nightwatch_hal::SimObservatory;
    /// use nightwatch_kernel::{ResponseTiming, SafetyCore, ThresholdSet};
    /// use nightwatch_memory::AuditLog;
    /// use nightwatch_middleware::EventBus;
    /// use nightwatch_runtime::{Supervisor, SupervisorConfig};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let core = SafetyCore::new(ThresholdSet::default(), ResponseTiming::default());
    /// let (handle, task) = Supervisor::spawn(
    ///     core,
    ///     AuditLog::open_in_memory()?,
    ///     EventBus::default(),
    ///     Arc::new(SimObservatory::new()),
    ///     SupervisorConfig::default(),
    /// );
    /// handle.estop("console").await?;
    /// assert!(handle.status().estop_latched);
    /// handle.shutdown().await?;
    /// task.await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn spawn(
        core: SafetyCore,
        audit: AuditLog,
        bus: EventBus,
        effector: Arc<dyn Effector>,
        config: SupervisorConfig,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(observed_status(&core, effector.as_ref()));
        let supervisor = Supervisor {
            core,
            audit,
            bus,
            effector,
            config,
            commands: rx,
            reports: tx.downgrade(),
            status: status_tx,
            runs: HashMap::new(),
        };
        let task = tokio::spawn(supervisor.run());
        let handle = SupervisorHandle {
            commands: tx,
            status: status_rx,
        };
        (handle, task)
    }

    async fn run(mut self) {
        // First sweep one period after start so adapters can report before
        // missing readings count as UNKNOWN.
        let period = self.config.sweep_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            sweep_ms = self.config.sweep_interval.as_millis() as u64,
            effector = self.effector.id(),
            "supervisor started"
        );

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle(command).await,
                },
                _ = ticker.tick() => {
                    let effects = self.core.sweep(Utc::now());
                    self.apply(effects).await;
                }
            }
            self.publish_status();
        }

        for (_, run) in self.runs.drain() {
            run.abort();
        }
        info!("supervisor stopped");
    }

    async fn handle(&mut self, command: Command) {
        let now = Utc::now();
        match command {
            Command::Snapshot(reading) => {
                debug!(condition = %reading.name, value = %reading.value, "snapshot");
                let effects = self.core.ingest(reading, now);
                self.apply(effects).await;
            }
            Command::EStop { source, reply } => {
                let effects = self.core.estop(&source, now);
                self.apply(effects).await;
                let _ = reply.send(Ok(()));
            }
            Command::Resume { operator, reply } => {
                let result = self.core.resume(&operator, now);
                self.settle(result, reply).await;
            }
            Command::ClearVeto {
                reason,
                operator,
                reply,
            } => {
                let result = self.core.clear_veto(&reason, &operator, now);
                if let Err(err) = &result {
                    info!(%reason, %operator, %err, "veto clear rejected");
                }
                self.settle(result, reply).await;
            }
            Command::OverrideVeto {
                reason,
                operator,
                justification,
                reply,
            } => {
                let result = self.core.override_veto(&reason, &operator, &justification, now);
                if result.is_ok() {
                    warn!(%reason, %operator, %justification, "veto overridden");
                }
                self.settle(result, reply).await;
            }
            Command::UpdateThresholds {
                thresholds,
                operator,
                reply,
            } => {
                let effects = self.core.update_thresholds(thresholds, &operator, now);
                self.apply(effects).await;
                let _ = reply.send(Ok(()));
            }
            Command::SetSession(session) => self.core.set_session(session),
            Command::RecordCommand(command) => self.core.record_command(command),
            Command::OperatorAbort { command, reply } => {
                let effects = self.core.operator_abort(command, now);
                self.apply(effects).await;
                let _ = reply.send(Ok(()));
            }
            Command::Record(event) => self.emit(event),
            Command::ResponseProgress { run_id, event } => {
                self.core.response_progress(run_id, event, now);
            }
            Command::ResponseFinished { run_id, result } => {
                self.runs.remove(&run_id);
                let effects = self.core.response_finished(run_id, result, now);
                self.apply(effects).await;
            }
            Command::RecentAudit { limit, reply } => {
                let _ = reply.send(self.audit.recent(limit).map_err(SafetyError::from));
            }
            Command::Emergencies { reply } => {
                let _ = reply.send(Ok(self.core.emergencies().iter().cloned().collect()));
            }
            Command::Readings { reply } => {
                let readings = self.core.evaluator().readings().into_iter().cloned().collect();
                let _ = reply.send(Ok(readings));
            }
            Command::Thresholds { reply } => {
                let _ = reply.send(Ok(self.core.evaluator().thresholds().clone()));
            }
            Command::Shutdown => {}
        }
    }

    /// Apply the effects of a fallible core call and answer the caller.
    async fn settle(&mut self, result: Result<Vec<Effect>, SafetyError>, reply: Reply<()>) {
        match result {
            Ok(effects) => {
                self.apply(effects).await;
                let _ = reply.send(Ok(()));
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Effects
    // -----------------------------------------------------------------------

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut pending: VecDeque<Effect> = effects.into();
        while let Some(effect) = pending.pop_front() {
            match effect {
                Effect::Emit(event) => self.emit(event),
                Effect::Start(plan) => self.start_run(plan),
                Effect::Cancel(run_id) => self.cancel_run(run_id),
                Effect::DisableMotors { emergency_id } => {
                    let result = self.disable_motors(emergency_id).await;
                    pending.extend(self.core.estop_outcome(result, Utc::now()));
                }
                Effect::Issue(command) => self.issue(command).await,
            }
        }
    }

    fn emit(&mut self, payload: SafetyEvent) {
        let event = Event::new(SUPERVISOR_SOURCE, payload);
        if let Err(err) = self.audit.record(&event) {
            error!(%err, event = %event.payload, "failed to audit event");
        }
        // Nobody listening is fine.
        let _ = self.bus.publish(event);
    }

    fn start_run(&mut self, plan: ResponsePlan) {
        let Some(reports) = self.reports.upgrade() else {
            return;
        };
        let run_id = plan.run_id;
        info!(kind = %plan.kind, %run_id, steps = plan.steps.len(), "starting response");
        let runner = ResponseRunner::new(plan, Arc::clone(&self.effector), reports);
        let task = tokio::spawn(runner.run());
        self.runs.insert(run_id, task.abort_handle());
    }

    fn cancel_run(&mut self, run_id: Uuid) {
        if let Some(run) = self.runs.remove(&run_id) {
            run.abort();
            info!(%run_id, "response run aborted");
        }
    }

    #[instrument(skip(self), fields(effector = self.effector.id()))]
    async fn disable_motors(&mut self, emergency_id: Uuid) -> Result<Duration, SafetyError> {
        let bound = self.core.emergencies().timing().estop;
        let started = Instant::now();
        let disable = self.effector.command(EffectorCommand::DisableMotors);
        match tokio::time::timeout(bound, disable).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                info!(elapsed_ms = elapsed.as_millis() as u64, "motors disabled");
                Ok(elapsed)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(SafetyError::HardwareFault {
                component: self.effector.id().to_string(),
                details: format!("disable_motors not acknowledged within {} ms", bound.as_millis()),
            }),
        }
    }

    async fn issue(&mut self, command: EffectorCommand) {
        let bound = self.core.emergencies().timing().abort_slew;
        let result = match tokio::time::timeout(bound, self.effector.command(command)).await {
            Ok(result) => result,
            Err(_) => Err(SafetyError::HardwareFault {
                component: self.effector.id().to_string(),
                details: format!("{command} not acknowledged within {} s", bound.as_secs()),
            }),
        };
        match result {
            Ok(()) => {
                info!(%command, "operator command issued");
                self.core.record_command(command);
            }
            Err(err) => {
                error!(%command, %err, "operator command failed");
                self.emit(SafetyEvent::Alert {
                    level: AlertLevel::Critical,
                    message: err.to_string(),
                });
            }
        }
    }

    fn publish_status(&self) {
        let status = observed_status(&self.core, self.effector.as_ref());
        self.status.send_if_modified(|current| {
            let changed = !same_state(current, &status);
            *current = status;
            changed
        });
    }
}

/// The core's status with the enclosure position read back from the
/// effector.
fn observed_status(core: &SafetyCore, effector: &dyn Effector) -> SafetyStatus {
    let mut status = core.status(Utc::now());
    status.plant.enclosure_open = Some(effector.state().enclosure == EnclosureState::Open);
    status
}

/// Status equality ignoring the timestamp, so idle sweeps do not wake
/// watchers.
fn same_state(a: &SafetyStatus, b: &SafetyStatus) -> bool {
    a.active_tier == b.active_tier
        && a.vetoes == b.vetoes
        && a.current_emergency == b.current_emergency
        && a.responding == b.responding
        && a.estop_latched == b.estop_latched
        && a.manual_recovery == b.manual_recovery
        && a.emergency_epoch == b.emergency_epoch
        && a.session == b.session
        && a.plant == b.plant
}
