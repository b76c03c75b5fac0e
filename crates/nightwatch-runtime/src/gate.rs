//! [`ConfirmationGate`] – the single entry point for every tool invocation.
//!
//! The gate looks the tool up in a closed [`ToolRegistry`], scores it with
//! [`GatePolicy`] against the supervisor's latest [`SafetyStatus`], runs the
//! operator dialogue the effective tier calls for, re-checks the safety
//! state, and only then hands the tool to the [`ToolExecutor`].
//!
//! | Effective tier | Behaviour |
//! |---|---|
//! | NONE | Execute. |
//! | ANNOUNCE | Announce, execute without waiting. |
//! | CONFIRM | One yes/no round. |
//! | DOUBLE | Yes/no, then the operation-specific phrase. |
//!
//! A pending confirmation is abandoned when an emergency starts responding
//! or an E-STOP latches (`PreemptedByEmergency`), and when an abort-class
//! tool runs (`ConfirmationCancelled`). Every outcome is audited through the
//! supervisor; no confirmation state outlives the call.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use nightwatch_kernel::{GateDecision, GatePolicy, ToolRegistry};
use nightwatch_middleware::{ResponseChannel, ToolExecutor};
use nightwatch_types::{
    ConfirmationOutcome, ConfirmationRequest, ConfirmationTier, ExecutionDecision, ReplyClass,
    SafetyError, SafetyEvent, SafetyStatus, SessionContext, ToolArgs, ToolSpec,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::supervisor::SupervisorHandle;

/// How a confirmation dialogue ended without approval.
enum Refusal {
    Preempted(SafetyError),
    Cancelled(SafetyError),
    TimedOut(SafetyError),
    Failed(SafetyError),
}

impl Refusal {
    fn outcome(&self) -> ConfirmationOutcome {
        match self {
            Refusal::Preempted(_) => ConfirmationOutcome::Preempted,
            Refusal::Cancelled(_) => ConfirmationOutcome::Cancelled,
            Refusal::TimedOut(_) => ConfirmationOutcome::TimedOut,
            Refusal::Failed(_) => ConfirmationOutcome::Rejected,
        }
    }

    fn into_error(self) -> SafetyError {
        match self {
            Refusal::Preempted(e)
            | Refusal::Cancelled(e)
            | Refusal::TimedOut(e)
            | Refusal::Failed(e) => e,
        }
    }
}

/// Intercepts every tool invocation.
pub struct ConfirmationGate {
    registry: RwLock<Arc<ToolRegistry>>,
    policy: GatePolicy,
    supervisor: SupervisorHandle,
    channel: Arc<dyn ResponseChannel>,
    executor: Arc<dyn ToolExecutor>,
    /// Bumped by every abort-class invocation; pending dialogues watch it.
    aborts: watch::Sender<u64>,
}

impl ConfirmationGate {
    pub fn new(
        registry: ToolRegistry,
        policy: GatePolicy,
        supervisor: SupervisorHandle,
        channel: Arc<dyn ResponseChannel>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            registry: RwLock::new(Arc::new(registry)),
            policy,
            supervisor,
            channel,
            executor,
            aborts: watch::channel(0).0,
        }
    }

    /// Swap in a new tool registry. Invocations already in flight keep the
    /// registry they started with.
    pub fn reload(&self, registry: ToolRegistry) {
        let count = registry.len();
        *self.registry.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(registry);
        info!(count, "tool registry reloaded");
    }

    /// Current registry snapshot.
    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Gate, confirm and execute `tool_name` with no arguments.
    ///
    /// See [`Self::request_invocation_with`].
    ///
    /// # Errors
    ///
    /// As [`Self::request_invocation_with`].
    pub async fn request_invocation(
        &self,
        tool_name: &str,
        session: &SessionContext,
    ) -> Result<ExecutionDecision, SafetyError> {
        self.request_invocation_with(tool_name, &ToolArgs::default(), session)
            .await
    }

    /// Gate, confirm and execute `tool_name`.
    ///
    /// # Errors
    ///
    /// - [`SafetyError::UnknownTool`] for names outside the registry.
    /// - [`SafetyError::ManualRecoveryRequired`], [`SafetyError::SafetyOverrideActive`]
    ///   or [`SafetyError::VetoActive`] when the safety state forbids the tool.
    /// - [`SafetyError::InterlockBlocked`] when `args` or the plant state fail
    ///   the tool's interlock.
    /// - [`SafetyError::ConfirmationCancelled`], [`SafetyError::ConfirmationTimeout`]
    ///   or [`SafetyError::PreemptedByEmergency`] when the dialogue ends
    ///   without approval.
    /// - Whatever the executor returns.
    #[instrument(skip(self, args, session), fields(tool = tool_name))]
    pub async fn request_invocation_with(
        &self,
        tool_name: &str,
        args: &ToolArgs,
        session: &SessionContext,
    ) -> Result<ExecutionDecision, SafetyError> {
        let registry = self.registry();
        let tool = match registry.get(tool_name) {
            Ok(tool) => tool.clone(),
            Err(err) => {
                warn!(tool = tool_name, "unknown tool rejected");
                self.audit(
                    tool_name,
                    ConfirmationTier::None,
                    ConfirmationTier::None,
                    ConfirmationOutcome::Rejected,
                    Some(err.to_string()),
                )
                .await;
                return Err(err);
            }
        };

        let status = self.supervisor.status();
        let decision = self.policy.assess_with(&tool, args, session, &status);
        let (base, effective, veto_note) = match decision {
            GateDecision::Bypass => return self.bypass(&tool).await,
            GateDecision::Reject(err) => {
                info!(tool = %tool.name, %err, "invocation rejected");
                self.reject(&tool, tool.base_tier, tool.base_tier, err.clone()).await;
                return Err(err);
            }
            GateDecision::Proceed {
                base,
                effective,
                veto_note,
            } => (base, effective, veto_note),
        };
        debug!(tool = %tool.name, %base, %effective, "invocation scored");

        let outcome = match effective {
            ConfirmationTier::None => ConfirmationOutcome::Executed,
            ConfirmationTier::Announce => {
                let text = tool.announcement_text();
                self.channel.announce(&text).await;
                let _ = self.supervisor.record(SafetyEvent::Announcement { text }).await;
                ConfirmationOutcome::Announced
            }
            ConfirmationTier::Confirm | ConfirmationTier::Double => {
                let rounds = if effective == ConfirmationTier::Double { 2 } else { 1 };
                if let Err(refusal) = self
                    .dialogue(&tool, base, effective, rounds, veto_note.as_deref(), &status)
                    .await
                {
                    let outcome = refusal.outcome();
                    let err = refusal.into_error();
                    info!(tool = %tool.name, %outcome, "confirmation refused");
                    self.audit(&tool.name, base, effective, outcome, Some(err.to_string()))
                        .await;
                    return Err(err);
                }

                // The safety state may have moved while the operator was
                // answering.
                let latest = self.supervisor.status();
                if latest.emergency_epoch != status.emergency_epoch {
                    let err = preempted(&tool, &latest);
                    self.audit(
                        &tool.name,
                        base,
                        effective,
                        ConfirmationOutcome::Preempted,
                        Some(err.to_string()),
                    )
                    .await;
                    return Err(err);
                }
                if let GateDecision::Reject(err) =
                    self.policy.assess_with(&tool, args, session, &latest)
                {
                    self.reject(&tool, base, effective, err.clone()).await;
                    return Err(err);
                }
                ConfirmationOutcome::Confirmed
            }
        };

        self.execute(&tool, args, base, effective, outcome).await
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    /// Abort-class tools: cancel pending dialogues, route to the supervisor.
    async fn bypass(&self, tool: &ToolSpec) -> Result<ExecutionDecision, SafetyError> {
        self.aborts.send_modify(|n| *n += 1);
        let result = if tool.is_estop() {
            self.supervisor.estop(&format!("tool:{}", tool.name)).await
        } else if let Some(command) = tool.effector() {
            self.supervisor.operator_abort(command).await
        } else {
            Err(SafetyError::UnknownTool(tool.name.clone()))
        };
        let tier = ConfirmationTier::None;
        match result {
            Ok(()) => {
                warn!(tool = %tool.name, "abort tool executed");
                self.audit(&tool.name, tier, tier, ConfirmationOutcome::Bypassed, None)
                    .await;
                Ok(ExecutionDecision {
                    tool: tool.name.clone(),
                    base_tier: tier,
                    effective_tier: tier,
                    outcome: ConfirmationOutcome::Bypassed,
                    output: format!("{} executed", tool.name.replace('_', " ")),
                })
            }
            Err(err) => {
                self.audit(
                    &tool.name,
                    tier,
                    tier,
                    ConfirmationOutcome::Bypassed,
                    Some(format!("failed: {err}")),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        tool: &ToolSpec,
        args: &ToolArgs,
        base: ConfirmationTier,
        effective: ConfirmationTier,
        outcome: ConfirmationOutcome,
    ) -> Result<ExecutionDecision, SafetyError> {
        match self.executor.execute(tool, args).await {
            Ok(output) => {
                info!(tool = %tool.name, %outcome, "tool executed");
                self.audit(&tool.name, base, effective, outcome, None).await;
                Ok(ExecutionDecision {
                    tool: tool.name.clone(),
                    base_tier: base,
                    effective_tier: effective,
                    outcome,
                    output,
                })
            }
            Err(err) => {
                warn!(tool = %tool.name, %err, "tool execution failed");
                self.audit(&tool.name, base, effective, outcome, Some(format!("failed: {err}")))
                    .await;
                Err(err)
            }
        }
    }

    async fn reject(
        &self,
        tool: &ToolSpec,
        base: ConfirmationTier,
        effective: ConfirmationTier,
        err: SafetyError,
    ) {
        self.audit(
            &tool.name,
            base,
            effective,
            ConfirmationOutcome::Rejected,
            Some(err.to_string()),
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Dialogue
    // -----------------------------------------------------------------------

    async fn dialogue(
        &self,
        tool: &ToolSpec,
        base: ConfirmationTier,
        effective: ConfirmationTier,
        rounds: u8,
        veto_note: Option<&str>,
        status: &SafetyStatus,
    ) -> Result<(), Refusal> {
        let mut statuses = self.supervisor.subscribe_status();
        let mut aborts = self.aborts.subscribe();
        for round in 1..=rounds {
            let request = ConfirmationRequest {
                tool_name: tool.name.clone(),
                base_tier: base,
                effective_tier: effective,
                prompt: self.policy.prompt(tool, round, if round == 1 { veto_note } else { None }),
                valid_responses: self.policy.valid_responses(tool, round),
                issued_at: Utc::now(),
                timeout: self.policy.confirmation_timeout,
            };
            self.round(tool, round, &request, status.emergency_epoch, &mut statuses, &mut aborts)
                .await?;
        }
        Ok(())
    }

    /// Ask until the round is satisfied, refused or out of time.
    /// Unrecognized replies re-prompt within the same deadline.
    async fn round(
        &self,
        tool: &ToolSpec,
        round: u8,
        request: &ConfirmationRequest,
        epoch: u64,
        statuses: &mut watch::Receiver<SafetyStatus>,
        aborts: &mut watch::Receiver<u64>,
    ) -> Result<(), Refusal> {
        let deadline = Instant::now() + request.timeout;
        let phrase = tool.phrase();
        loop {
            let reply = tokio::select! {
                biased;
                status = emergency_started(statuses, epoch) => {
                    return Err(Refusal::Preempted(preempted(tool, &status)));
                }
                _ = aborts.changed() => {
                    return Err(Refusal::Cancelled(SafetyError::ConfirmationCancelled {
                        tool: tool.name.clone(),
                        reason: "abort command issued".to_string(),
                    }));
                }
                reply = tokio::time::timeout_at(
                    deadline,
                    self.channel.ask(&request.prompt, &request.valid_responses),
                ) => match reply {
                    Err(_) => {
                        return Err(Refusal::TimedOut(SafetyError::ConfirmationTimeout {
                            tool: tool.name.clone(),
                        }));
                    }
                    Ok(Err(err)) => return Err(Refusal::Failed(err)),
                    Ok(Ok(reply)) => reply,
                },
            };

            if reply.class == ReplyClass::Cancel {
                return Err(Refusal::Cancelled(SafetyError::ConfirmationCancelled {
                    tool: tool.name.clone(),
                    reason: format!("operator said '{}'", reply.text),
                }));
            }
            let accepted = if round >= 2 {
                reply.matches_phrase(&phrase)
            } else {
                reply.class == ReplyClass::Confirm
            };
            if accepted {
                debug!(tool = %tool.name, round, "confirmation round accepted");
                return Ok(());
            }
            debug!(
                tool = %tool.name,
                round,
                reply = %reply.text,
                "reply did not satisfy the round"
            );
        }
    }

    async fn audit(
        &self,
        tool: &str,
        base_tier: ConfirmationTier,
        effective_tier: ConfirmationTier,
        outcome: ConfirmationOutcome,
        detail: Option<String>,
    ) {
        let event = SafetyEvent::ConfirmationResolved {
            tool: tool.to_string(),
            base_tier,
            effective_tier,
            outcome,
            detail,
        };
        if let Err(err) = self.supervisor.record(event).await {
            warn!(%err, tool, "confirmation outcome not audited");
        }
    }
}

/// Resolves with the latest status once the emergency epoch moves past
/// `epoch`. Never resolves if the supervisor has stopped.
async fn emergency_started(
    statuses: &mut watch::Receiver<SafetyStatus>,
    epoch: u64,
) -> SafetyStatus {
    loop {
        {
            let status = statuses.borrow_and_update();
            if status.emergency_epoch != epoch {
                return status.clone();
            }
        }
        if statuses.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

fn preempted(tool: &ToolSpec, status: &SafetyStatus) -> SafetyError {
    SafetyError::PreemptedByEmergency {
        tool: tool.name.clone(),
        emergency: status
            .current_emergency
            .as_ref()
            .map_or_else(|| "E-STOP".to_string(), |e| e.kind.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use nightwatch_hal::SimObservatory;
    use nightwatch_kernel::{ResponseTiming, SafetyCore, ThresholdSet, standard_tools};
    use nightwatch_memory::AuditLog;
    use nightwatch_middleware::{EventBus, ScriptedChannel};

    use crate::supervisor::{Supervisor, SupervisorConfig};

    /// Executor that records what it ran.
    #[derive(Default)]
    struct RecordingExecutor {
        ran: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolExecutor for RecordingExecutor {
        async fn execute(&self, tool: &ToolSpec, _args: &ToolArgs) -> Result<String, SafetyError> {
            self.ran.lock().unwrap().push(tool.name.clone());
            Ok(format!("{} ok", tool.name))
        }
    }

    struct Fixture {
        gate: Arc<ConfirmationGate>,
        channel: Arc<ScriptedChannel>,
        executor: Arc<RecordingExecutor>,
        supervisor: SupervisorHandle,
    }

    fn fixture(replies: &[&str], timeout: Duration) -> Fixture {
        let (supervisor, _task) = Supervisor::spawn(
            SafetyCore::new(ThresholdSet::default(), ResponseTiming::default()),
            AuditLog::open_in_memory().unwrap(),
            EventBus::default(),
            Arc::new(SimObservatory::new()),
            SupervisorConfig::default(),
        );
        let channel = Arc::new(ScriptedChannel::new(replies.iter().copied()));
        let executor = Arc::new(RecordingExecutor::default());
        let gate = Arc::new(ConfirmationGate::new(
            ToolRegistry::new(standard_tools()).unwrap(),
            GatePolicy {
                confirmation_timeout: timeout,
                ..GatePolicy::default()
            },
            supervisor.clone(),
            channel.clone(),
            executor.clone(),
        ));
        Fixture {
            gate,
            channel,
            executor,
            supervisor,
        }
    }

    fn idle() -> SessionContext {
        SessionContext::default()
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let f = fixture(&[], Duration::from_secs(1));
        let err = f.gate.request_invocation("launch_rocket", &idle()).await.unwrap_err();
        assert_eq!(err, SafetyError::UnknownTool("launch_rocket".into()));
        assert!(f.executor.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_runs_without_dialogue() {
        let f = fixture(&[], Duration::from_secs(1));
        let decision = f.gate.request_invocation("get_status", &idle()).await.unwrap();
        assert_eq!(decision.outcome, ConfirmationOutcome::Executed);
        assert!(f.channel.prompts().is_empty());
    }

    #[tokio::test]
    async fn announce_tier_announces_then_executes() {
        let f = fixture(&[], Duration::from_secs(1));
        let decision = f.gate.request_invocation("start_imaging", &idle()).await.unwrap();
        assert_eq!(decision.outcome, ConfirmationOutcome::Announced);
        assert_eq!(f.channel.announcements().len(), 1);
        assert_eq!(*f.executor.ran.lock().unwrap(), vec!["start_imaging".to_string()]);
    }

    #[tokio::test]
    async fn confirm_tier_accepts_yes() {
        let f = fixture(&["yes"], Duration::from_secs(1));
        let decision = f.gate.request_invocation("open_enclosure", &idle()).await.unwrap();
        assert_eq!(decision.outcome, ConfirmationOutcome::Confirmed);
        assert_eq!(f.channel.prompts(), vec!["Confirm open enclosure? (yes/no)".to_string()]);
    }

    #[tokio::test]
    async fn cancel_reply_cancels() {
        let f = fixture(&["no"], Duration::from_secs(1));
        let err = f.gate.request_invocation("open_enclosure", &idle()).await.unwrap_err();
        assert!(matches!(err, SafetyError::ConfirmationCancelled { .. }));
        assert!(f.executor.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn silence_times_out() {
        let f = fixture(&[], Duration::from_millis(50));
        let err = f.gate.request_invocation("close_enclosure", &idle()).await.unwrap_err();
        assert_eq!(
            err,
            SafetyError::ConfirmationTimeout {
                tool: "close_enclosure".into()
            }
        );
    }

    #[tokio::test]
    async fn unrecognized_reply_reprompts() {
        let f = fixture(&["maybe", "yes"], Duration::from_secs(1));
        f.gate.request_invocation("open_enclosure", &idle()).await.unwrap();
        assert_eq!(f.channel.prompts().len(), 2);
    }

    #[tokio::test]
    async fn double_needs_the_phrase() {
        let imaging = SessionContext {
            imaging_active: true,
            ..Default::default()
        };
        let f = fixture(&["yes", "Confirm park telescope."], Duration::from_secs(1));
        let decision = f.gate.request_invocation("park_telescope", &imaging).await.unwrap();
        assert_eq!(decision.effective_tier, ConfirmationTier::Double);
        assert_eq!(
            f.channel.prompts()[1],
            "To proceed, say 'confirm park telescope'."
        );
    }

    #[tokio::test]
    async fn estop_tool_bypasses_and_cancels_pending_confirmation() {
        let f = fixture(&[], Duration::from_secs(5));
        let pending = {
            let gate = Arc::clone(&f.gate);
            tokio::spawn(async move { gate.request_invocation("open_enclosure", &idle()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let decision = f.gate.request_invocation("emergency_stop", &idle()).await.unwrap();
        assert_eq!(decision.outcome, ConfirmationOutcome::Bypassed);
        assert!(f.supervisor.status().estop_latched);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SafetyError::ConfirmationCancelled { .. } | SafetyError::PreemptedByEmergency { .. }
        ));
    }

    #[tokio::test]
    async fn reload_swaps_the_registry() {
        let f = fixture(&[], Duration::from_secs(1));
        let only_status: Vec<ToolSpec> = standard_tools()
            .into_iter()
            .filter(|t| t.name == "get_status")
            .collect();
        f.gate.reload(ToolRegistry::new(only_status).unwrap());
        assert_eq!(f.gate.registry().len(), 1);
        assert!(matches!(
            f.gate.request_invocation("get_weather", &idle()).await,
            Err(SafetyError::UnknownTool(_))
        ));
    }

    #[tokio::test]
    async fn outcomes_are_audited() {
        let f = fixture(&["no"], Duration::from_secs(1));
        let _ = f.gate.request_invocation("open_enclosure", &idle()).await;
        let _ = f.gate.request_invocation("get_status", &idle()).await;
        let entries = f.supervisor.recent_audit(10).await.unwrap();
        let outcomes: Vec<_> = entries
            .iter()
            .filter_map(|e| match e.payload().ok()? {
                SafetyEvent::ConfirmationResolved { outcome, .. } => Some(outcome),
                _ => None,
            })
            .collect();
        assert_eq!(
            outcomes,
            vec![ConfirmationOutcome::Cancelled, ConfirmationOutcome::Executed]
        );
    }

    #[tokio::test]
    async fn low_slew_is_refused_before_any_dialogue() {
        let f = fixture(&["yes"], Duration::from_secs(1));
        let err = f
            .gate
            .request_invocation_with("slew_to", &ToolArgs::slew(3.0, 90.0), &idle())
            .await
            .unwrap_err();
        assert!(matches!(err, SafetyError::InterlockBlocked { .. }));
        assert!(f.channel.prompts().is_empty());
        assert!(f.executor.ran.lock().unwrap().is_empty());

        let decision = f
            .gate
            .request_invocation_with("slew_to", &ToolArgs::slew(45.0, 90.0), &idle())
            .await
            .unwrap();
        assert_eq!(decision.outcome, ConfirmationOutcome::Announced);
        assert_eq!(*f.executor.ran.lock().unwrap(), vec!["slew_to".to_string()]);
    }
}
