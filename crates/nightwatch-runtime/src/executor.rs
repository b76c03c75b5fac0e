//! [`ObservatoryExecutor`] – runs gate-approved tools against the observatory.
//!
//! Dispatch follows each tool's [`ToolAction`], so a tool table may name its
//! tools freely. Hardware tools drive the [`Effector`] and wait for the
//! commanded state; session tools update the supervisor's session flags;
//! query tools read the latest status and readings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nightwatch_hal::Effector;
use nightwatch_middleware::ToolExecutor;
use nightwatch_types::{EffectorCommand, SafetyError, SlewTarget, ToolAction, ToolArgs, ToolSpec};
use tracing::info;

use crate::supervisor::SupervisorHandle;

pub struct ObservatoryExecutor {
    effector: Arc<dyn Effector>,
    supervisor: SupervisorHandle,
    /// How long a hardware tool waits for its commanded state.
    confirm_within: Duration,
}

impl ObservatoryExecutor {
    pub fn new(
        effector: Arc<dyn Effector>,
        supervisor: SupervisorHandle,
        confirm_within: Duration,
    ) -> Self {
        Self {
            effector,
            supervisor,
            confirm_within,
        }
    }

    async fn hardware(
        &self,
        tool: &ToolSpec,
        command: EffectorCommand,
    ) -> Result<String, SafetyError> {
        self.effector.command(command).await?;
        if !self.effector.confirm(command, self.confirm_within).await? {
            return Err(SafetyError::HardwareFault {
                component: self.effector.id().to_string(),
                details: format!(
                    "{command} not confirmed within {} s",
                    self.confirm_within.as_secs()
                ),
            });
        }
        self.supervisor.record_command(command).await?;
        info!(tool = %tool.name, %command, "tool executed");
        Ok(format!("{command} complete: {}", self.effector.state()))
    }

    async fn slew(&self, tool: &ToolSpec, target: SlewTarget) -> Result<String, SafetyError> {
        if !self.effector.slew_to(target, self.confirm_within).await? {
            return Err(SafetyError::HardwareFault {
                component: self.effector.id().to_string(),
                details: format!(
                    "slew to {target} not complete within {} s",
                    self.confirm_within.as_secs()
                ),
            });
        }
        info!(tool = %tool.name, %target, "slew complete");
        Ok(format!("Slew to {target} complete: {}", self.effector.state()))
    }

    async fn imaging(&self, active: bool) -> Result<String, SafetyError> {
        let mut session = self.supervisor.status().session;
        session.imaging_active = active;
        self.supervisor.set_session(session).await?;
        Ok(format!("Imaging {}.", if active { "started" } else { "stopped" }))
    }

    fn report_status(&self) -> String {
        let status = self.supervisor.status();
        let emergency = status
            .current_emergency
            .as_ref()
            .map_or_else(|| "none".to_string(), |e| format!("{} ({})", e.kind, e.state));
        format!(
            "Observatory: {}. Emergency: {emergency}. {}",
            self.effector.state(),
            status.veto_summary()
        )
    }

    async fn report_weather(&self) -> Result<String, SafetyError> {
        let now = Utc::now();
        let readings = self.supervisor.readings().await?;
        if readings.is_empty() {
            return Ok("No sensor readings yet.".to_string());
        }
        let parts: Vec<String> = readings
            .iter()
            .map(|r| {
                let stale = if r.is_stale(now) { " (stale)" } else { "" };
                format!("{} {}{stale}", r.name, r.value)
            })
            .collect();
        Ok(parts.join(", "))
    }
}

#[async_trait]
impl ToolExecutor for ObservatoryExecutor {
    async fn execute(&self, tool: &ToolSpec, args: &ToolArgs) -> Result<String, SafetyError> {
        match tool.action {
            // The gate routes abort tools to the supervisor; issuing the
            // command here is only reached by direct callers.
            ToolAction::Effector(command) if tool.is_abort() => {
                self.supervisor.operator_abort(command).await?;
                Ok(format!("{command} issued"))
            }
            ToolAction::Effector(command) => self.hardware(tool, command).await,
            ToolAction::SlewTo => match args.target {
                Some(target) => self.slew(tool, target).await,
                None => Err(SafetyError::InterlockBlocked {
                    tool: tool.name.clone(),
                    reason: "a slew target is required".to_string(),
                }),
            },
            ToolAction::StartImaging => self.imaging(true).await,
            ToolAction::StopImaging => self.imaging(false).await,
            ToolAction::ReportStatus => Ok(self.report_status()),
            ToolAction::ReportWeather => self.report_weather().await,
        }
    }
}
