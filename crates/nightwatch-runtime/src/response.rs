//! [`ResponseRunner`] – executes one emergency response script.
//!
//! Each run is a spawned task. Steps run in order; every attempt is bounded
//! by the step deadline and the whole script by the overall deadline. A
//! failed attempt is retried after the configured backoff until the retry
//! budget is spent, at which point the run fails and the supervisor moves
//! the emergency to manual recovery.
//!
//! The runner reports progress and its final result as supervisor messages
//! tagged with its run id. Cancellation is an abort of the task: the
//! in-flight step is dropped mid-await and no result is sent.

use std::sync::Arc;

use nightwatch_hal::Effector;
use nightwatch_kernel::ResponsePlan;
use nightwatch_types::{ResponseEvent, ResponseStep, SafetyError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::supervisor::Command;

pub(crate) struct ResponseRunner {
    plan: ResponsePlan,
    effector: Arc<dyn Effector>,
    reports: mpsc::Sender<Command>,
}

impl ResponseRunner {
    pub(crate) fn new(
        plan: ResponsePlan,
        effector: Arc<dyn Effector>,
        reports: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            plan,
            effector,
            reports,
        }
    }

    pub(crate) async fn run(self) {
        let run_id = self.plan.run_id;
        let result = match tokio::time::timeout(self.plan.overall, self.steps()).await {
            Ok(result) => result,
            Err(_) => Err(SafetyError::ResponseStepFailed {
                step: "response".to_string(),
                details: format!(
                    "{} response exceeded its {} ms deadline",
                    self.plan.kind,
                    self.plan.overall.as_millis()
                ),
            }),
        };
        match &result {
            Ok(()) => info!(kind = %self.plan.kind, %run_id, "response complete"),
            Err(err) => warn!(kind = %self.plan.kind, %run_id, %err, "response failed"),
        }
        let _ = self
            .reports
            .send(Command::ResponseFinished { run_id, result })
            .await;
    }

    async fn steps(&self) -> Result<(), SafetyError> {
        for step in &self.plan.steps {
            self.step(step).await?;
        }
        Ok(())
    }

    async fn step(&self, step: &ResponseStep) -> Result<(), SafetyError> {
        let command = step.command;
        let attempts = self.plan.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.report(ResponseEvent::StepStarted { command, attempt })
                .await;
            match tokio::time::timeout(step.deadline, self.attempt(step)).await {
                Ok(Ok(())) => {
                    debug!(%command, attempt, "step succeeded");
                    self.report(ResponseEvent::StepSucceeded { command, attempt })
                        .await;
                    return Ok(());
                }
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => {
                    last_error = format!(
                        "{command} not confirmed within {} ms",
                        step.deadline.as_millis()
                    )
                }
            }
            warn!(%command, attempt, error = %last_error, "step attempt failed");
            self.report(ResponseEvent::StepFailed {
                command,
                attempt,
                error: last_error.clone(),
            })
            .await;
            if attempt < attempts {
                tokio::time::sleep(self.plan.retry_backoff).await;
            }
        }

        Err(SafetyError::ResponseStepFailed {
            step: command.to_string(),
            details: format!("{last_error} after {attempts} attempts"),
        })
    }

    async fn attempt(&self, step: &ResponseStep) -> Result<(), SafetyError> {
        self.effector.command(step.command).await?;
        if step.await_confirmation && !self.effector.confirm(step.command, step.deadline).await? {
            return Err(SafetyError::HardwareFault {
                component: self.effector.id().to_string(),
                details: format!("{} not confirmed", step.command),
            });
        }
        Ok(())
    }

    async fn report(&self, event: ResponseEvent) {
        let _ = self
            .reports
            .send(Command::ResponseProgress {
                run_id: self.plan.run_id,
                event,
            })
            .await;
    }
}
