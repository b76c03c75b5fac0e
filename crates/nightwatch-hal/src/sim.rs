//! In-process simulated observatory for tests and the console demo.
//!
//! [`SimObservatory`] records every command it receives and models each
//! command's completion latency, so response scripts can be exercised
//! end-to-end without hardware. Failures are injected per command:
//!
//! - [`SimObservatory::fail_next`] rejects the next `n` issues of a command.
//! - [`SimObservatory::never_confirm`] accepts a command but never reaches
//!   the commanded state.
//! - [`SimObservatory::set_latency`] delays completion;
//!   [`SimObservatory::set_slew_latency`] does the same for slews.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use nightwatch_hal::{Effector, MountState, SimObservatory};
//! use nightwatch_types::EffectorCommand;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sim = SimObservatory::new();
//! sim.command(EffectorCommand::Park).await.unwrap();
//! assert!(sim.confirm(EffectorCommand::Park, Duration::from_secs(1)).await.unwrap());
//! assert_eq!(sim.state().mount, MountState::Parked);
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use nightwatch_types::{EffectorCommand, SafetyError, SlewTarget};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::effector::{EnclosureState, Effector, MountState, ObservatoryState};

#[derive(Default)]
struct SimInner {
    state: ObservatoryState,
    latency: HashMap<EffectorCommand, Duration>,
    failures: HashMap<EffectorCommand, u32>,
    stuck: HashSet<EffectorCommand>,
    /// Commands accepted but not yet complete.
    pending: HashMap<EffectorCommand, Instant>,
    log: Vec<EffectorCommand>,
    slew_latency: Duration,
    slews: Vec<SlewTarget>,
}

impl SimInner {
    /// Apply every pending command whose completion time has passed.
    fn settle(&mut self, now: Instant) {
        let done: Vec<EffectorCommand> = self
            .pending
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(cmd, _)| *cmd)
            .collect();
        for cmd in done {
            self.pending.remove(&cmd);
            apply(&mut self.state, cmd);
        }
    }
}

fn apply(state: &mut ObservatoryState, command: EffectorCommand) {
    match command {
        EffectorCommand::AbortSlew => {
            if state.mount != MountState::Parked {
                state.mount = MountState::Idle;
            }
        }
        EffectorCommand::Park => state.mount = MountState::Parked,
        EffectorCommand::Unpark => state.mount = MountState::Idle,
        EffectorCommand::CloseEnclosure => state.enclosure = EnclosureState::Closed,
        EffectorCommand::OpenEnclosure => state.enclosure = EnclosureState::Open,
        EffectorCommand::DisableMotors => state.motors_enabled = false,
    }
}

/// Simulated mount and enclosure.
#[derive(Default)]
pub struct SimObservatory {
    inner: Mutex<SimInner>,
}

impl SimObservatory {
    /// A tracking mount under an open enclosure; every command completes
    /// immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from `state` instead of the default.
    pub fn with_state(self, state: ObservatoryState) -> Self {
        self.lock().state = state;
        self
    }

    /// Completion delay for `command`.
    pub fn set_latency(&self, command: EffectorCommand, latency: Duration) {
        self.lock().latency.insert(command, latency);
    }

    /// Time every slew takes to arrive.
    pub fn set_slew_latency(&self, latency: Duration) {
        self.lock().slew_latency = latency;
    }

    /// Every slew target accepted, in order.
    pub fn slews(&self) -> Vec<SlewTarget> {
        self.lock().slews.clone()
    }

    /// Reject the next `times` issues of `command` with a hardware fault.
    pub fn fail_next(&self, command: EffectorCommand, times: u32) {
        self.lock().failures.insert(command, times);
    }

    /// Accept `command` but never reach its state.
    pub fn never_confirm(&self, command: EffectorCommand) {
        self.lock().stuck.insert(command);
    }

    /// Undo [`Self::never_confirm`] and [`Self::fail_next`] for `command`.
    pub fn heal(&self, command: EffectorCommand) {
        let mut inner = self.lock();
        inner.stuck.remove(&command);
        inner.failures.remove(&command);
    }

    /// Every command received, in order, including rejected ones.
    pub fn commands(&self) -> Vec<EffectorCommand> {
        self.lock().log.clone()
    }

    /// Re-enable motors after an E-STOP. Only the simulator can do this; a
    /// real mount needs a technician.
    pub fn enable_motors(&self) {
        self.lock().state.motors_enabled = true;
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Effector for SimObservatory {
    fn id(&self) -> &str {
        "sim"
    }

    async fn command(&self, command: EffectorCommand) -> Result<(), SafetyError> {
        let mut inner = self.lock();
        inner.log.push(command);
        if let Some(left) = inner.failures.get_mut(&command)
            && *left > 0
        {
            *left -= 1;
            warn!(%command, "sim: injected command failure");
            return Err(SafetyError::HardwareFault {
                component: "sim".to_string(),
                details: format!("{command} rejected"),
            });
        }
        if inner.stuck.contains(&command) {
            debug!(%command, "sim: command accepted, will never complete");
            return Ok(());
        }

        let now = Instant::now();
        let latency = inner.latency.get(&command).copied().unwrap_or(Duration::ZERO);
        inner.pending.insert(command, now + latency);
        inner.settle(now);
        debug!(%command, latency_ms = latency.as_millis() as u64, "sim: command accepted");
        Ok(())
    }

    async fn confirm(
        &self,
        command: EffectorCommand,
        within: Duration,
    ) -> Result<bool, SafetyError> {
        let wait = {
            let mut inner = self.lock();
            let now = Instant::now();
            inner.settle(now);
            if inner.stuck.contains(&command) {
                None
            } else {
                match inner.pending.get(&command) {
                    Some(at) => Some(at.saturating_duration_since(now)),
                    None => Some(Duration::ZERO),
                }
            }
        };

        match wait {
            Some(remaining) if remaining <= within => {
                tokio::time::sleep(remaining).await;
                self.lock().settle(Instant::now());
                Ok(true)
            }
            _ => {
                tokio::time::sleep(within).await;
                Ok(false)
            }
        }
    }

    async fn slew_to(&self, target: SlewTarget, within: Duration) -> Result<bool, SafetyError> {
        let latency = {
            let mut inner = self.lock();
            inner.settle(Instant::now());
            let state = inner.state;
            if state.mount == MountState::Parked || !state.motors_enabled {
                return Err(SafetyError::HardwareFault {
                    component: "sim".to_string(),
                    details: format!("cannot slew to {target}: {state}"),
                });
            }
            inner.state.mount = MountState::Slewing;
            inner.slews.push(target);
            inner.slew_latency
        };
        debug!(%target, latency_ms = latency.as_millis() as u64, "sim: slewing");

        if latency > within {
            tokio::time::sleep(within).await;
            return Ok(false);
        }
        tokio::time::sleep(latency).await;
        let mut inner = self.lock();
        // An abort_slew during the move leaves the mount idle.
        if inner.state.mount == MountState::Slewing {
            inner.state.mount = MountState::Tracking;
        }
        Ok(inner.state.mount == MountState::Tracking)
    }

    fn state(&self) -> ObservatoryState {
        let mut inner = self.lock();
        inner.settle(Instant::now());
        inner.state
    }
}
