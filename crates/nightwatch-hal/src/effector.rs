//! Generic `Effector` trait for the mount and enclosure.
//!
//! The supervisory core only ever talks to this trait, so a real mount
//! driver, an enclosure PLC or the simulator can be swapped without touching
//! the response logic.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use nightwatch_types::{EffectorCommand, SafetyError, SlewTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Idle,
    Slewing,
    Tracking,
    Parked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclosureState {
    Open,
    Closed,
}

/// Last known physical state of the observatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservatoryState {
    pub mount: MountState,
    pub enclosure: EnclosureState,
    pub motors_enabled: bool,
}

impl Default for ObservatoryState {
    fn default() -> Self {
        Self {
            mount: MountState::Tracking,
            enclosure: EnclosureState::Open,
            motors_enabled: true,
        }
    }
}

impl fmt::Display for ObservatoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mount {:?}, enclosure {:?}, motors {}",
            self.mount,
            self.enclosure,
            if self.motors_enabled { "enabled" } else { "disabled" }
        )
    }
}

/// Command interface to the mount and enclosure.
///
/// `command` returns once the device accepted the command; `confirm` waits,
/// bounded by `within`, for the commanded state to be reached.
#[async_trait]
pub trait Effector: Send + Sync {
    /// Stable identifier, e.g. `"sim"` or `"mount_controller"`.
    fn id(&self) -> &str;

    /// Issue `command`.
    ///
    /// # Errors
    ///
    /// Returns [`SafetyError::HardwareFault`] if the device rejected the
    /// command or could not be reached.
    async fn command(&self, command: EffectorCommand) -> Result<(), SafetyError>;

    /// Wait up to `within` for `command` to take effect. `Ok(false)` means
    /// the deadline passed without confirmation.
    async fn confirm(&self, command: EffectorCommand, within: Duration)
    -> Result<bool, SafetyError>;

    /// Slew to `target` and wait up to `within` for the mount to arrive.
    /// `Ok(false)` means it did not arrive in time.
    ///
    /// # Errors
    ///
    /// [`SafetyError::HardwareFault`] when the mount cannot slew. The default
    /// implementation serves effectors that drive no mount.
    async fn slew_to(&self, target: SlewTarget, within: Duration) -> Result<bool, SafetyError> {
        let _ = within;
        Err(SafetyError::HardwareFault {
            component: self.id().to_string(),
            details: format!("cannot slew to {target}"),
        })
    }

    /// Most recently known physical state.
    fn state(&self) -> ObservatoryState;
}
