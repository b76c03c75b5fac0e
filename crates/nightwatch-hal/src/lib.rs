//! `nightwatch-hal` – mount and enclosure command interface.
//!
//! - [`effector`] – the [`Effector`] trait every mount/enclosure driver
//!   implements.
//! - [`sim`] – [`SimObservatory`], an in-process effector with configurable
//!   latency and failure injection for tests and the console demo.

pub mod effector;
pub mod sim;

pub use effector::{EnclosureState, Effector, MountState, ObservatoryState};
pub use sim::SimObservatory;
