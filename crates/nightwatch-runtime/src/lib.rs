//! `nightwatch-runtime` – async plumbing around the supervisory core.
//!
//! The kernel decides; this crate makes those decisions happen on a Tokio
//! runtime, against real (or simulated) hardware and a real operator.
//!
//! # Modules
//!
//! - [`supervisor`] – [`Supervisor`] and [`SupervisorHandle`]: the single
//!   serialized loop that owns [`SafetyCore`][nightwatch_kernel::SafetyCore]
//!   and the audit log. Sensor snapshots, operator commands and response
//!   progress arrive as messages; a `watch` channel publishes the latest
//!   [`SafetyStatus`][nightwatch_types::SafetyStatus] after each one.
//! - `response` – the spawned task that runs one emergency response script
//!   with per-step deadlines, retries and an overall deadline.
//! - [`gate`] – [`ConfirmationGate`]: scores every tool invocation, runs the
//!   operator dialogue, re-checks the safety state and executes.
//! - [`executor`] – [`ObservatoryExecutor`]: the
//!   [`ToolExecutor`][nightwatch_middleware::ToolExecutor] that drives the
//!   effector for approved tools.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: `tracing`
//!   subscriber with an optional OTLP span exporter.

pub mod executor;
pub mod gate;
mod response;
pub mod supervisor;
pub mod telemetry;

pub use executor::ObservatoryExecutor;
pub use gate::ConfirmationGate;
pub use supervisor::{SUPERVISOR_SOURCE, Supervisor, SupervisorConfig, SupervisorHandle};
pub use telemetry::{TracerProviderGuard, init_tracing};
