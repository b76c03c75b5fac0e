//! `nightwatch-middleware` – event routing and operator-facing seams.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels. Every [`SafetyEvent`][nightwatch_types::SafetyEvent]
//!   has exactly one home topic.
//! - [`adapter`] – the traits the confirmation gate talks through:
//!   [`ResponseChannel`] for asking the operator and [`ToolExecutor`] for
//!   running an approved tool, plus the [`ScriptedChannel`] test double.

pub mod adapter;
pub mod bus;

pub use adapter::{ResponseChannel, ScriptedChannel, ToolExecutor};
pub use bus::{EventBus, Topic, TopicReceiver};
