//! Seams between the confirmation gate and the outside world.
//!
//! The gate never reads a console or drives a mount itself. It asks the
//! operator through a [`ResponseChannel`] and runs approved tools through a
//! [`ToolExecutor`]; voice pipelines, text consoles and test harnesses each
//! provide their own implementations.
//!
//! [`ScriptedChannel`] replays a fixed list of replies and records every
//! prompt, for tests and unattended demos.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nightwatch_types::{OperatorReply, SafetyError, ToolArgs, ToolSpec};
use tracing::debug;

/// Asks the operator a question and waits for the reply.
///
/// Implementations may wait indefinitely; the gate bounds every call with
/// its own timeout and drops the future when it gives up.
#[async_trait]
pub trait ResponseChannel: Send + Sync {
    /// # Errors
    ///
    /// [`SafetyError::Channel`] when the channel is closed.
    async fn ask(&self, prompt: &str, valid_responses: &[String])
    -> Result<OperatorReply, SafetyError>;

    /// Deliver text that needs no reply.
    async fn announce(&self, text: &str);
}

/// Runs a tool that the gate has approved.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute `tool` with the invocation's `args` and return a short
    /// human-readable result.
    async fn execute(&self, tool: &ToolSpec, args: &ToolArgs) -> Result<String, SafetyError>;
}

/// One scripted reply, optionally delayed.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub text: String,
    pub delay: Duration,
}

/// [`ResponseChannel`] that answers from a queue.
///
/// When the queue runs dry `ask` never resolves, which lets tests exercise
/// confirmation timeouts.
#[derive(Default)]
pub struct ScriptedChannel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    prompts: Mutex<Vec<String>>,
    announcements: Mutex<Vec<String>>,
}

impl ScriptedChannel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channel = Self::default();
        for reply in replies {
            channel.push(reply, Duration::ZERO);
        }
        channel
    }

    /// Queue a reply delivered after `delay`.
    pub fn push(&self, text: impl Into<String>, delay: Duration) {
        let mut replies = self.replies.lock().unwrap_or_else(|p| p.into_inner());
        replies.push_back(ScriptedReply {
            text: text.into(),
            delay,
        });
    }

    /// Every prompt asked so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn announcements(&self) -> Vec<String> {
        self.announcements
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl ResponseChannel for ScriptedChannel {
    async fn ask(
        &self,
        prompt: &str,
        _valid_responses: &[String],
    ) -> Result<OperatorReply, SafetyError> {
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(prompt.to_string());
        let next = self
            .replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match next {
            Some(reply) => {
                tokio::time::sleep(reply.delay).await;
                debug!(prompt, reply = %reply.text, "scripted reply");
                Ok(OperatorReply::classify(&reply.text))
            }
            None => std::future::pending().await,
        }
    }

    async fn announce(&self, text: &str) {
        self.announcements
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(text.to_string());
    }
}
