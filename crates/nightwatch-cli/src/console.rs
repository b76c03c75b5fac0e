//! [`ConsoleChannel`] – confirmation prompts answered on the operator's
//! terminal.
//!
//! Stdin is read on a dedicated thread and forwarded line by line, so the
//! REPL and an in-flight confirmation dialogue share one input stream: while
//! the REPL awaits an invocation, the next typed line answers the prompt.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use async_trait::async_trait;
use colored::Colorize;
use nightwatch_middleware::ResponseChannel;
use nightwatch_types::{OperatorReply, SafetyError};
use tokio::sync::{Mutex, mpsc};

/// Shared line source for the REPL and the confirmation dialogue.
pub type Lines = Arc<Mutex<mpsc::Receiver<String>>>;

/// Forward stdin lines until EOF.
pub fn spawn_stdin_reader() -> Lines {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    Arc::new(Mutex::new(rx))
}

/// Next line, or `None` once stdin is closed.
pub async fn next_line(lines: &Lines) -> Option<String> {
    lines.lock().await.recv().await
}

pub struct ConsoleChannel {
    lines: Lines,
}

impl ConsoleChannel {
    pub fn new(lines: Lines) -> Self {
        Self { lines }
    }
}

#[async_trait]
impl ResponseChannel for ConsoleChannel {
    async fn ask(
        &self,
        prompt: &str,
        _valid_responses: &[String],
    ) -> Result<OperatorReply, SafetyError> {
        println!("  {} {}", "?".yellow().bold(), prompt.bold());
        print!("  {} ", ">".yellow());
        io::stdout().flush().ok();
        match next_line(&self.lines).await {
            Some(text) => Ok(OperatorReply::classify(&text)),
            None => Err(SafetyError::Channel("console input closed".to_string())),
        }
    }

    async fn announce(&self, text: &str) {
        println!("  {} {}", "»".cyan().bold(), text);
    }
}
