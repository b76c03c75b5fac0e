//! REPL – Read-Eval-Print Loop for the NIGHTWATCH operator console.
//!
//! Supported slash-commands:
//!   /help                          – show this list
//!   /status                        – safety status summary
//!   /vetoes                        – active vetoes with holdoff state
//!   /snapshot <name> <value>       – feed a sensor reading
//!   /estop                         – latch an emergency stop
//!   /resume                        – release the E-STOP latch
//!   /clear <reason>                – clear a veto whose holdoff elapsed
//!   /override <reason> <why…>      – administrative clear
//!   /invoke <tool>                 – run a tool through the confirmation gate
//!   /slew <alt> <az>               – invoke slew_to with a target in degrees
//!   /session imaging|parked on|off – set session flags
//!   /thresholds                    – list safety rules
//!   /audit [n]                     – most recent audit entries
//!   /quit | /exit                  – stop the supervisor and exit

use colored::Colorize;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nightwatch_runtime::{ConfirmationGate, SupervisorHandle};
use nightwatch_types::{
    ConditionValue, SafetyCondition, SafetyError, SafetyStatus, ToolArgs, VetoStatus, VetoTier,
};
use tokio::sync::Notify;

use crate::console::{Lines, next_line};

const DEFAULT_AUDIT_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFlag {
    Imaging,
    Parked,
}

/// A parsed console command.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Help,
    Status,
    Vetoes,
    Snapshot { name: String, value: ConditionValue },
    EStop,
    Resume,
    Clear(String),
    Override { reason: String, justification: String },
    Invoke { tool: String, args: ToolArgs },
    Session { flag: SessionFlag, on: bool },
    Thresholds,
    Audit(usize),
    Quit,
}

/// Parse one console line. `Ok(None)` for blank input.
pub fn parse(line: &str) -> Result<Option<ReplCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match (cmd, args.as_slice()) {
        ("/help", _) => ReplCommand::Help,
        ("/status", _) => ReplCommand::Status,
        ("/vetoes", _) => ReplCommand::Vetoes,
        ("/snapshot", [name, value]) => ReplCommand::Snapshot {
            name: name.to_string(),
            value: parse_value(value)?,
        },
        ("/snapshot", _) => return Err("usage: /snapshot <name> <value>".to_string()),
        ("/estop", _) => ReplCommand::EStop,
        ("/resume", _) => ReplCommand::Resume,
        ("/clear", [reason]) => ReplCommand::Clear(reason.to_string()),
        ("/clear", _) => return Err("usage: /clear <reason>".to_string()),
        ("/override", [reason, why @ ..]) if !why.is_empty() => ReplCommand::Override {
            reason: reason.to_string(),
            justification: why.join(" "),
        },
        ("/override", _) => return Err("usage: /override <reason> <justification>".to_string()),
        ("/invoke", [tool]) => ReplCommand::Invoke {
            tool: tool.to_string(),
            args: ToolArgs::default(),
        },
        ("/invoke", _) => return Err("usage: /invoke <tool>".to_string()),
        ("/slew", [alt, az]) => ReplCommand::Invoke {
            tool: "slew_to".to_string(),
            args: ToolArgs::slew(parse_degrees(alt)?, parse_degrees(az)?),
        },
        ("/slew", _) => return Err("usage: /slew <altitude> <azimuth>".to_string()),
        ("/session", [flag, state]) => {
            let flag = match *flag {
                "imaging" => SessionFlag::Imaging,
                "parked" => SessionFlag::Parked,
                other => return Err(format!("unknown session flag '{other}'")),
            };
            let on = match *state {
                "on" | "true" => true,
                "off" | "false" => false,
                other => return Err(format!("expected on or off, got '{other}'")),
            };
            ReplCommand::Session { flag, on }
        }
        ("/session", _) => return Err("usage: /session imaging|parked on|off".to_string()),
        ("/thresholds", _) => ReplCommand::Thresholds,
        ("/audit", []) => ReplCommand::Audit(DEFAULT_AUDIT_LINES),
        ("/audit", [n]) => {
            ReplCommand::Audit(n.parse().map_err(|_| format!("'{n}' is not a count"))?)
        }
        ("/audit", _) => return Err("usage: /audit [n]".to_string()),
        ("/quit" | "/exit", _) => ReplCommand::Quit,
        (other, _) => {
            return Err(format!(
                "Unknown command '{other}'. Type /help for available commands."
            ));
        }
    };
    Ok(Some(command))
}

/// Sensor flags accept `true/false`, `on/off`, `wet/dry`; anything else must
/// be a number.
fn parse_value(raw: &str) -> Result<ConditionValue, String> {
    match raw.to_lowercase().as_str() {
        "true" | "on" | "wet" => Ok(ConditionValue::Flag(true)),
        "false" | "off" | "dry" => Ok(ConditionValue::Flag(false)),
        other => other
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(ConditionValue::Numeric)
            .ok_or_else(|| format!("'{raw}' is neither a number nor a flag")),
    }
}

fn parse_degrees(raw: &str) -> Result<f64, String> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("'{raw}' is not an angle in degrees"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Console loop
// ─────────────────────────────────────────────────────────────────────────────

pub struct Repl {
    pub supervisor: SupervisorHandle,
    pub gate: Arc<ConfirmationGate>,
    pub lines: Lines,
    pub operator: String,
    pub staleness: Duration,
    /// Signalled by the Ctrl-C handler.
    pub shutdown: Arc<Notify>,
}

impl Repl {
    /// Run until `/quit`, EOF or shutdown.
    pub async fn run(&self) {
        loop {
            print!("{} ", "nightwatch>".bold().cyan());
            io::stdout().flush().ok();

            let line = tokio::select! {
                _ = self.shutdown.notified() => break,
                line = next_line(&self.lines) => line,
            };
            let Some(line) = line else { break };

            let command = match parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(msg) => {
                    println!("{}", msg.red());
                    continue;
                }
            };
            if command == ReplCommand::Quit {
                println!("{}", "Goodbye.".green());
                break;
            }
            if let Err(e) = self.dispatch(command).await {
                println!("{} {}", "✗".red().bold(), e.to_string().red());
            }
        }
    }

    async fn dispatch(&self, command: ReplCommand) -> Result<(), SafetyError> {
        match command {
            ReplCommand::Help => cmd_help(),
            ReplCommand::Status => print_status(&self.supervisor.status()),
            ReplCommand::Vetoes => print_vetoes(&self.supervisor.status()),
            ReplCommand::Snapshot { name, value } => {
                let reading = SafetyCondition::new(name, value, "console", self.staleness);
                self.supervisor.push_snapshot(reading).await?;
                print_brief(&self.supervisor.status());
            }
            ReplCommand::EStop => {
                self.supervisor.estop(&format!("console:{}", self.operator)).await?;
                println!("{}", "E-STOP latched. Motors disabled.".red().bold());
            }
            ReplCommand::Resume => {
                self.supervisor.resume(&self.operator).await?;
                println!("{}", "✓ E-STOP released.".green());
            }
            ReplCommand::Clear(reason) => {
                self.supervisor.clear_veto(&reason, &self.operator).await?;
                println!("{} {}", "✓ Cleared".green(), reason.bold());
            }
            ReplCommand::Override { reason, justification } => {
                self.supervisor
                    .override_veto(&reason, &self.operator, &justification)
                    .await?;
                println!("{} {}", "✓ Overridden".yellow(), reason.bold());
            }
            ReplCommand::Invoke { tool, args } => {
                let session = self.supervisor.status().session;
                let decision = self
                    .gate
                    .request_invocation_with(&tool, &args, &session)
                    .await?;
                println!(
                    "{} {} {} ({} → {})",
                    "✓".green().bold(),
                    decision.tool.bold(),
                    decision.outcome.to_string().green(),
                    decision.base_tier,
                    decision.effective_tier
                );
                if !decision.output.is_empty() {
                    println!("  {}", decision.output);
                }
            }
            ReplCommand::Session { flag, on } => {
                let mut session = self.supervisor.status().session;
                match flag {
                    SessionFlag::Imaging => session.imaging_active = on,
                    SessionFlag::Parked => session.mount_parked = on,
                }
                self.supervisor.set_session(session).await?;
                println!(
                    "  imaging {}  parked {}",
                    on_off(session.imaging_active),
                    on_off(session.mount_parked)
                );
            }
            ReplCommand::Thresholds => {
                let thresholds = self.supervisor.thresholds().await?;
                println!("{}", "Safety Rules".bold().underline());
                for t in thresholds.iter() {
                    let emergency = t.emergency.map(|k| format!(" → {k}")).unwrap_or_default();
                    println!(
                        "  {:<14} {:<14} {:?} {} [{}] holdoff {}s{}{}",
                        t.reason.bold(),
                        t.condition,
                        t.comparison,
                        t.limit,
                        tier_label(t.tier),
                        t.holdoff.as_secs(),
                        if t.auto_clearable { "" } else { ", operator clear" },
                        emergency
                    );
                }
            }
            ReplCommand::Audit(limit) => {
                let entries = self.supervisor.recent_audit(limit).await?;
                if entries.is_empty() {
                    println!("  {}", "Audit log is empty.".dimmed());
                }
                for e in entries.iter().rev() {
                    println!(
                        "  {} {:<12} {:<16} {}",
                        e.timestamp.format("%H:%M:%S").to_string().dimmed(),
                        e.category.as_str(),
                        e.tag.bold(),
                        e.summary
                    );
                }
            }
            ReplCommand::Quit => {}
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "NIGHTWATCH Commands".bold().underline());
    let rows = [
        ("/status", "safety status summary"),
        ("/vetoes", "active vetoes and holdoff timers"),
        ("/snapshot <name> <value>", "feed a sensor reading"),
        ("/estop", "latch an emergency stop"),
        ("/resume", "release the E-STOP latch"),
        ("/clear <reason>", "clear a veto after its holdoff"),
        ("/override <reason> <why>", "administrative clear (audited)"),
        ("/invoke <tool>", "run a tool through the confirmation gate"),
        ("/slew <alt> <az>", "slew the mount through the gate"),
        ("/session imaging|parked on|off", "set session flags"),
        ("/thresholds", "list safety rules"),
        ("/audit [n]", "recent audit entries"),
        ("/quit  /exit", "stop the supervisor and exit"),
    ];
    for (cmd, what) in rows {
        println!("  {:<32} – {}", cmd.bold().cyan(), what);
    }
    println!();
}

fn print_brief(status: &SafetyStatus) {
    match status.active_tier {
        Some(tier) => println!("  {} {}", tier_label(tier), status.veto_summary()),
        None => println!("  {}", "SAFE".green().bold()),
    }
}

fn print_status(status: &SafetyStatus) {
    println!("{}", "Safety Status".bold().underline());
    print_brief(status);
    let emergency = status
        .current_emergency
        .as_ref()
        .map_or_else(|| "none".to_string(), |e| format!("{} ({})", e.kind, e.state));
    println!("  Emergency      : {}", emergency.bold());
    println!("  Responding     : {}", on_off(status.responding));
    if status.estop_latched {
        println!("  {}", "E-STOP LATCHED – /resume required".red().bold());
    }
    if !status.manual_recovery.is_empty() {
        println!(
            "  {} {}",
            "Manual recovery:".red().bold(),
            status.manual_recovery.join(", ")
        );
    }
    println!(
        "  Session        : imaging {}  parked {}",
        on_off(status.session.imaging_active),
        on_off(status.session.mount_parked)
    );
}

fn print_vetoes(status: &SafetyStatus) {
    if status.vetoes.is_empty() {
        println!("  {}", "No active vetoes.".green());
        return;
    }
    let now = Utc::now();
    for v in &status.vetoes {
        let state = match v.status {
            VetoStatus::Triggered => "triggered".to_string(),
            VetoStatus::Holdoff => format!("holdoff {}s left", v.remaining_holdoff(now).as_secs()),
            VetoStatus::AwaitingOperator => "awaiting operator".yellow().to_string(),
        };
        println!(
            "  {} {:<18} {:<20} {}",
            tier_label(v.tier),
            v.reason.bold(),
            state,
            v.detail.dimmed()
        );
    }
}

fn tier_label(tier: VetoTier) -> colored::ColoredString {
    let label = tier.to_string();
    match tier {
        VetoTier::Critical => label.red().bold(),
        VetoTier::Warning => label.yellow().bold(),
        VetoTier::Advisory => label.cyan(),
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}
