//! `nightwatch-cli` – NIGHTWATCH operator console
//!
//! This binary boots the safety supervisory core against the simulated
//! observatory and hands the terminal to the operator.  It:
//!
//! 1. Loads `~/.nightwatch/config.toml` (or `--config <path>` /
//!    `NIGHTWATCH_CONFIG`); runs a **First-Run Wizard** when the file is
//!    absent. An invalid rule set aborts start-up.
//! 2. Opens the audit log, spawns the supervisor and builds the
//!    confirmation gate.
//! 3. Drops the operator into an **interactive REPL** (`/help` lists the
//!    commands). Confirmation prompts are answered on the same console.
//! 4. Intercepts **Ctrl-C** to latch an E-STOP before exiting.

mod config;
mod console;
mod repl;

use colored::Colorize;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use nightwatch_hal::{Effector, SimObservatory};
use nightwatch_kernel::SafetyCore;
use nightwatch_memory::AuditLog;
use nightwatch_middleware::{EventBus, Topic};
use nightwatch_runtime::{ConfirmationGate, ObservatoryExecutor, Supervisor, SupervisorHandle};
use nightwatch_types::{SafetyError, SafetyEvent};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::Config;
use crate::console::{ConsoleChannel, Lines, spawn_stdin_reader};
use crate::repl::Repl;

/// How long hardware tools wait for the commanded state.
const TOOL_CONFIRM_WITHIN: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // RUST_LOG filters (default "info"); NIGHTWATCH_LOG_FORMAT=json switches
    // to JSON lines; OTEL_EXPORTER_OTLP_ENDPOINT enables span export.
    let _telemetry = nightwatch_runtime::init_tracing("nightwatch");

    print_banner();

    let args: Vec<String> = std::env::args().collect();
    let path = config::config_path(config_arg(&args));
    let cfg = match config::load_from(&path) {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok(None) => run_first_run_wizard(&path),
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            std::process::exit(1);
        }
    };

    let lines = spawn_stdin_reader();
    let bus = EventBus::default();
    let (supervisor, gate, task) = match boot(&cfg, &path, bus.clone(), lines.clone()) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("{} {}", "Start-up failed:".red().bold(), e);
            std::process::exit(1);
        }
    };
    tokio::spawn(echo_events(bus));

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(Notify::new());
    let runtime = tokio::runtime::Handle::current();
    let estop = supervisor.clone();
    let notify = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – triggering E-STOP …".yellow().bold());
        match runtime.block_on(estop.estop("ctrl-c")) {
            Ok(()) => println!("{}", "  ✓ E-STOP latched, motors disabled.".green()),
            Err(e) => println!("  {} {}", "E-STOP failed:".red().bold(), e),
        }
        notify.notify_one();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will not trigger an E-STOP");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    let repl = Repl {
        supervisor: supervisor.clone(),
        gate,
        lines,
        operator: cfg.operator.clone(),
        staleness: cfg.sensor_staleness(),
        shutdown,
    };
    repl.run().await;

    if supervisor.shutdown().await.is_ok() {
        task.await.ok();
    }
    println!("{}", "  ✓ Supervisor stopped.".green());
}

/// `--config <path>` or `--config=<path>`.
fn config_arg(args: &[String]) -> Option<&str> {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            return iter.next().map(String::as_str);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path);
        }
    }
    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Boot sequence
// ─────────────────────────────────────────────────────────────────────────────

fn boot(
    cfg: &Config,
    config_path: &Path,
    bus: EventBus,
    lines: Lines,
) -> Result<(SupervisorHandle, Arc<ConfirmationGate>, JoinHandle<()>), SafetyError> {
    println!();
    println!("{}", "═══════════════════════════════════════".bold());
    println!("{}", "       NIGHTWATCH Boot Sequence        ".bold().cyan());
    println!("{}", "═══════════════════════════════════════".bold());

    // ── Step 1 – Safety rules ──────────────────────────────────────────────
    step(1, "Validating safety rules");
    let thresholds = cfg.thresholds()?;
    let tools = cfg.tools()?;
    println!("{} ({} rules, {} tools)", "OK".green(), thresholds.len(), tools.len());

    // ── Step 2 – Audit log ─────────────────────────────────────────────────
    let audit_path = cfg.audit_path_near(config_path);
    step(2, &format!("Opening audit log {}", audit_path.display()));
    if let Some(dir) = audit_path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir).map_err(|e| SafetyError::Audit(e.to_string()))?;
    }
    let audit = AuditLog::open(&audit_path).map_err(|e| SafetyError::Audit(e.to_string()))?;
    println!("{}", "OK".green());

    // ── Step 3 – Effectors ─────────────────────────────────────────────────
    step(3, "Connecting effectors (simulated observatory)");
    let effector: Arc<dyn Effector> = Arc::new(SimObservatory::new());
    println!("{} ({})", "OK".green(), effector.state());

    // ── Step 4 – Supervisor ────────────────────────────────────────────────
    step(4, "Starting safety supervisor");
    let (supervisor, task) = Supervisor::spawn(
        SafetyCore::new(thresholds, cfg.response_timing())
            .with_clock_skew(cfg.clock_skew())
            .with_battery_condition(cfg.interlocks.battery_condition.clone()),
        audit,
        bus,
        Arc::clone(&effector),
        cfg.supervisor(),
    );
    println!("{}", "OK".green());

    // ── Step 5 – Confirmation gate ─────────────────────────────────────────
    step(5, "Arming confirmation gate");
    let executor = Arc::new(ObservatoryExecutor::new(
        effector,
        supervisor.clone(),
        TOOL_CONFIRM_WITHIN,
    ));
    let gate = Arc::new(ConfirmationGate::new(
        tools,
        cfg.gate_policy(),
        supervisor.clone(),
        Arc::new(ConsoleChannel::new(lines)),
        executor,
    ));
    println!("{}", "OK".green());

    println!("{}", "═══════════════════════════════════════".bold());
    println!(
        "  {} NIGHTWATCH is {}. Operator: {}",
        "✓".green().bold(),
        "WATCHING".green().bold(),
        cfg.operator.bold()
    );
    println!("{}", "═══════════════════════════════════════".bold());
    Ok((supervisor, gate, task))
}

fn step(n: u8, what: &str) {
    print!("  [{n}/5] {} … ", what.bold());
    std::io::stdout().flush().ok();
}

/// Print emergency transitions and alerts as they happen.
async fn echo_events(bus: EventBus) {
    let mut emergencies = bus.subscribe_to(Topic::Emergencies);
    let mut alerts = bus.subscribe_to(Topic::Alerts);
    loop {
        let event = tokio::select! {
            e = emergencies.recv() => e,
            e = alerts.recv() => e,
        };
        match event {
            Ok(event) => match &event.payload {
                SafetyEvent::Alert { .. } | SafetyEvent::EStopTriggered { .. } => {
                    println!("\n  {} {}", "!".red().bold(), event.payload.to_string().red());
                }
                other => println!("\n  {} {}", "•".yellow(), other),
            },
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "console fell behind the event bus");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard(path: &Path) -> Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║     NIGHTWATCH First-Run Wizard      ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Default safety rules will be written.\n");

    let mut cfg = Config::default();
    cfg.operator = prompt_line(&format!("  Operator name [{}]: ", cfg.operator), &cfg.operator);

    let timeout = prompt_line(
        &format!("  Confirmation timeout in seconds [{}]: ", cfg.confirmation_timeout_secs),
        &cfg.confirmation_timeout_secs.to_string(),
    );
    if let Ok(secs) = timeout.trim().parse::<u64>() {
        cfg.confirmation_timeout_secs = secs;
    }

    match config::save_to(&cfg, path) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            path.display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   _  ___      __   __ _      __     __      __ "#.bold().cyan());
    println!("{}", r#"  / |/ (_)__ _/ /  / /| | /| / /__ _/ /_____/ / "#.bold().cyan());
    println!("{}", r#" /    / / _ `/ _ \/ __/ |/ |/ / _ `/ __/ __/ _ \"#.bold().cyan());
    println!("{}", r#"/_/|_/_/\_, /_//_/\__/|__/|__/\_,_/\__/\__/_//_/"#.bold().cyan());
    println!("{}", r#"       /___/                                     "#.bold().cyan());
    println!();
    println!("  {} {}", "NIGHTWATCH".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Observatory Safety Supervisor");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::BufRead;
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
