//! Configuration Vault – reads/writes `~/.nightwatch/config.toml`.
//!
//! Every field has a default, so a partial file (or none at all) yields a
//! working observatory. [`Config::thresholds`], [`Config::tools`],
//! [`Config::gate_policy`] and [`Config::response_timing`] turn the file into
//! validated kernel types; a bad rule fails start-up with
//! [`SafetyError::InvalidConfig`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nightwatch_kernel::{
    DEFAULT_BATTERY_CONDITION, DEFAULT_CLOCK_SKEW, GatePolicy, InterlockLimits, ResponseTiming,
    ThresholdSet, ToolRegistry, standard_tools,
};
use nightwatch_runtime::SupervisorConfig;
use nightwatch_types::{Comparison, EmergencyKind, SafetyError, Threshold, ToolSpec, VetoTier};

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "NIGHTWATCH_CONFIG";

/// One safety rule as written in TOML. Durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub reason: String,
    pub condition: String,
    pub comparison: Comparison,
    #[serde(default)]
    pub limit: f64,
    pub tier: VetoTier,
    #[serde(default)]
    pub hysteresis: f64,
    #[serde(default)]
    pub holdoff_secs: u64,
    #[serde(default = "default_true")]
    pub auto_clearable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency: Option<EmergencyKind>,
}

impl From<&ThresholdConfig> for Threshold {
    fn from(t: &ThresholdConfig) -> Self {
        Threshold {
            reason: t.reason.clone(),
            condition: t.condition.clone(),
            comparison: t.comparison,
            limit: t.limit,
            tier: t.tier,
            hysteresis: t.hysteresis,
            holdoff: Duration::from_secs(t.holdoff_secs),
            auto_clearable: t.auto_clearable,
            emergency: t.emergency,
        }
    }
}

/// Emergency response deadlines and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    pub abort_slew_secs: u64,
    pub park_secs: u64,
    pub close_enclosure_secs: u64,
    pub disable_motors_secs: u64,
    pub weather_overall_secs: u64,
    pub fault_overall_secs: u64,
    pub estop_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        let t = ResponseTiming::default();
        Self {
            abort_slew_secs: t.abort_slew.as_secs(),
            park_secs: t.park.as_secs(),
            close_enclosure_secs: t.close_enclosure.as_secs(),
            disable_motors_secs: t.disable_motors.as_secs(),
            weather_overall_secs: t.weather_overall.as_secs(),
            fault_overall_secs: t.fault_overall.as_secs(),
            estop_ms: t.estop.as_millis() as u64,
            max_retries: t.max_retries,
            retry_backoff_ms: t.retry_backoff.as_millis() as u64,
        }
    }
}

/// Per-command interlock limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterlockConfig {
    /// Lowest altitude `slew_to` may target, in degrees.
    pub min_slew_altitude_deg: f64,
    /// UPS charge below which unpark and open are refused.
    pub min_battery_percent: f64,
    /// Condition whose reading reports the UPS charge.
    pub battery_condition: String,
}

impl Default for InterlockConfig {
    fn default() -> Self {
        let limits = InterlockLimits::default();
        Self {
            min_slew_altitude_deg: limits.min_altitude_deg,
            min_battery_percent: limits.min_battery_percent,
            battery_condition: DEFAULT_BATTERY_CONDITION.to_string(),
        }
    }
}

/// Persisted configuration stored in `~/.nightwatch/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Name recorded against clears, overrides and resumes.
    #[serde(default = "default_operator")]
    pub operator: String,

    /// SQLite audit log. Relative paths resolve against the working
    /// directory; unset means `~/.nightwatch/audit.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_path: Option<PathBuf>,

    /// Staleness sweep period.
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,

    /// Staleness limit attached to console snapshots.
    #[serde(default = "default_staleness_secs")]
    pub sensor_staleness_secs: u64,

    /// Time allowed for each confirmation round.
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirmation_timeout_secs: u64,

    /// Whether WARNING vetoes force a confirmation round.
    #[serde(default)]
    pub warning_veto_forces_confirm: bool,

    /// How far ahead of the local clock a reading may be stamped before it
    /// is refused.
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,

    #[serde(default)]
    pub response: ResponseConfig,

    #[serde(default)]
    pub interlocks: InterlockConfig,

    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<ThresholdConfig>,

    /// Replaces the built-in tool table when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

fn default_true() -> bool {
    true
}
fn default_operator() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_string())
}
fn default_sweep_secs() -> u64 {
    5
}
fn default_staleness_secs() -> u64 {
    120
}
fn default_confirm_timeout_secs() -> u64 {
    10
}
fn default_clock_skew_secs() -> u64 {
    DEFAULT_CLOCK_SKEW.as_secs()
}

/// Observatory defaults: wind and rain park or close the site, humidity and
/// power faults close up, cloud and gusts only warn.
pub fn default_thresholds() -> Vec<ThresholdConfig> {
    use Comparison::{BooleanTrue, Max, Min};
    use EmergencyKind::{HighWind, MountFault, PowerFailure, Rain, WeatherUnsafe};
    use VetoTier::{Advisory, Critical, Warning};

    let rule = |reason: &str, condition: &str, comparison, limit, tier, holdoff_secs| {
        ThresholdConfig {
            reason: reason.to_string(),
            condition: condition.to_string(),
            comparison,
            limit,
            tier,
            hysteresis: 0.0,
            holdoff_secs,
            auto_clearable: true,
            emergency: None,
        }
    };
    let critical = |t: ThresholdConfig, emergency| ThresholdConfig {
        emergency: Some(emergency),
        ..t
    };
    let latched = |t: ThresholdConfig| ThresholdConfig {
        auto_clearable: false,
        ..t
    };
    let with_hysteresis = |t: ThresholdConfig, hysteresis| ThresholdConfig { hysteresis, ..t };

    vec![
        critical(rule("wind", "wind_speed", Max, 25.0, Critical, 600), HighWind),
        with_hysteresis(rule("wind_gusty", "wind_speed", Max, 20.0, Warning, 300), 2.0),
        latched(critical(rule("rain", "rain_detected", BooleanTrue, 0.0, Critical, 1800), Rain)),
        with_hysteresis(
            critical(rule("humidity", "humidity", Max, 85.0, Critical, 900), WeatherUnsafe),
            5.0,
        ),
        with_hysteresis(rule("clouds", "cloud_cover", Max, 50.0, Advisory, 600), 10.0),
        with_hysteresis(rule("sky_cloudy", "sky_minus_ambient", Max, -10.0, Advisory, 600), 2.0),
        latched(critical(
            rule("motor_current", "motor_current", Max, 5.0, Critical, 60),
            MountFault,
        )),
        latched(critical(
            rule("ups_battery", "ups_battery", Min, 50.0, Critical, 300),
            PowerFailure,
        )),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            operator: default_operator(),
            audit_path: None,
            sweep_secs: default_sweep_secs(),
            sensor_staleness_secs: default_staleness_secs(),
            confirmation_timeout_secs: default_confirm_timeout_secs(),
            warning_veto_forces_confirm: false,
            clock_skew_secs: default_clock_skew_secs(),
            response: ResponseConfig::default(),
            interlocks: InterlockConfig::default(),
            thresholds: default_thresholds(),
            tools: Vec::new(),
        }
    }
}

impl Config {
    /// # Errors
    ///
    /// [`SafetyError::InvalidConfig`] when a rule fails validation.
    pub fn thresholds(&self) -> Result<ThresholdSet, SafetyError> {
        ThresholdSet::new(self.thresholds.iter().map(Threshold::from).collect())
    }

    /// # Errors
    ///
    /// [`SafetyError::InvalidConfig`] for duplicate or malformed tools,
    /// including a tool whose action does not fit its class.
    pub fn tools(&self) -> Result<ToolRegistry, SafetyError> {
        if self.tools.is_empty() {
            ToolRegistry::new(standard_tools())
        } else {
            ToolRegistry::new(self.tools.clone())
        }
    }

    pub fn gate_policy(&self) -> GatePolicy {
        GatePolicy {
            confirmation_timeout: Duration::from_secs(self.confirmation_timeout_secs),
            warning_veto_forces_confirm: self.warning_veto_forces_confirm,
            interlocks: InterlockLimits {
                min_altitude_deg: self.interlocks.min_slew_altitude_deg,
                min_battery_percent: self.interlocks.min_battery_percent,
            },
        }
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }

    pub fn response_timing(&self) -> ResponseTiming {
        let r = &self.response;
        ResponseTiming {
            abort_slew: Duration::from_secs(r.abort_slew_secs),
            park: Duration::from_secs(r.park_secs),
            close_enclosure: Duration::from_secs(r.close_enclosure_secs),
            disable_motors: Duration::from_secs(r.disable_motors_secs),
            weather_overall: Duration::from_secs(r.weather_overall_secs),
            fault_overall: Duration::from_secs(r.fault_overall_secs),
            estop: Duration::from_millis(r.estop_ms),
            max_retries: r.max_retries,
            retry_backoff: Duration::from_millis(r.retry_backoff_ms),
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            sweep_interval: Duration::from_secs(self.sweep_secs.max(1)),
            ..SupervisorConfig::default()
        }
    }

    pub fn sensor_staleness(&self) -> Duration {
        Duration::from_secs(self.sensor_staleness_secs)
    }

    /// Where the audit log lives, given the config file's location.
    pub fn audit_path_near(&self, config_path: &Path) -> PathBuf {
        match &self.audit_path {
            Some(path) => path.clone(),
            None => config_path
                .parent()
                .map_or_else(|| PathBuf::from("audit.db"), |dir| dir.join("audit.db")),
        }
    }
}

/// Resolve the config path: an explicit `--config` argument, then
/// `NIGHTWATCH_CONFIG`, then `~/.nightwatch/config.toml`.
pub fn config_path(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var(CONFIG_ENV)
        && !path.is_empty()
    {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".nightwatch").join("config.toml")
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `NIGHTWATCH_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `NIGHTWATCH_AUDIT_PATH` | `audit_path` |
/// | `NIGHTWATCH_SWEEP_SECS` | `sweep_secs` |
/// | `NIGHTWATCH_CONFIRM_TIMEOUT_SECS` | `confirmation_timeout_secs` |
///
/// Unparsable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("NIGHTWATCH_AUDIT_PATH")
        && !v.is_empty()
    {
        cfg.audit_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("NIGHTWATCH_SWEEP_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.sweep_secs = secs;
    }
    if let Ok(v) = std::env::var("NIGHTWATCH_CONFIRM_TIMEOUT_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.confirmation_timeout_secs = secs;
    }
}

/// Save the config to `path`, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
