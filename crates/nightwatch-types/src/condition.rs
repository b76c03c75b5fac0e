//! Condition snapshots, threshold rules and the verdicts they produce.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::emergency::EmergencyKind;

/// A sensor reading value. Weather stations report numbers, rain sensors and
/// limit switches report flags.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConditionValue {
    Numeric(f64),
    Flag(bool),
}

impl ConditionValue {
    /// Numeric view; flags map to `1.0` / `0.0`.
    pub fn as_f64(&self) -> f64 {
        match self {
            ConditionValue::Numeric(v) => *v,
            ConditionValue::Flag(true) => 1.0,
            ConditionValue::Flag(false) => 0.0,
        }
    }

    /// Flags are always usable; numbers only when finite. A NaN or infinite
    /// reading says nothing about the sky and is evaluated as unknown.
    pub fn is_valid(&self) -> bool {
        match self {
            ConditionValue::Numeric(v) => v.is_finite(),
            ConditionValue::Flag(_) => true,
        }
    }

    /// Boolean view; any non-zero number is `true`.
    pub fn as_bool(&self) -> bool {
        match self {
            ConditionValue::Numeric(v) => *v != 0.0,
            ConditionValue::Flag(b) => *b,
        }
    }
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::Numeric(v) => write!(f, "{v}"),
            ConditionValue::Flag(b) => write!(f, "{b}"),
        }
    }
}

/// A single timestamped observation pushed by a sensor adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyCondition {
    /// Condition name, e.g. `"wind_speed"` or `"rain"`.
    pub name: String,
    pub value: ConditionValue,
    pub observed_at: DateTime<Utc>,
    /// Adapter label, e.g. `"weather_station"`.
    pub source: String,
    /// Readings older than this are treated as unknown.
    pub staleness_limit: Duration,
}

impl SafetyCondition {
    /// Build a reading observed now.
    pub fn new(
        name: impl Into<String>,
        value: ConditionValue,
        source: impl Into<String>,
        staleness_limit: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            observed_at: Utc::now(),
            source: source.into(),
            staleness_limit,
        }
    }

    /// Override the observation time.
    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    /// Age of the reading relative to `now`. Readings stamped in the future
    /// have age zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.observed_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > self.staleness_limit
    }

    /// How far past `now` the reading is stamped, if at all.
    pub fn ahead_of(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.observed_at - now)
            .to_std()
            .ok()
            .filter(|ahead| !ahead.is_zero())
    }
}

/// Severity of a veto. Ordered so that `max()` yields the governing tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VetoTier {
    Advisory,
    Warning,
    Critical,
}

impl fmt::Display for VetoTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            VetoTier::Advisory => "ADVISORY",
            VetoTier::Warning => "WARNING",
            VetoTier::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// How a threshold compares a reading against its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Violated when the value rises above the limit.
    Max,
    /// Violated when the value falls below the limit.
    Min,
    /// Violated whenever the flag is set; the limit is ignored.
    BooleanTrue,
}

/// A single safety rule: one condition, one limit, one veto reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    /// Veto reason raised while this rule is violated.
    pub reason: String,
    /// Name of the [`SafetyCondition`] this rule reads.
    pub condition: String,
    pub comparison: Comparison,
    pub limit: f64,
    pub tier: VetoTier,
    /// Dead band applied when returning to safe.
    #[serde(default)]
    pub hysteresis: f64,
    /// Quiet period required after the condition clears.
    pub holdoff: Duration,
    pub auto_clearable: bool,
    /// Emergency raised when this rule's veto is critical.
    #[serde(default)]
    pub emergency: Option<EmergencyKind>,
}

impl Threshold {
    /// Whether `value` violates this rule. `currently_violated` selects the
    /// hysteresis band: a violated rule stays violated until the value moves
    /// `hysteresis` back past the limit.
    pub fn violated_by(&self, value: &ConditionValue, currently_violated: bool) -> bool {
        let band = if currently_violated { self.hysteresis } else { 0.0 };
        match self.comparison {
            Comparison::Max => value.as_f64() > self.limit - band,
            Comparison::Min => value.as_f64() < self.limit + band,
            Comparison::BooleanTrue => value.as_bool(),
        }
    }

    /// Verdict for a fresh reading. Values that are not [valid](ConditionValue::is_valid)
    /// are [`Verdict::Unknown`], never safe.
    pub fn verdict(&self, value: &ConditionValue, currently_violated: bool) -> Verdict {
        if !value.is_valid() {
            Verdict::Unknown
        } else if self.violated_by(value, currently_violated) {
            Verdict::Violated(self.tier)
        } else {
            Verdict::Safe
        }
    }

    /// Auto-clearing is disabled for emergencies that always need an operator.
    pub fn clears_automatically(&self) -> bool {
        self.auto_clearable
            && self
                .emergency
                .is_none_or(|kind| kind.auto_clearable_allowed())
    }

    /// Short human-readable description of a violation, e.g.
    /// `"wind_speed 32 exceeds limit 25"`.
    pub fn describe(&self, value: Option<&ConditionValue>) -> String {
        match (value, self.comparison) {
            (None, _) => format!("{} reading unavailable or stale", self.condition),
            (Some(v), _) if !v.is_valid() => {
                format!("{} reading {} is not a usable number", self.condition, v)
            }
            (Some(v), Comparison::Max) => {
                format!("{} {} exceeds limit {}", self.condition, v, self.limit)
            }
            (Some(v), Comparison::Min) => {
                format!("{} {} below limit {}", self.condition, v, self.limit)
            }
            (Some(_), Comparison::BooleanTrue) => format!("{} detected", self.condition),
        }
    }
}

/// Outcome of evaluating one threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "tier", rename_all = "snake_case")]
pub enum Verdict {
    Safe,
    Violated(VetoTier),
    /// Reading missing or stale. Always handled as a critical violation.
    Unknown,
}

impl Verdict {
    /// Tier of the veto this verdict demands, if any.
    pub fn veto_tier(&self) -> Option<VetoTier> {
        match self {
            Verdict::Safe => None,
            Verdict::Violated(tier) => Some(*tier),
            Verdict::Unknown => Some(VetoTier::Critical),
        }
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Verdict::Safe)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Safe => f.write_str("SAFE"),
            Verdict::Violated(tier) => write!(f, "VIOLATED({tier})"),
            Verdict::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// A verdict change for one threshold. The evaluator only emits these when
/// the verdict actually moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictTransition {
    pub threshold: Threshold,
    /// `None` on the first evaluation of the rule.
    pub from: Option<Verdict>,
    pub to: Verdict,
    /// The reading that produced the verdict; `None` when unknown.
    pub value: Option<ConditionValue>,
    pub at: DateTime<Utc>,
}

impl VerdictTransition {
    pub fn reason(&self) -> &str {
        &self.threshold.reason
    }

    pub fn describe(&self) -> String {
        self.threshold.describe(self.value.as_ref())
    }
}
