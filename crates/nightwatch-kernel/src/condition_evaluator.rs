//! [`ConditionEvaluator`] – turns sensor snapshots into threshold verdicts.
//!
//! Adapters push [`SafetyCondition`] snapshots through
//! [`ConditionEvaluator::ingest`]; a supervisor calls
//! [`ConditionEvaluator::sweep`] periodically so that readings which stop
//! arriving age into [`Verdict::Unknown`].  Both return only the verdicts
//! that changed.
//!
//! A condition with no fresh reading is never safe: missing and stale data
//! both evaluate to `Unknown`, which downstream is handled as a critical
//! violation. So do NaN and infinite values. Readings stamped further in the
//! future than the allowed clock skew are dropped without displacing the
//! stored reading; a sensor whose clock runs ahead therefore goes stale.
//!
//! The evaluator never commands hardware.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nightwatch_types::{
    Comparison, EmergencyKind, SafetyCondition, SafetyError, Threshold, Verdict,
    VerdictTransition, VetoTier,
};
use tracing::{debug, warn};

/// Veto reason used for the operator E-STOP latch.
pub const ESTOP_VETO: &str = "estop";

/// Prefix of vetoes raised when an emergency needs manual recovery.
pub const MANUAL_RECOVERY_PREFIX: &str = "manual_recovery:";

/// How far ahead of the supervisor clock a reading may be stamped.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(5);

// ────────────────────────────────────────────────────────────────────────────
// ThresholdSet
// ────────────────────────────────────────────────────────────────────────────

/// Validated, immutable collection of [`Threshold`] rules.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use nightwatch_kernel::condition_evaluator::ThresholdSet;
/// use nightwatch_types::{Comparison, EmergencyKind, Threshold, VetoTier};
///
/// let wind = Threshold {
///     reason: "wind".into(),
///     condition: "wind_speed".into(),
///     comparison: Comparison::Max,
///     limit: 25.0,
///     tier: VetoTier::Critical,
///     hysteresis: 0.0,
///     holdoff: Duration::from_secs(600),
///     auto_clearable: true,
///     emergency: Some(EmergencyKind::HighWind),
/// };
/// let set = ThresholdSet::new(vec![wind]).unwrap();
/// assert_eq!(set.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdSet {
    thresholds: Vec<Threshold>,
}

impl ThresholdSet {
    /// Validate and wrap `thresholds`.
    ///
    /// # Errors
    ///
    /// [`SafetyError::InvalidConfig`] when a reason is empty, duplicated or
    /// reserved, a limit is not finite, hysteresis is negative, a critical
    /// rule names no emergency, or a rule claims the operator E-STOP.
    pub fn new(thresholds: Vec<Threshold>) -> Result<Self, SafetyError> {
        let mut seen = HashSet::new();
        for t in &thresholds {
            let invalid =
                |msg: &str| SafetyError::InvalidConfig(format!("threshold '{}': {msg}", t.reason));
            if t.reason.trim().is_empty() || t.condition.trim().is_empty() {
                return Err(SafetyError::InvalidConfig(
                    "threshold reason and condition must be non-empty".to_string(),
                ));
            }
            if t.reason == ESTOP_VETO || t.reason.starts_with(MANUAL_RECOVERY_PREFIX) {
                return Err(invalid("reason is reserved"));
            }
            if !seen.insert(t.reason.clone()) {
                return Err(invalid("duplicate reason"));
            }
            if t.comparison != Comparison::BooleanTrue && !t.limit.is_finite() {
                return Err(invalid("limit must be finite"));
            }
            if !t.hysteresis.is_finite() || t.hysteresis < 0.0 {
                return Err(invalid("hysteresis must be a non-negative number"));
            }
            if t.tier == VetoTier::Critical && t.emergency.is_none() {
                return Err(invalid("critical thresholds must name an emergency"));
            }
            if t.emergency == Some(EmergencyKind::EStop) {
                return Err(invalid("E-STOP can only be raised by an operator"));
            }
        }
        Ok(Self { thresholds })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Threshold> {
        self.thresholds.iter()
    }

    pub fn get(&self, reason: &str) -> Option<&Threshold> {
        self.thresholds.iter().find(|t| t.reason == reason)
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ConditionEvaluator
// ────────────────────────────────────────────────────────────────────────────

/// Holds the newest snapshot per condition and the last verdict per
/// threshold.
pub struct ConditionEvaluator {
    thresholds: ThresholdSet,
    readings: HashMap<String, SafetyCondition>,
    verdicts: HashMap<String, Verdict>,
    max_clock_skew: Duration,
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self {
            thresholds: ThresholdSet::default(),
            readings: HashMap::new(),
            verdicts: HashMap::new(),
            max_clock_skew: DEFAULT_CLOCK_SKEW,
        }
    }
}

impl ConditionEvaluator {
    pub fn new(thresholds: ThresholdSet) -> Self {
        Self {
            thresholds,
            ..Self::default()
        }
    }

    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    pub fn max_clock_skew(&self) -> Duration {
        self.max_clock_skew
    }

    /// Check that `reading` is not stamped beyond the allowed clock skew.
    ///
    /// # Errors
    ///
    /// [`SafetyError::InvalidReading`] naming how far ahead the stamp is.
    pub fn check_timestamp(
        &self,
        reading: &SafetyCondition,
        now: DateTime<Utc>,
    ) -> Result<(), SafetyError> {
        match reading.ahead_of(now) {
            Some(ahead) if ahead > self.max_clock_skew => Err(SafetyError::InvalidReading {
                condition: reading.name.clone(),
                details: format!(
                    "stamped {} s ahead of the supervisor clock (allowed skew {} s)",
                    ahead.as_secs(),
                    self.max_clock_skew.as_secs()
                ),
            }),
            _ => Ok(()),
        }
    }

    /// Store `reading` and re-evaluate every threshold on its condition.
    ///
    /// A reading observed before the one already stored is ignored, so a
    /// delayed adapter cannot overwrite newer data. A reading that fails
    /// [`check_timestamp`](Self::check_timestamp) is ignored too.
    pub fn ingest(
        &mut self,
        reading: SafetyCondition,
        now: DateTime<Utc>,
    ) -> Vec<VerdictTransition> {
        if let Err(err) = self.check_timestamp(&reading, now) {
            warn!(
                condition = %reading.name,
                source = %reading.source,
                %err,
                "dropping future-stamped reading"
            );
            return Vec::new();
        }
        if let Some(current) = self.readings.get(&reading.name)
            && current.observed_at > reading.observed_at
        {
            debug!(condition = %reading.name, "ignoring out-of-order reading");
            return Vec::new();
        }
        let name = reading.name.clone();
        self.readings.insert(name.clone(), reading);

        self.thresholds
            .iter()
            .filter(|t| t.condition == name)
            .filter_map(|t| evaluate(t, &self.readings, &mut self.verdicts, now))
            .collect()
    }

    /// Re-evaluate every threshold against `now`. Stale and missing readings
    /// become [`Verdict::Unknown`].
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<VerdictTransition> {
        self.thresholds
            .iter()
            .filter_map(|t| evaluate(t, &self.readings, &mut self.verdicts, now))
            .collect()
    }

    /// The fresh reading for `name`.
    ///
    /// # Errors
    ///
    /// [`SafetyError::SensorStale`] when the reading is missing or older than
    /// its staleness limit.
    pub fn reading(&self, name: &str, now: DateTime<Utc>) -> Result<&SafetyCondition, SafetyError> {
        match self.readings.get(name) {
            Some(r) if !r.is_stale(now) => Ok(r),
            stale => Err(SafetyError::SensorStale {
                condition: name.to_string(),
                limit_secs: stale.map_or(0, |r| r.staleness_limit.as_secs()),
            }),
        }
    }

    /// Every stored reading, fresh or stale, sorted by condition name.
    pub fn readings(&self) -> Vec<&SafetyCondition> {
        let mut readings: Vec<_> = self.readings.values().collect();
        readings.sort_by(|a, b| a.name.cmp(&b.name));
        readings
    }

    /// Last published verdict for the threshold keyed by `reason`.
    pub fn verdict(&self, reason: &str) -> Option<Verdict> {
        self.verdicts.get(reason).copied()
    }

    pub fn thresholds(&self) -> &ThresholdSet {
        &self.thresholds
    }

    /// Swap in a new rule set. Verdicts of rules that no longer exist are
    /// forgotten; surviving rules keep theirs so no spurious transitions are
    /// published.
    pub fn replace_thresholds(&mut self, thresholds: ThresholdSet) {
        self.verdicts
            .retain(|reason, _| thresholds.get(reason).is_some());
        self.thresholds = thresholds;
    }
}

fn evaluate(
    threshold: &Threshold,
    readings: &HashMap<String, SafetyCondition>,
    verdicts: &mut HashMap<String, Verdict>,
    now: DateTime<Utc>,
) -> Option<VerdictTransition> {
    let previous = verdicts.get(&threshold.reason).copied();
    let fresh = readings
        .get(&threshold.condition)
        .filter(|r| !r.is_stale(now));

    let verdict = match fresh {
        None => Verdict::Unknown,
        Some(r) => threshold.verdict(&r.value, matches!(previous, Some(Verdict::Violated(_)))),
    };

    if previous == Some(verdict) {
        return None;
    }
    verdicts.insert(threshold.reason.clone(), verdict);
    debug!(reason = %threshold.reason, ?previous, to = %verdict, "verdict changed");
    Some(VerdictTransition {
        threshold: threshold.clone(),
        from: previous,
        to: verdict,
        value: fresh.map(|r| r.value),
        at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightwatch_types::ConditionValue;
    use std::time::Duration;

    fn wind(hysteresis: f64) -> Threshold {
        Threshold {
            reason: "wind".into(),
            condition: "wind_speed".into(),
            comparison: Comparison::Max,
            limit: 25.0,
            tier: VetoTier::Critical,
            hysteresis,
            holdoff: Duration::from_secs(600),
            auto_clearable: true,
            emergency: Some(EmergencyKind::HighWind),
        }
    }

    fn rain() -> Threshold {
        Threshold {
            reason: "rain".into(),
            condition: "rain_detected".into(),
            comparison: Comparison::BooleanTrue,
            limit: 0.0,
            tier: VetoTier::Critical,
            hysteresis: 0.0,
            holdoff: Duration::from_secs(1800),
            auto_clearable: false,
            emergency: Some(EmergencyKind::Rain),
        }
    }

    fn rain_reading(wet: bool, at: DateTime<Utc>) -> SafetyCondition {
        SafetyCondition::new(
            "rain_detected",
            ConditionValue::Flag(wet),
            "rain_sensor",
            Duration::from_secs(120),
        )
        .observed_at(at)
    }

    fn reading(value: f64, at: DateTime<Utc>) -> SafetyCondition {
        SafetyCondition::new(
            "wind_speed",
            ConditionValue::Numeric(value),
            "weather_station",
            Duration::from_secs(120),
        )
        .observed_at(at)
    }

    fn evaluator(rules: Vec<Threshold>) -> ConditionEvaluator {
        ConditionEvaluator::new(ThresholdSet::new(rules).unwrap())
    }

    #[test]
    fn violation_produces_single_transition() {
        let now = Utc::now();
        let mut ev = evaluator(vec![wind(0.0)]);
        let t = ev.ingest(reading(32.0, now), now);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].to, Verdict::Violated(VetoTier::Critical));
        assert_eq!(t[0].from, None);

        // Same verdict again: nothing published.
        assert!(ev.ingest(reading(33.0, now), now).is_empty());
    }

    #[test]
    fn stale_reading_becomes_unknown_never_safe() {
        let now = Utc::now();
        let mut ev = evaluator(vec![wind(0.0)]);
        ev.ingest(reading(10.0, now), now);
        assert_eq!(ev.verdict("wind"), Some(Verdict::Safe));

        let later = now + chrono::Duration::seconds(121);
        let t = ev.sweep(later);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].to, Verdict::Unknown);
        assert_eq!(t[0].value, None);
        assert!(matches!(
            ev.reading("wind_speed", later),
            Err(SafetyError::SensorStale { .. })
        ));
    }

    #[test]
    fn never_observed_condition_is_unknown_on_first_sweep() {
        let now = Utc::now();
        let mut ev = evaluator(vec![wind(0.0)]);
        let t = ev.sweep(now);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].to, Verdict::Unknown);
        assert_eq!(t[0].to.veto_tier(), Some(VetoTier::Critical));
    }

    #[test]
    fn out_of_order_reading_is_ignored() {
        let now = Utc::now();
        let mut ev = evaluator(vec![wind(0.0)]);
        ev.ingest(reading(32.0, now), now);
        let older = reading(5.0, now - chrono::Duration::seconds(10));
        assert!(ev.ingest(older, now).is_empty());
        assert_eq!(ev.verdict("wind"), Some(Verdict::Violated(VetoTier::Critical)));
    }

    #[test]
    fn future_stamped_reading_cannot_mask_later_rain() {
        let t0 = Utc::now();
        let mut ev = evaluator(vec![rain()]);

        let dry_from_the_future = rain_reading(false, t0 + chrono::Duration::hours(1));
        assert!(ev.check_timestamp(&dry_from_the_future, t0).is_err());
        assert!(ev.ingest(dry_from_the_future, t0).is_empty());
        assert_eq!(ev.verdict("rain"), None);

        let later = t0 + chrono::Duration::seconds(30);
        let t = ev.ingest(rain_reading(true, later), later);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].to, Verdict::Violated(VetoTier::Critical));

        // Nothing fresh after that: the sensor ages into UNKNOWN.
        let t = ev.sweep(t0 + chrono::Duration::seconds(600));
        assert_eq!(t[0].to, Verdict::Unknown);
    }

    #[test]
    fn future_stamp_does_not_displace_stored_reading() {
        let now = Utc::now();
        let mut ev = evaluator(vec![rain()]);
        ev.ingest(rain_reading(true, now), now);
        let ahead = now + chrono::Duration::minutes(10);
        assert!(ev.ingest(rain_reading(false, ahead), now).is_empty());
        assert_eq!(ev.reading("rain_detected", now).unwrap().value, ConditionValue::Flag(true));

        // A correctly stamped dry reading still gets through afterwards.
        let later = now + chrono::Duration::seconds(5);
        let t = ev.ingest(rain_reading(false, later), later);
        assert_eq!(t[0].to, Verdict::Safe);
    }

    #[test]
    fn small_clock_skew_is_tolerated_and_configurable() {
        let now = Utc::now();
        let mut ev = evaluator(vec![wind(0.0)]);
        assert_eq!(ev.max_clock_skew(), DEFAULT_CLOCK_SKEW);
        let t = ev.ingest(reading(32.0, now + chrono::Duration::seconds(2)), now);
        assert_eq!(t.len(), 1);

        let strict = evaluator(vec![wind(0.0)]).with_max_clock_skew(Duration::ZERO);
        assert!(matches!(
            strict.check_timestamp(&reading(32.0, now + chrono::Duration::seconds(2)), now),
            Err(SafetyError::InvalidReading { .. })
        ));
    }

    #[test]
    fn non_finite_reading_is_unknown() {
        let now = Utc::now();
        let mut ev = evaluator(vec![wind(0.0)]);
        ev.ingest(reading(10.0, now), now);
        assert_eq!(ev.verdict("wind"), Some(Verdict::Safe));

        let t = ev.ingest(reading(f64::NAN, now), now);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].to, Verdict::Unknown);
        assert_eq!(t[0].to.veto_tier(), Some(VetoTier::Critical));

        let t = ev.ingest(reading(f64::INFINITY, now), now);
        assert!(t.is_empty(), "still unknown");
        assert_eq!(ev.verdict("wind"), Some(Verdict::Unknown));
    }

    #[test]
    fn hysteresis_delays_return_to_safe() {
        let now = Utc::now();
        let mut ev = evaluator(vec![wind(5.0)]);
        ev.ingest(reading(30.0, now), now);
        assert!(ev.ingest(reading(22.0, now), now).is_empty());
        let t = ev.ingest(reading(19.0, now), now);
        assert_eq!(t[0].to, Verdict::Safe);
    }

    #[test]
    fn only_rules_on_the_ingested_condition_are_evaluated() {
        let now = Utc::now();
        let mut rain = wind(0.0);
        rain.reason = "rain".into();
        rain.condition = "rain".into();
        rain.comparison = Comparison::BooleanTrue;
        rain.emergency = Some(EmergencyKind::Rain);
        let mut ev = evaluator(vec![wind(0.0), rain]);
        let t = ev.ingest(reading(10.0, now), now);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].reason(), "wind");
        assert_eq!(ev.verdict("rain"), None);
    }

    #[test]
    fn replace_thresholds_drops_removed_verdicts() {
        let now = Utc::now();
        let mut ev = evaluator(vec![wind(0.0)]);
        ev.ingest(reading(10.0, now), now);
        ev.replace_thresholds(ThresholdSet::default());
        assert_eq!(ev.verdict("wind"), None);
        assert!(ev.sweep(now).is_empty());
    }

    #[test]
    fn validation_rejects_bad_rules() {
        let mut critical_without_emergency = wind(0.0);
        critical_without_emergency.emergency = None;
        assert!(ThresholdSet::new(vec![critical_without_emergency]).is_err());

        assert!(ThresholdSet::new(vec![wind(0.0), wind(0.0)]).is_err());

        let mut reserved = wind(0.0);
        reserved.reason = ESTOP_VETO.into();
        assert!(ThresholdSet::new(vec![reserved]).is_err());

        let mut negative = wind(-1.0);
        negative.reason = "gust".into();
        assert!(ThresholdSet::new(vec![negative]).is_err());

        let mut nan = wind(0.0);
        nan.limit = f64::NAN;
        assert!(ThresholdSet::new(vec![nan]).is_err());
    }
}
