//! [`VetoManager`] – the set of active prohibitions.
//!
//! Vetoes are keyed by reason. Raising a reason that is already active never
//! duplicates it and never moves `raised_at`; a stricter tier escalates the
//! existing record in place. A veto only disappears through the recovery
//! path ([`VetoManager::release`]), an operator clear once its holdoff has
//! elapsed ([`VetoManager::clear`]), or an audited administrative override
//! ([`VetoManager::override_clear`]).

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nightwatch_types::{SafetyError, VerdictTransition, Veto, VetoStatus, VetoTier};
use tracing::{info, warn};

use crate::condition_evaluator::ESTOP_VETO;

/// What a call changed. Callers forward these to the recovery manager and the
/// emergency controller.
#[derive(Debug, Clone, PartialEq)]
pub enum VetoChange {
    Raised(Veto),
    Escalated {
        reason: String,
        from: VetoTier,
        to: VetoTier,
    },
    /// A veto in holdoff was violated again; its countdown must be cancelled.
    Retriggered { reason: String },
    /// The condition cleared; start a holdoff countdown.
    HandOff {
        reason: String,
        holdoff: Duration,
        auto_clearable: bool,
    },
}

/// Active vetoes, ordered by reason.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use chrono::Utc;
/// use nightwatch_kernel::veto_manager::VetoManager;
/// use nightwatch_types::VetoTier;
///
/// let mut vetoes = VetoManager::new();
/// let now = Utc::now();
/// vetoes.raise("wind", VetoTier::Critical, "wind 32 mph", Duration::from_secs(600), true, now);
/// vetoes.raise("wind", VetoTier::Critical, "wind 33 mph", Duration::from_secs(600), true, now);
///
/// assert_eq!(vetoes.len(), 1);
/// assert_eq!(vetoes.active_tier(), Some(VetoTier::Critical));
/// ```
#[derive(Default)]
pub struct VetoManager {
    vetoes: BTreeMap<String, Veto>,
}

impl VetoManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a verdict transition from the condition evaluator.
    pub fn apply(&mut self, transition: &VerdictTransition) -> Vec<VetoChange> {
        let threshold = &transition.threshold;
        match transition.to.veto_tier() {
            Some(tier) => self.raise(
                &threshold.reason,
                tier,
                &transition.describe(),
                threshold.holdoff,
                threshold.clears_automatically(),
                transition.at,
            ),
            None => self.hand_off(&threshold.reason).into_iter().collect(),
        }
    }

    /// Raise `reason` at `tier`. Idempotent for an already-active reason
    /// apart from tier escalation and cancelling a running holdoff.
    pub fn raise(
        &mut self,
        reason: &str,
        tier: VetoTier,
        detail: &str,
        holdoff: Duration,
        auto_clearable: bool,
        now: DateTime<Utc>,
    ) -> Vec<VetoChange> {
        let Some(veto) = self.vetoes.get_mut(reason) else {
            let veto = Veto {
                reason: reason.to_string(),
                tier,
                raised_at: now,
                holdoff,
                holdoff_until: None,
                auto_clearable,
                status: VetoStatus::Triggered,
                detail: detail.to_string(),
            };
            warn!(reason, %tier, detail, "veto raised");
            self.vetoes.insert(reason.to_string(), veto.clone());
            return vec![VetoChange::Raised(veto)];
        };

        let mut changes = Vec::new();
        if veto.status != VetoStatus::Triggered {
            veto.status = VetoStatus::Triggered;
            veto.holdoff_until = None;
            info!(reason, "condition violated again during holdoff");
            changes.push(VetoChange::Retriggered {
                reason: reason.to_string(),
            });
        }
        if tier > veto.tier {
            let from = veto.tier;
            veto.tier = tier;
            veto.detail = detail.to_string();
            warn!(reason, %from, to = %tier, "veto escalated");
            changes.push(VetoChange::Escalated {
                reason: reason.to_string(),
                from,
                to: tier,
            });
        }
        changes
    }

    /// Raise a critical, operator-cleared veto that is ready to clear at once
    /// (used for manual recovery).
    pub fn raise_manual(
        &mut self,
        reason: &str,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Vec<VetoChange> {
        let changes = self.raise(reason, VetoTier::Critical, detail, Duration::ZERO, false, now);
        if let Some(veto) = self.vetoes.get_mut(reason) {
            veto.status = VetoStatus::AwaitingOperator;
        }
        changes
    }

    /// Raise the E-STOP latch. It stays triggered until [`Self::remove_latch`].
    pub fn raise_latch(&mut self, detail: &str, now: DateTime<Utc>) -> Vec<VetoChange> {
        self.raise(ESTOP_VETO, VetoTier::Critical, detail, Duration::ZERO, false, now)
    }

    pub fn remove_latch(&mut self) -> Option<Veto> {
        self.vetoes.remove(ESTOP_VETO)
    }

    fn hand_off(&self, reason: &str) -> Option<VetoChange> {
        let veto = self.vetoes.get(reason)?;
        (veto.status == VetoStatus::Triggered).then(|| VetoChange::HandOff {
            reason: reason.to_string(),
            holdoff: veto.holdoff,
            auto_clearable: veto.auto_clearable,
        })
    }

    /// Record that a holdoff countdown is running until `until`.
    pub fn enter_holdoff(&mut self, reason: &str, until: DateTime<Utc>) {
        if let Some(veto) = self.vetoes.get_mut(reason) {
            veto.status = VetoStatus::Holdoff;
            veto.holdoff_until = Some(until);
        }
    }

    /// Holdoff finished on a veto that needs an operator. Returns `false`
    /// when the veto is gone or was re-triggered.
    pub fn mark_ready(&mut self, reason: &str) -> bool {
        match self.vetoes.get_mut(reason) {
            Some(veto) if veto.status == VetoStatus::Holdoff => {
                veto.status = VetoStatus::AwaitingOperator;
                true
            }
            _ => false,
        }
    }

    /// Remove an auto-clearable veto whose holdoff elapsed.
    pub fn release(&mut self, reason: &str) -> Option<Veto> {
        match self.vetoes.get(reason) {
            Some(veto) if veto.status == VetoStatus::Holdoff && veto.auto_clearable => {
                info!(reason, "veto auto-cleared after holdoff");
                self.vetoes.remove(reason)
            }
            _ => None,
        }
    }

    /// Operator clear.
    ///
    /// # Errors
    ///
    /// - [`SafetyError::EStopLatched`] for the E-STOP latch.
    /// - [`SafetyError::UnknownVeto`] when `reason` is not active.
    /// - [`SafetyError::HoldoffNotElapsed`] while the condition is still
    ///   violated or its holdoff is running.
    pub fn clear(&mut self, reason: &str, now: DateTime<Utc>) -> Result<Veto, SafetyError> {
        if reason == ESTOP_VETO {
            return Err(SafetyError::EStopLatched);
        }
        let veto = self
            .vetoes
            .get(reason)
            .ok_or_else(|| SafetyError::UnknownVeto(reason.to_string()))?;
        if !veto.is_ready_to_clear(now) {
            return Err(SafetyError::HoldoffNotElapsed {
                reason: reason.to_string(),
                remaining_secs: veto.remaining_holdoff(now).as_secs(),
            });
        }
        info!(reason, "veto cleared by operator");
        self.vetoes
            .remove(reason)
            .ok_or_else(|| SafetyError::UnknownVeto(reason.to_string()))
    }

    /// Administrative clear that skips the holdoff.
    ///
    /// # Errors
    ///
    /// [`SafetyError::OverrideRejected`] without a justification,
    /// [`SafetyError::EStopLatched`] for the E-STOP latch and
    /// [`SafetyError::UnknownVeto`] when `reason` is not active.
    pub fn override_clear(
        &mut self,
        reason: &str,
        operator: &str,
        justification: &str,
    ) -> Result<Veto, SafetyError> {
        if reason == ESTOP_VETO {
            return Err(SafetyError::EStopLatched);
        }
        if justification.trim().is_empty() {
            return Err(SafetyError::OverrideRejected {
                reason: reason.to_string(),
                details: "a justification is required".to_string(),
            });
        }
        let veto = self
            .vetoes
            .remove(reason)
            .ok_or_else(|| SafetyError::UnknownVeto(reason.to_string()))?;
        warn!(
            reason,
            operator,
            justification,
            status = ?veto.status,
            "veto removed by administrative override"
        );
        Ok(veto)
    }

    /// Highest active tier, or `None` when nothing is vetoed.
    pub fn active_tier(&self) -> Option<VetoTier> {
        self.vetoes.values().map(|v| v.tier).max()
    }

    pub fn reasons(&self) -> BTreeSet<String> {
        self.vetoes.keys().cloned().collect()
    }

    pub fn get(&self, reason: &str) -> Option<&Veto> {
        self.vetoes.get(reason)
    }

    pub fn vetoes(&self) -> impl Iterator<Item = &Veto> {
        self.vetoes.values()
    }

    pub fn len(&self) -> usize {
        self.vetoes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vetoes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightwatch_types::{Comparison, ConditionValue, EmergencyKind, Threshold, Verdict};

    fn transition(to: Verdict, value: Option<f64>, at: DateTime<Utc>) -> VerdictTransition {
        VerdictTransition {
            threshold: Threshold {
                reason: "wind".into(),
                condition: "wind_speed".into(),
                comparison: Comparison::Max,
                limit: 25.0,
                tier: VetoTier::Critical,
                hysteresis: 0.0,
                holdoff: Duration::from_secs(600),
                auto_clearable: true,
                emergency: Some(EmergencyKind::HighWind),
            },
            from: None,
            to,
            value: value.map(ConditionValue::Numeric),
            at,
        }
    }

    #[test]
    fn raising_twice_keeps_original_timestamp() {
        let mut vetoes = VetoManager::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(30);
        vetoes.raise("wind", VetoTier::Critical, "a", Duration::from_secs(600), true, t0);
        let holdoff = Duration::from_secs(600);
        let changes = vetoes.raise("wind", VetoTier::Critical, "b", holdoff, true, t1);
        assert!(changes.is_empty());
        assert_eq!(vetoes.len(), 1);
        assert_eq!(vetoes.get("wind").unwrap().raised_at, t0);
        assert_eq!(vetoes.get("wind").unwrap().detail, "a");
    }

    #[test]
    fn higher_tier_escalates_in_place() {
        let mut vetoes = VetoManager::new();
        let now = Utc::now();
        vetoes.raise("humidity", VetoTier::Warning, "82%", Duration::ZERO, true, now);
        let changes =
            vetoes.raise("humidity", VetoTier::Critical, "91%", Duration::ZERO, true, now);
        assert_eq!(
            changes,
            vec![VetoChange::Escalated {
                reason: "humidity".into(),
                from: VetoTier::Warning,
                to: VetoTier::Critical
            }]
        );
        // Lower tier never downgrades.
        assert!(vetoes
            .raise("humidity", VetoTier::Advisory, "70%", Duration::ZERO, true, now)
            .is_empty());
        assert_eq!(vetoes.active_tier(), Some(VetoTier::Critical));
    }

    #[test]
    fn unknown_verdict_raises_critical() {
        let mut vetoes = VetoManager::new();
        let changes = vetoes.apply(&transition(Verdict::Unknown, None, Utc::now()));
        match &changes[..] {
            [VetoChange::Raised(v)] => {
                assert_eq!(v.tier, VetoTier::Critical);
                assert!(v.detail.contains("unavailable or stale"));
            }
            other => panic!("unexpected changes: {other:?}"),
        }
    }

    #[test]
    fn safe_verdict_hands_off_once() {
        let mut vetoes = VetoManager::new();
        let now = Utc::now();
        vetoes.apply(&transition(Verdict::Violated(VetoTier::Critical), Some(32.0), now));
        let changes = vetoes.apply(&transition(Verdict::Safe, Some(20.0), now));
        assert_eq!(
            changes,
            vec![VetoChange::HandOff {
                reason: "wind".into(),
                holdoff: Duration::from_secs(600),
                auto_clearable: true
            }]
        );
        vetoes.enter_holdoff("wind", now + chrono::Duration::seconds(600));
        assert!(vetoes.apply(&transition(Verdict::Safe, Some(18.0), now)).is_empty());
        // Still present: a safe reading alone never removes a veto.
        assert!(vetoes.get("wind").is_some());
    }

    #[test]
    fn violation_during_holdoff_retriggers() {
        let mut vetoes = VetoManager::new();
        let now = Utc::now();
        vetoes.apply(&transition(Verdict::Violated(VetoTier::Critical), Some(32.0), now));
        vetoes.enter_holdoff("wind", now + chrono::Duration::seconds(600));
        let violated = transition(Verdict::Violated(VetoTier::Critical), Some(30.0), now);
        let changes = vetoes.apply(&violated);
        assert_eq!(changes, vec![VetoChange::Retriggered { reason: "wind".into() }]);
        let veto = vetoes.get("wind").unwrap();
        assert_eq!(veto.status, VetoStatus::Triggered);
        assert_eq!(veto.holdoff_until, None);
    }

    #[test]
    fn clear_before_holdoff_fails() {
        let mut vetoes = VetoManager::new();
        let now = Utc::now();
        vetoes.raise("rain", VetoTier::Critical, "rain", Duration::from_secs(1800), false, now);

        let err = vetoes.clear("rain", now).unwrap_err();
        assert!(matches!(err, SafetyError::HoldoffNotElapsed { remaining_secs: 1800, .. }));

        vetoes.enter_holdoff("rain", now + chrono::Duration::seconds(1800));
        let err = vetoes
            .clear("rain", now + chrono::Duration::seconds(600))
            .unwrap_err();
        assert!(matches!(err, SafetyError::HoldoffNotElapsed { remaining_secs: 1200, .. }));

        assert!(vetoes.mark_ready("rain"));
        assert!(vetoes.clear("rain", now).is_ok());
        assert!(vetoes.is_empty());
    }

    #[test]
    fn release_only_removes_auto_clearable_in_holdoff() {
        let mut vetoes = VetoManager::new();
        let now = Utc::now();
        vetoes.raise("rain", VetoTier::Critical, "rain", Duration::ZERO, false, now);
        vetoes.enter_holdoff("rain", now);
        assert!(vetoes.release("rain").is_none());

        vetoes.raise("wind", VetoTier::Critical, "wind", Duration::ZERO, true, now);
        assert!(vetoes.release("wind").is_none());
        vetoes.enter_holdoff("wind", now);
        assert!(vetoes.release("wind").is_some());
    }

    #[test]
    fn override_requires_justification() {
        let mut vetoes = VetoManager::new();
        let now = Utc::now();
        vetoes.raise("rain", VetoTier::Critical, "rain", Duration::from_secs(1800), false, now);
        assert!(matches!(
            vetoes.override_clear("rain", "ops", "  "),
            Err(SafetyError::OverrideRejected { .. })
        ));
        assert!(vetoes.override_clear("rain", "ops", "sensor wet from dew").is_ok());
        assert!(matches!(
            vetoes.override_clear("rain", "ops", "again"),
            Err(SafetyError::UnknownVeto(_))
        ));
    }

    #[test]
    fn estop_latch_cannot_be_cleared_or_overridden() {
        let mut vetoes = VetoManager::new();
        let now = Utc::now();
        vetoes.raise_latch("operator console", now);
        assert_eq!(vetoes.clear(ESTOP_VETO, now), Err(SafetyError::EStopLatched));
        assert_eq!(
            vetoes.override_clear(ESTOP_VETO, "ops", "testing"),
            Err(SafetyError::EStopLatched)
        );
        assert!(vetoes.remove_latch().is_some());
    }

    #[test]
    fn manual_veto_is_immediately_clearable() {
        let mut vetoes = VetoManager::new();
        let now = Utc::now();
        vetoes.raise_manual("manual_recovery:rain", "park failed", now);
        let veto = vetoes.get("manual_recovery:rain").unwrap();
        assert!(!veto.auto_clearable);
        assert!(vetoes.clear("manual_recovery:rain", now).is_ok());
    }

    #[test]
    fn reasons_and_tier_reflect_all_vetoes() {
        let mut vetoes = VetoManager::new();
        let now = Utc::now();
        assert_eq!(vetoes.active_tier(), None);
        vetoes.raise("clouds", VetoTier::Advisory, "cloudy", Duration::ZERO, true, now);
        vetoes.raise("wind_warning", VetoTier::Warning, "gusty", Duration::ZERO, true, now);
        assert_eq!(vetoes.active_tier(), Some(VetoTier::Warning));
        let reasons: Vec<_> = vetoes.reasons().into_iter().collect();
        assert_eq!(reasons, vec!["clouds".to_string(), "wind_warning".to_string()]);
    }
}
