//! [`GatePolicy`] – scores a tool invocation against the current safety state.
//!
//! The policy is the synchronous half of the confirmation gate: given a tool,
//! its arguments, the session and a [`SafetyStatus`] snapshot it decides
//! whether the invocation bypasses the gate, is rejected outright, or
//! proceeds at a particular effective tier. The runtime gate owns the
//! operator dialogue.
//!
//! Checks run in this order:
//!
//! 1. Abort-class tools bypass everything.
//! 2. A pending manual recovery rejects everything except queries and
//!    safe-ward tools.
//! 3. A responding emergency or a latched E-STOP rejects effector tools.
//! 4. Session modifiers: +1 tier for a disruptive tool while imaging, −1 for
//!    unpark while parked.
//! 5. Veto modifiers: a CRITICAL veto blocks hardware tools that are not
//!    safe-ward and forces at least CONFIRM on the rest; lower tiers force
//!    CONFIRM only when `warning_veto_forces_confirm` is set.
//! 6. Safe-ward tools run at exactly CONFIRM under a CRITICAL veto or a
//!    pending manual recovery.
//! 7. Command interlocks: slew target altitude, and the enclosure and UPS
//!    charge for unpark and open. Unsafe weather already stops these tools
//!    at step 5.

use std::time::Duration;

use nightwatch_types::{
    ConfirmationTier, EffectorCommand, SafetyError, SafetyStatus, SessionContext, ToolAction,
    ToolArgs, ToolClass, ToolSpec, VetoTier,
};

/// Limits checked by the command interlocks.
#[derive(Debug, Clone, PartialEq)]
pub struct InterlockLimits {
    /// Lowest altitude a slew may target, in degrees.
    pub min_altitude_deg: f64,
    /// UPS charge, in percent, below which unpark and open are refused.
    pub min_battery_percent: f64,
}

impl Default for InterlockLimits {
    fn default() -> Self {
        Self {
            min_altitude_deg: 10.0,
            min_battery_percent: 50.0,
        }
    }
}

/// Tunables for the confirmation gate.
#[derive(Debug, Clone, PartialEq)]
pub struct GatePolicy {
    /// Time allowed for each confirmation round.
    pub confirmation_timeout: Duration,
    /// Whether WARNING/ADVISORY vetoes force a confirmation round.
    pub warning_veto_forces_confirm: bool,
    pub interlocks: InterlockLimits,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(10),
            warning_veto_forces_confirm: false,
            interlocks: InterlockLimits::default(),
        }
    }
}

/// Outcome of [`GatePolicy::assess`].
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Abort-class tool: execute now, cancel any pending confirmation.
    Bypass,
    Proceed {
        base: ConfirmationTier,
        effective: ConfirmationTier,
        /// Active vetoes worth mentioning in the prompt.
        veto_note: Option<String>,
    },
    Reject(SafetyError),
}

impl GatePolicy {
    /// Score an argument-less invocation of `tool`.
    ///
    /// # Example
    ///
    /// ```
    /// use nightwatch_kernel::confirmation_policy::{GateDecision, GatePolicy};
    /// use nightwatch_kernel::tool_registry::{standard_tools, ToolRegistry};
    /// use nightwatch_types::{ConfirmationTier, SafetyStatus, SessionContext};
    ///
    /// let registry = ToolRegistry::new(standard_tools()).unwrap();
    /// let park = registry.get("park_telescope").unwrap();
    /// let session = SessionContext { imaging_active: true, ..Default::default() };
    ///
    /// let decision = GatePolicy::default().assess(park, &session, &SafetyStatus::default());
    /// assert!(matches!(
    ///     decision,
    ///     GateDecision::Proceed { effective: ConfirmationTier::Double, .. }
    /// ));
    /// ```
    pub fn assess(
        &self,
        tool: &ToolSpec,
        session: &SessionContext,
        status: &SafetyStatus,
    ) -> GateDecision {
        self.assess_with(tool, &ToolArgs::default(), session, status)
    }

    /// Score `tool` invoked with `args` against `session` and `status`.
    pub fn assess_with(
        &self,
        tool: &ToolSpec,
        args: &ToolArgs,
        session: &SessionContext,
        status: &SafetyStatus,
    ) -> GateDecision {
        if tool.is_abort() {
            return GateDecision::Bypass;
        }

        let recovering = !status.manual_recovery.is_empty();
        if recovering && tool.class != ToolClass::Query && !tool.safe_ward {
            return GateDecision::Reject(SafetyError::ManualRecoveryRequired {
                reason: status.manual_recovery.join(", "),
            });
        }

        if tool.targets_effector() && (status.responding || status.estop_latched) {
            let emergency = status
                .current_emergency
                .as_ref()
                .map_or_else(|| "E-STOP".to_string(), |e| e.kind.to_string());
            return GateDecision::Reject(SafetyError::SafetyOverrideActive {
                tool: tool.name.clone(),
                emergency,
            });
        }

        let base = tool.base_tier;
        let mut effective = base;
        if session.imaging_active && tool.disruptive {
            effective = effective.escalate();
        }
        if session.mount_parked && tool.is_unpark() {
            effective = effective.relax();
        }

        let critical = status.active_tier == Some(VetoTier::Critical);
        let mut veto_note = None;
        match status.active_tier {
            Some(VetoTier::Critical) => {
                if tool.targets_effector() && !tool.safe_ward {
                    return GateDecision::Reject(SafetyError::VetoActive {
                        tool: tool.name.clone(),
                        reasons: status.veto_summary(),
                    });
                }
                effective = effective.max(ConfirmationTier::Confirm);
                veto_note = Some(status.veto_summary());
            }
            Some(_) if self.warning_veto_forces_confirm => {
                effective = effective.max(ConfirmationTier::Confirm);
                veto_note = Some(status.veto_summary());
            }
            _ => {}
        }
        if tool.safe_ward && (critical || recovering) {
            effective = ConfirmationTier::Confirm;
        }

        if let Err(err) = self.interlock(tool, args, status) {
            return GateDecision::Reject(err);
        }

        GateDecision::Proceed {
            base,
            effective,
            veto_note,
        }
    }

    /// Per-command physical checks. Unknown plant facts do not block.
    ///
    /// # Errors
    ///
    /// [`SafetyError::InterlockBlocked`] naming the failed check.
    pub fn interlock(
        &self,
        tool: &ToolSpec,
        args: &ToolArgs,
        status: &SafetyStatus,
    ) -> Result<(), SafetyError> {
        let blocked = |reason: String| {
            Err(SafetyError::InterlockBlocked {
                tool: tool.name.clone(),
                reason,
            })
        };
        let limits = &self.interlocks;
        let plant = &status.plant;

        match tool.action {
            ToolAction::SlewTo => {
                let Some(target) = args.target else {
                    return blocked("a slew target is required".to_string());
                };
                let altitude = target.altitude_deg;
                if !altitude.is_finite() || altitude < limits.min_altitude_deg {
                    return blocked(format!(
                        "target altitude {:.1}° is below the minimum {:.1}°",
                        target.altitude_deg, limits.min_altitude_deg
                    ));
                }
            }
            ToolAction::Effector(EffectorCommand::Unpark) => {
                if plant.enclosure_open == Some(false) {
                    return blocked("the enclosure is closed; open it first".to_string());
                }
                if let Some(percent) = plant.battery_percent
                    && percent < limits.min_battery_percent
                {
                    return blocked(format!("UPS charge {percent:.0}% is too low to unpark"));
                }
            }
            ToolAction::Effector(EffectorCommand::OpenEnclosure) => {
                if let Some(percent) = plant.battery_percent
                    && percent < limits.min_battery_percent
                {
                    return blocked(format!(
                        "UPS charge {percent:.0}% is too low to open the enclosure"
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Prompt for confirmation round `round` (1 or 2).
    pub fn prompt(&self, tool: &ToolSpec, round: u8, veto_note: Option<&str>) -> String {
        let action = tool.name.replace('_', " ");
        let mut prompt = if round >= 2 {
            format!("To proceed, say '{}'.", tool.phrase())
        } else {
            format!("Confirm {action}? (yes/no)")
        };
        if let Some(note) = veto_note {
            prompt = format!("{note} {prompt}");
        }
        prompt
    }

    /// Replies offered to the operator for round `round`.
    pub fn valid_responses(&self, tool: &ToolSpec, round: u8) -> Vec<String> {
        if round >= 2 {
            vec![tool.phrase(), "cancel".to_string()]
        } else {
            vec!["yes".to_string(), "no".to_string()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_registry::{standard_tools, ToolRegistry};
    use chrono::Utc;
    use nightwatch_types::{Emergency, EmergencyKind, PlantState, Veto, VetoStatus};

    fn registry() -> ToolRegistry {
        ToolRegistry::new(standard_tools()).unwrap()
    }

    fn veto(reason: &str, tier: VetoTier) -> Veto {
        Veto {
            reason: reason.into(),
            tier,
            raised_at: Utc::now(),
            holdoff: Duration::from_secs(600),
            holdoff_until: None,
            auto_clearable: true,
            status: VetoStatus::Triggered,
            detail: format!("{reason} over limit"),
        }
    }

    fn vetoed(tier: VetoTier) -> SafetyStatus {
        SafetyStatus {
            active_tier: Some(tier),
            vetoes: vec![veto("wind", tier)],
            ..Default::default()
        }
    }

    fn effective(decision: GateDecision) -> ConfirmationTier {
        match decision {
            GateDecision::Proceed { effective, .. } => effective,
            other => panic!("expected Proceed, got {other:?}"),
        }
    }

    #[test]
    fn abort_tools_bypass_even_during_estop() {
        let r = registry();
        let status = SafetyStatus {
            estop_latched: true,
            manual_recovery: vec!["manual_recovery:rain".into()],
            ..vetoed(VetoTier::Critical)
        };
        let decision = GatePolicy::default().assess(
            r.get("emergency_stop").unwrap(),
            &SessionContext::default(),
            &status,
        );
        assert_eq!(decision, GateDecision::Bypass);
    }

    #[test]
    fn disruptive_tool_escalates_while_imaging() {
        let r = registry();
        let session = SessionContext {
            imaging_active: true,
            ..Default::default()
        };
        let policy = GatePolicy::default();
        let park = r.get("park_telescope").unwrap();
        assert_eq!(
            effective(policy.assess(park, &session, &SafetyStatus::default())),
            ConfirmationTier::Double
        );
        assert_eq!(
            effective(policy.assess(park, &SessionContext::default(), &SafetyStatus::default())),
            ConfirmationTier::Confirm
        );
    }

    #[test]
    fn unpark_relaxes_when_parked() {
        let r = registry();
        let session = SessionContext {
            mount_parked: true,
            ..Default::default()
        };
        let decision = GatePolicy::default().assess(
            r.get("unpark_telescope").unwrap(),
            &session,
            &SafetyStatus::default(),
        );
        assert_eq!(effective(decision), ConfirmationTier::None);
    }

    #[test]
    fn critical_veto_blocks_hardware_and_forces_confirm_elsewhere() {
        let r = registry();
        let policy = GatePolicy::default();
        let status = vetoed(VetoTier::Critical);
        let session = SessionContext::default();

        match policy.assess(r.get("open_enclosure").unwrap(), &session, &status) {
            GateDecision::Reject(SafetyError::VetoActive { reasons, .. }) => {
                assert!(reasons.contains("wind over limit (CRITICAL)"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            effective(policy.assess(r.get("get_weather").unwrap(), &session, &status)),
            ConfirmationTier::Confirm
        );
    }

    #[test]
    fn warning_veto_forces_confirm_only_when_enabled() {
        let r = registry();
        let unpark = r.get("unpark_telescope").unwrap();
        let status = vetoed(VetoTier::Warning);
        let session = SessionContext::default();

        assert_eq!(
            effective(GatePolicy::default().assess(unpark, &session, &status)),
            ConfirmationTier::Announce
        );
        let strict = GatePolicy {
            warning_veto_forces_confirm: true,
            ..Default::default()
        };
        assert_eq!(
            effective(strict.assess(unpark, &session, &status)),
            ConfirmationTier::Confirm
        );
    }

    #[test]
    fn responding_emergency_owns_effectors() {
        let r = registry();
        let status = SafetyStatus {
            responding: true,
            current_emergency: Some(Emergency::new(EmergencyKind::Rain, "rain", Utc::now())),
            ..Default::default()
        };
        let policy = GatePolicy::default();
        let session = SessionContext::default();
        assert_eq!(
            policy.assess(r.get("park_telescope").unwrap(), &session, &status),
            GateDecision::Reject(SafetyError::SafetyOverrideActive {
                tool: "park_telescope".into(),
                emergency: "RAIN".into(),
            })
        );
        // Session tools are not effector tools.
        assert!(matches!(
            policy.assess(r.get("stop_imaging").unwrap(), &session, &status),
            GateDecision::Proceed { .. }
        ));
    }

    #[test]
    fn manual_recovery_blocks_all_but_queries_and_safing_tools() {
        let r = registry();
        let status = SafetyStatus {
            manual_recovery: vec!["manual_recovery:rain".into()],
            ..vetoed(VetoTier::Critical)
        };
        let policy = GatePolicy::default();
        let session = SessionContext::default();
        for blocked in ["start_imaging", "unpark_telescope", "open_enclosure"] {
            assert!(
                matches!(
                    policy.assess(r.get(blocked).unwrap(), &session, &status),
                    GateDecision::Reject(SafetyError::ManualRecoveryRequired { .. })
                ),
                "{blocked} should be refused"
            );
        }
        assert!(matches!(
            policy.assess(r.get("get_status").unwrap(), &session, &status),
            GateDecision::Proceed { .. }
        ));
        for safing in ["park_telescope", "close_enclosure", "stop_imaging"] {
            assert_eq!(
                effective(policy.assess(r.get(safing).unwrap(), &session, &status)),
                ConfirmationTier::Confirm,
                "{safing} should stay available"
            );
        }
    }

    #[test]
    fn closing_up_in_the_rain_needs_one_confirmation() {
        let r = registry();
        let policy = GatePolicy::default();
        let status = vetoed(VetoTier::Critical);
        let imaging = SessionContext {
            imaging_active: true,
            ..Default::default()
        };
        for tool in ["close_enclosure", "park_telescope"] {
            match policy.assess(r.get(tool).unwrap(), &imaging, &status) {
                GateDecision::Proceed {
                    effective, veto_note, ..
                } => {
                    assert_eq!(effective, ConfirmationTier::Confirm, "{tool}");
                    assert!(veto_note.is_some());
                }
                other => panic!("{tool}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn slew_needs_a_target_above_the_altitude_limit() {
        let r = registry();
        let policy = GatePolicy::default();
        let slew = r.get("slew_to").unwrap();
        let session = SessionContext::default();
        let status = SafetyStatus::default();

        assert!(matches!(
            policy.assess(slew, &session, &status),
            GateDecision::Reject(SafetyError::InterlockBlocked { .. })
        ));
        match policy.assess_with(slew, &ToolArgs::slew(4.5, 180.0), &session, &status) {
            GateDecision::Reject(err) => {
                assert_eq!(
                    err.to_string(),
                    "Cannot run 'slew_to': target altitude 4.5° is below the minimum 10.0°"
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            policy.assess_with(slew, &ToolArgs::slew(f64::NAN, 180.0), &session, &status),
            GateDecision::Reject(SafetyError::InterlockBlocked { .. })
        ));
        assert_eq!(
            effective(policy.assess_with(slew, &ToolArgs::slew(45.0, 180.0), &session, &status)),
            ConfirmationTier::Announce
        );
    }

    #[test]
    fn unpark_needs_an_open_enclosure_and_charge() {
        let r = registry();
        let policy = GatePolicy::default();
        let unpark = r.get("unpark_telescope").unwrap();
        let session = SessionContext::default();
        let with_plant = |enclosure_open, battery_percent| SafetyStatus {
            plant: PlantState {
                enclosure_open,
                battery_percent,
            },
            ..Default::default()
        };

        match policy.assess(unpark, &session, &with_plant(Some(false), Some(90.0))) {
            GateDecision::Reject(SafetyError::InterlockBlocked { reason, .. }) => {
                assert!(reason.contains("enclosure is closed"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match policy.assess(unpark, &session, &with_plant(Some(true), Some(30.0))) {
            GateDecision::Reject(SafetyError::InterlockBlocked { reason, .. }) => {
                assert!(reason.contains("UPS charge 30%"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            policy.assess(unpark, &session, &with_plant(Some(true), Some(90.0))),
            GateDecision::Proceed { .. }
        ));
        // Unknown plant facts do not block.
        assert!(matches!(
            policy.assess(unpark, &session, &with_plant(None, None)),
            GateDecision::Proceed { .. }
        ));
    }

    #[test]
    fn opening_needs_charge_and_is_vetoed_by_weather() {
        let r = registry();
        let policy = GatePolicy::default();
        let open = r.get("open_enclosure").unwrap();
        let session = SessionContext::default();
        let low = SafetyStatus {
            plant: PlantState {
                enclosure_open: Some(false),
                battery_percent: Some(20.0),
            },
            ..Default::default()
        };
        assert!(matches!(
            policy.assess(open, &session, &low),
            GateDecision::Reject(SafetyError::InterlockBlocked { .. })
        ));
        assert!(matches!(
            policy.assess(open, &session, &vetoed(VetoTier::Critical)),
            GateDecision::Reject(SafetyError::VetoActive { .. })
        ));
        // Closing is never held back by a low battery.
        assert!(matches!(
            policy.assess(r.get("close_enclosure").unwrap(), &session, &low),
            GateDecision::Proceed { .. }
        ));
    }

    #[test]
    fn second_round_prompt_names_phrase() {
        let r = registry();
        let policy = GatePolicy::default();
        let park = r.get("park_telescope").unwrap();
        assert_eq!(
            policy.prompt(park, 2, None),
            "To proceed, say 'confirm park telescope'."
        );
        assert_eq!(
            policy.valid_responses(park, 2),
            vec!["confirm park telescope".to_string(), "cancel".to_string()]
        );
    }
}
