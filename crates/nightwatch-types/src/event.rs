//! Bus events and the supervisor status snapshot.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::{VerdictTransition, VetoTier};
use crate::confirmation::{ConfirmationOutcome, ConfirmationTier, SessionContext};
use crate::emergency::{Emergency, EmergencyKind, EmergencyState};
use crate::veto::{ClearedBy, Veto};

/// Unified event wrapper for the in-process event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"nightwatch-runtime::supervisor"`
    pub source: String,
    pub payload: SafetyEvent,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: SafetyEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Alert severity surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

/// Audit log partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Veto,
    Emergency,
    Confirmation,
    Operator,
    Alert,
}

impl AuditCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditCategory::Veto => "veto",
            AuditCategory::Emergency => "emergency",
            AuditCategory::Confirmation => "confirmation",
            AuditCategory::Operator => "operator",
            AuditCategory::Alert => "alert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "veto" => Some(AuditCategory::Veto),
            "emergency" => Some(AuditCategory::Emergency),
            "confirmation" => Some(AuditCategory::Confirmation),
            "operator" => Some(AuditCategory::Operator),
            "alert" => Some(AuditCategory::Alert),
            _ => None,
        }
    }
}

/// Everything the supervisory core announces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum SafetyEvent {
    VerdictChanged(VerdictTransition),
    VetoRaised {
        reason: String,
        tier: VetoTier,
        detail: String,
    },
    VetoEscalated {
        reason: String,
        from: VetoTier,
        to: VetoTier,
    },
    /// Condition violated again during holdoff; countdown cancelled.
    VetoRetriggered { reason: String },
    HoldoffStarted {
        reason: String,
        until: DateTime<Utc>,
        auto_clearable: bool,
    },
    /// Holdoff done on a veto that needs an operator clear.
    ReadyToClear { reason: String },
    VetoCleared { reason: String, by: ClearedBy },
    EmergencyTransition {
        id: Uuid,
        kind: EmergencyKind,
        from: Option<EmergencyState>,
        to: EmergencyState,
    },
    EmergencyPreempted {
        id: Uuid,
        kind: EmergencyKind,
        by: EmergencyKind,
    },
    EStopTriggered { source: String },
    ThresholdsUpdated { count: usize, operator: String },
    ConfirmationResolved {
        tool: String,
        base_tier: ConfirmationTier,
        effective_tier: ConfirmationTier,
        outcome: ConfirmationOutcome,
        detail: Option<String>,
    },
    Announcement { text: String },
    Alert { level: AlertLevel, message: String },
}

impl SafetyEvent {
    /// Category under which the event is written to the audit log, or `None`
    /// for events that are only broadcast.
    pub fn audit_category(&self) -> Option<AuditCategory> {
        match self {
            SafetyEvent::VerdictChanged(_) | SafetyEvent::Announcement { .. } => None,
            SafetyEvent::VetoRaised { .. }
            | SafetyEvent::VetoEscalated { .. }
            | SafetyEvent::VetoRetriggered { .. }
            | SafetyEvent::HoldoffStarted { .. }
            | SafetyEvent::ReadyToClear { .. }
            | SafetyEvent::VetoCleared { .. } => Some(AuditCategory::Veto),
            SafetyEvent::EmergencyTransition { .. } | SafetyEvent::EmergencyPreempted { .. } => {
                Some(AuditCategory::Emergency)
            }
            SafetyEvent::ConfirmationResolved { .. } => Some(AuditCategory::Confirmation),
            SafetyEvent::EStopTriggered { .. } | SafetyEvent::ThresholdsUpdated { .. } => {
                Some(AuditCategory::Operator)
            }
            SafetyEvent::Alert { .. } => Some(AuditCategory::Alert),
        }
    }

    /// Short key used to index audit entries: a veto reason, a tool name or
    /// an emergency kind.
    pub fn tag(&self) -> String {
        match self {
            SafetyEvent::VerdictChanged(t) => t.reason().to_string(),
            SafetyEvent::VetoRaised { reason, .. }
            | SafetyEvent::VetoEscalated { reason, .. }
            | SafetyEvent::VetoRetriggered { reason }
            | SafetyEvent::HoldoffStarted { reason, .. }
            | SafetyEvent::ReadyToClear { reason }
            | SafetyEvent::VetoCleared { reason, .. } => reason.clone(),
            SafetyEvent::EmergencyTransition { kind, .. }
            | SafetyEvent::EmergencyPreempted { kind, .. } => kind.to_string(),
            SafetyEvent::EStopTriggered { .. } => EmergencyKind::EStop.to_string(),
            SafetyEvent::ThresholdsUpdated { .. } => "thresholds".to_string(),
            SafetyEvent::ConfirmationResolved { tool, .. } => tool.clone(),
            SafetyEvent::Announcement { .. } => "announcement".to_string(),
            SafetyEvent::Alert { level, .. } => format!("{level:?}").to_lowercase(),
        }
    }
}

impl fmt::Display for SafetyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyEvent::VerdictChanged(t) => match t.from {
                Some(from) => write!(f, "{}: {} -> {}", t.reason(), from, t.to),
                None => write!(f, "{}: {}", t.reason(), t.to),
            },
            SafetyEvent::VetoRaised {
                reason,
                tier,
                detail,
            } => write!(f, "veto raised [{tier}] {reason}: {detail}"),
            SafetyEvent::VetoEscalated { reason, from, to } => {
                write!(f, "veto {reason} escalated {from} -> {to}")
            }
            SafetyEvent::VetoRetriggered { reason } => {
                write!(f, "veto {reason} re-triggered, holdoff cancelled")
            }
            SafetyEvent::HoldoffStarted {
                reason,
                until,
                auto_clearable,
            } => write!(
                f,
                "holdoff for {reason} until {} ({})",
                until.format("%H:%M:%S"),
                if *auto_clearable { "auto-clear" } else { "operator clear" }
            ),
            SafetyEvent::ReadyToClear { reason } => {
                write!(f, "veto {reason} ready to clear by operator")
            }
            SafetyEvent::VetoCleared { reason, by } => write!(f, "veto {reason} cleared ({by})"),
            SafetyEvent::EmergencyTransition { kind, from, to, .. } => match from {
                Some(from) => write!(f, "emergency {kind}: {from} -> {to}"),
                None => write!(f, "emergency {kind}: {to}"),
            },
            SafetyEvent::EmergencyPreempted { kind, by, .. } => {
                write!(f, "emergency {kind} preempted by {by}")
            }
            SafetyEvent::EStopTriggered { source } => write!(f, "E-STOP triggered by {source}"),
            SafetyEvent::ThresholdsUpdated { count, operator } => {
                write!(f, "{count} thresholds loaded by {operator}")
            }
            SafetyEvent::ConfirmationResolved {
                tool,
                effective_tier,
                outcome,
                detail,
                ..
            } => match detail {
                Some(d) => write!(f, "{tool} [{effective_tier}] {outcome}: {d}"),
                None => write!(f, "{tool} [{effective_tier}] {outcome}"),
            },
            SafetyEvent::Announcement { text } => f.write_str(text),
            SafetyEvent::Alert { level, message } => write!(f, "{level:?}: {message}"),
        }
    }
}

/// Physical facts the command interlocks read. Unknown facts never block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PlantState {
    pub enclosure_open: Option<bool>,
    /// Fresh UPS charge in percent.
    pub battery_percent: Option<f64>,
}

/// Point-in-time view of the supervisory core, published after every
/// processed message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub active_tier: Option<VetoTier>,
    pub vetoes: Vec<Veto>,
    /// Most urgent live emergency: halted, then responding, then recovering.
    pub current_emergency: Option<Emergency>,
    pub responding: bool,
    pub estop_latched: bool,
    /// Veto reasons of emergencies waiting for manual recovery.
    pub manual_recovery: Vec<String>,
    /// Incremented whenever an emergency starts responding or halts.
    pub emergency_epoch: u64,
    pub session: SessionContext,
    pub plant: PlantState,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SafetyStatus {
    pub fn reasons(&self) -> Vec<String> {
        self.vetoes.iter().map(|v| v.reason.clone()).collect()
    }

    /// Sentence listing every active veto, for prompts and rejections.
    pub fn veto_summary(&self) -> String {
        if self.vetoes.is_empty() {
            return "No active vetoes.".to_string();
        }
        let parts: Vec<String> = self
            .vetoes
            .iter()
            .map(|v| format!("{} ({})", v.detail, v.tier))
            .collect();
        format!("Active vetoes: {}.", parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdicts_and_announcements_are_not_audited() {
        let e = SafetyEvent::Announcement {
            text: "Unparking.".into(),
        };
        assert_eq!(e.audit_category(), None);
        let e = SafetyEvent::VetoCleared {
            reason: "wind".into(),
            by: ClearedBy::Recovery,
        };
        assert_eq!(e.audit_category(), Some(AuditCategory::Veto));
        assert_eq!(e.tag(), "wind");
    }

    #[test]
    fn audit_category_string_roundtrip() {
        for cat in [
            AuditCategory::Veto,
            AuditCategory::Emergency,
            AuditCategory::Confirmation,
            AuditCategory::Operator,
            AuditCategory::Alert,
        ] {
            assert_eq!(AuditCategory::parse(cat.as_str()), Some(cat));
        }
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let event = Event::new(
            "nightwatch-runtime::supervisor",
            SafetyEvent::EStopTriggered {
                source: "console".into(),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"e_stop_triggered\""));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
    }

    #[test]
    fn empty_status_summary() {
        assert_eq!(SafetyStatus::default().veto_summary(), "No active vetoes.");
    }
}
