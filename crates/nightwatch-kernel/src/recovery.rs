//! [`RecoveryManager`] – holdoff countdowns for cleared conditions.
//!
//! A countdown starts when a vetoed condition reads safe again and is
//! cancelled if the condition is violated before it expires. Call
//! [`RecoveryManager::tick`] from the supervisor loop; each expired countdown
//! is reported once, telling the caller whether the veto may be removed
//! automatically or must wait for an operator.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Result of an expired countdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Remove the veto.
    AutoClear(String),
    /// Mark the veto ready and wait for the operator.
    AwaitOperator(String),
}

struct Countdown {
    until: DateTime<Utc>,
    auto_clearable: bool,
}

/// `now + span`, saturating at the latest representable instant.
pub(crate) fn deadline(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ────────────────────────────────────────────────────────────────────────────
// RecoveryManager
// ────────────────────────────────────────────────────────────────────────────

/// Tracks one countdown per veto reason.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use chrono::Utc;
/// use nightwatch_kernel::recovery::{RecoveryManager, RecoveryOutcome};
///
/// let mut recovery = RecoveryManager::new();
/// let now = Utc::now();
/// recovery.start("wind", Duration::from_secs(600), true, now);
///
/// assert!(recovery.tick(now).is_empty());
/// let later = now + chrono::Duration::seconds(600);
/// assert_eq!(recovery.tick(later), vec![RecoveryOutcome::AutoClear("wind".into())]);
/// ```
#[derive(Default)]
pub struct RecoveryManager {
    countdowns: HashMap<String, Countdown>,
}

impl RecoveryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the countdown for `reason` and return its deadline.
    pub fn start(
        &mut self,
        reason: &str,
        holdoff: Duration,
        auto_clearable: bool,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let until = deadline(now, holdoff);
        info!(reason, holdoff_secs = holdoff.as_secs(), auto_clearable, "holdoff started");
        self.countdowns.insert(
            reason.to_string(),
            Countdown {
                until,
                auto_clearable,
            },
        );
        until
    }

    /// Cancel a running countdown. Returns `true` when one was running.
    pub fn cancel(&mut self, reason: &str) -> bool {
        let cancelled = self.countdowns.remove(reason).is_some();
        if cancelled {
            debug!(reason, "holdoff cancelled");
        }
        cancelled
    }

    /// Remove and report every countdown that has expired by `now`, ordered
    /// by reason.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<RecoveryOutcome> {
        let mut expired: Vec<String> = self
            .countdowns
            .iter()
            .filter(|(_, c)| c.until <= now)
            .map(|(reason, _)| reason.clone())
            .collect();
        expired.sort();

        expired
            .into_iter()
            .filter_map(|reason| {
                let countdown = self.countdowns.remove(&reason)?;
                Some(if countdown.auto_clearable {
                    RecoveryOutcome::AutoClear(reason)
                } else {
                    RecoveryOutcome::AwaitOperator(reason)
                })
            })
            .collect()
    }

    /// Time left on the countdown for `reason`.
    pub fn remaining(&self, reason: &str, now: DateTime<Utc>) -> Option<Duration> {
        self.countdowns
            .get(reason)
            .map(|c| (c.until - now).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn is_counting(&self, reason: &str) -> bool {
        self.countdowns.contains_key(reason)
    }

    pub fn len(&self) -> usize {
        self.countdowns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.countdowns.is_empty()
    }
}
