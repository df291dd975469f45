//! Monitoring alerts with per-(kind, key) cooldown.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default cooldown between alerts for the same (kind, key).
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(15 * 60);

/// Retained alert history.
const HISTORY_CAP: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

/// One monitoring notification.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub severity: AlertSeverity,
    pub kind: String,
    pub key: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
}

struct LedgerState {
    cooldowns: HashMap<(String, String), DateTime<Utc>>,
    history: VecDeque<AlertEvent>,
}

/// Emits alerts, suppressing repeats inside the cooldown window.
///
/// All emission goes through one mutex, which also gives alerts for a
/// given (kind, key) a total order.
pub struct AlertLedger {
    cooldown: Duration,
    state: Mutex<LedgerState>,
}

impl Default for AlertLedger {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl AlertLedger {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            state: Mutex::new(LedgerState {
                cooldowns: HashMap::new(),
                history: VecDeque::new(),
            }),
        }
    }

    /// Emit an alert unless the (kind, key) pair is cooling down.
    /// Returns the event when it was actually emitted.
    pub fn emit(
        &self,
        severity: AlertSeverity,
        kind: &str,
        key: &str,
        detail: impl Into<String>,
    ) -> Option<AlertEvent> {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let ledger_key = (kind.to_string(), key.to_string());
        if let Some(until) = state.cooldowns.get(&ledger_key)
            && now < *until
        {
            tracing::debug!(kind, key, "alert suppressed by cooldown");
            return None;
        }

        let cooldown_until = now
            + chrono::Duration::from_std(self.cooldown).unwrap_or(chrono::Duration::minutes(15));
        let event = AlertEvent {
            severity,
            kind: kind.to_string(),
            key: key.to_string(),
            detail: detail.into(),
            created_at: now,
            cooldown_until,
        };
        state.cooldowns.insert(ledger_key, cooldown_until);
        if state.history.len() >= HISTORY_CAP {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());

        tracing::warn!(
            severity = ?event.severity,
            kind,
            key,
            detail = %event.detail,
            "alert emitted"
        );
        Some(event)
    }

    /// Recent alerts, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AlertEvent> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.history.iter().rev().take(limit).cloned().collect()
    }
}
