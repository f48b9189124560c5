//! Per-node alert confirmation.
//!
//! A non-normal status only becomes a *confirmed* alert once it has been
//! observed continuously for the confirmation window. Any change of status
//! restarts the timer; a return to normal discards it. Timers compare the
//! processing timestamps passed in by the caller, so there is nothing to
//! schedule or cancel.

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;

use crate::models::AlertStatus;

// ---

/// Timer for a node's current non-normal status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertTimerState {
    // ---
    pub status: AlertStatus,
    pub start_time: DateTime<Utc>,
    pub confirmed: bool,
}

impl AlertTimerState {
    fn started(status: AlertStatus, at: DateTime<Utc>) -> Self {
        Self {
            status,
            start_time: at,
            confirmed: false,
        }
    }
}

#[derive(Debug)]
pub struct ConfirmationTracker {
    // ---
    window: TimeDelta,
    timers: DashMap<String, AlertTimerState>,
}

impl ConfirmationTracker {
    // ---
    pub fn new(window: TimeDelta) -> Self {
        Self {
            window,
            timers: DashMap::new(),
        }
    }

    /// Feed one classified reading for `node_id` observed at `now`.
    ///
    /// Returns whether the node is in a confirmed alert after this reading.
    /// Callers must serialize calls for the same node.
    pub fn observe(&self, node_id: &str, status: AlertStatus, now: DateTime<Utc>) -> bool {
        // ---
        if !status.is_alert() {
            self.timers.remove(node_id);
            return false;
        }

        let mut timer = self
            .timers
            .entry(node_id.to_string())
            .or_insert_with(|| AlertTimerState::started(status, now));

        if timer.status != status {
            *timer = AlertTimerState::started(status, now);
        }

        if !timer.confirmed && now.signed_duration_since(timer.start_time) >= self.window {
            timer.confirmed = true;
        }
        timer.confirmed
    }

    #[cfg(test)]
    pub fn timer(&self, node_id: &str) -> Option<AlertTimerState> {
        self.timers.get(node_id).map(|t| *t)
    }

    pub fn active_alerts(&self) -> usize {
        self.timers.len()
    }
}
