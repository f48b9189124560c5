//! Data models for the live water-level pipeline.
//!
//! Everything that crosses a boundary (HTTP body, push channel, snapshot
//! file) is defined here with its wire shape. Field names are camelCase on
//! the wire because the device firmware and dashboards already speak that.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---

/// Severity band assigned to a single reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Normal,
    Warning,
    Danger,
}

impl AlertStatus {
    // ---
    pub fn is_alert(self) -> bool {
        !matches!(self, AlertStatus::Normal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Normal => "normal",
            AlertStatus::Warning => "warning",
            AlertStatus::Danger => "danger",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Water levels (metres) at which a node enters each severity band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdProfile {
    // ---
    pub warning_level: f64,
    pub danger_level: f64,
}

impl ThresholdProfile {
    // ---
    /// Warning at 70% and danger at 90% of a node's flood threshold.
    pub fn from_threshold(threshold: f64) -> Self {
        Self {
            warning_level: threshold * 0.7,
            danger_level: threshold * 0.9,
        }
    }
}

/// Placeholder coordinates given to nodes created lazily by the throttle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Body of `POST /reading` as sent by a node.
///
/// Every field is optional at the serde level so that a missing field is
/// reported as a validation error instead of a generic JSON rejection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReading {
    // ---
    pub node_id: Option<String>,
    pub water_level: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A reading that passed validation and is ready for the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingReading {
    // ---
    pub node_id: String,
    pub water_level: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required fields: nodeId, waterLevel")]
    MissingFields,

    #[error("nodeId must not be blank")]
    BlankNodeId,
}

impl RawReading {
    // ---
    pub fn validate(self) -> Result<IncomingReading, ValidationError> {
        // ---
        let (Some(node_id), Some(water_level)) = (self.node_id, self.water_level) else {
            return Err(ValidationError::MissingFields);
        };

        let node_id = node_id.trim();
        if node_id.is_empty() {
            return Err(ValidationError::BlankNodeId);
        }

        Ok(IncomingReading {
            node_id: node_id.to_string(),
            water_level,
            timestamp: self.timestamp,
        })
    }
}

/// A classified reading as held in live state and pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveReading {
    // ---
    pub node_id: String,
    pub water_level: f64,
    pub timestamp: DateTime<Utc>,
    pub alert_status: AlertStatus,
    pub confirmed_alert: bool,
}

/// Current reading plus bounded, most-recent-first history for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLiveRecord {
    // ---
    pub current: LiveReading,
    pub history: VecDeque<LiveReading>,
    pub last_update: DateTime<Utc>,
}
