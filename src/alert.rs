//! Severity classification and per-node threshold resolution.
//!
//! There is one classifier. What varies is how a node's [`ThresholdProfile`]
//! is resolved, and that is chosen explicitly with `THRESHOLD_POLICY`:
//!
//! - `absolute`: every node uses the configured warning/danger levels.
//! - `relative`: each node's profile is 70%/90% of its own flood threshold,
//!   loaded from the durable store; unknown nodes use the default threshold.

use std::str::FromStr;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::models::{AlertStatus, ThresholdProfile};
use crate::Config;

// ---

/// Map a water level onto a severity band.
///
/// Total over all inputs: NaN, infinite and negative levels are classified
/// `Normal` and logged as sensor anomalies.
pub fn classify(water_level: f64, profile: &ThresholdProfile) -> AlertStatus {
    // ---
    if !water_level.is_finite() || water_level < 0.0 {
        warn!(water_level, "Anomalous water level reading, classifying as normal");
        return AlertStatus::Normal;
    }

    if water_level >= profile.danger_level {
        AlertStatus::Danger
    } else if water_level >= profile.warning_level {
        AlertStatus::Warning
    } else {
        AlertStatus::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdPolicy {
    Absolute,
    Relative,
}

impl FromStr for ThresholdPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "absolute" => Ok(ThresholdPolicy::Absolute),
            "relative" => Ok(ThresholdPolicy::Relative),
            other => Err(format!(
                "unknown threshold policy '{other}' (expected 'absolute' or 'relative')"
            )),
        }
    }
}

/// Resolves the threshold profile for any node name.
#[derive(Debug)]
pub struct Thresholds {
    // ---
    policy: ThresholdPolicy,
    absolute: ThresholdProfile,
    default_threshold: f64,
    node_thresholds: DashMap<String, f64>,
}

impl Thresholds {
    // ---
    pub fn new(policy: ThresholdPolicy, absolute: ThresholdProfile, default_threshold: f64) -> Self {
        Self {
            policy,
            absolute,
            default_threshold,
            node_thresholds: DashMap::new(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.threshold_policy,
            ThresholdProfile {
                warning_level: cfg.warning_level,
                danger_level: cfg.danger_level,
            },
            cfg.default_threshold,
        )
    }

    pub fn policy(&self) -> ThresholdPolicy {
        self.policy
    }

    pub fn default_threshold(&self) -> f64 {
        self.default_threshold
    }

    /// Never fails: nodes without a known threshold get the default profile.
    pub fn profile_for(&self, node_id: &str) -> ThresholdProfile {
        // ---
        match self.policy {
            ThresholdPolicy::Absolute => self.absolute,
            ThresholdPolicy::Relative => {
                let threshold = self
                    .node_thresholds
                    .get(node_id)
                    .map(|t| *t)
                    .unwrap_or(self.default_threshold);
                ThresholdProfile::from_threshold(threshold)
            }
        }
    }

    /// Record a node's flood threshold. Non-positive values are ignored.
    pub fn set_node_threshold(&self, node_id: &str, threshold: f64) {
        // ---
        if !(threshold.is_finite() && threshold > 0.0) {
            warn!(node_id, threshold, "Ignoring invalid node threshold");
            return;
        }
        self.node_thresholds.insert(node_id.to_string(), threshold);
    }

    pub fn load<I>(&self, thresholds: I) -> usize
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        // ---
        let mut loaded = 0;
        for (node_id, threshold) in thresholds {
            self.set_node_threshold(&node_id, threshold);
            loaded += 1;
        }
        debug!("Loaded {} node thresholds", loaded);
        loaded
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn profile() -> ThresholdProfile {
        ThresholdProfile {
            warning_level: 3.5,
            danger_level: 4.5,
        }
    }

    #[test]
    fn test_below_warning_is_normal() {
        // ---
        for level in [0.0, 1.2, 3.0, 3.499] {
            assert_eq!(classify(level, &profile()), AlertStatus::Normal);
        }
    }

    #[test]
    fn test_band_boundaries_are_inclusive() {
        // ---
        assert_eq!(classify(3.5, &profile()), AlertStatus::Warning);
        assert_eq!(classify(4.4, &profile()), AlertStatus::Warning);
        assert_eq!(classify(4.5, &profile()), AlertStatus::Danger);
        assert_eq!(classify(12.0, &profile()), AlertStatus::Danger);
    }

    #[test]
    fn test_anomalous_input_is_normal() {
        // ---
        assert_eq!(classify(f64::NAN, &profile()), AlertStatus::Normal);
        assert_eq!(classify(-1.0, &profile()), AlertStatus::Normal);
        assert_eq!(classify(f64::INFINITY, &profile()), AlertStatus::Normal);
    }

    #[test]
    fn test_policy_parsing() {
        // ---
        assert_eq!("absolute".parse::<ThresholdPolicy>(), Ok(ThresholdPolicy::Absolute));
        assert_eq!("Relative".parse::<ThresholdPolicy>(), Ok(ThresholdPolicy::Relative));
        assert!("percent".parse::<ThresholdPolicy>().is_err());
    }

    #[test]
    fn test_absolute_policy_ignores_node_thresholds() {
        // ---
        let thresholds = Thresholds::new(ThresholdPolicy::Absolute, profile(), 5.0);
        thresholds.set_node_threshold("node-a", 10.0);
        assert_eq!(thresholds.profile_for("node-a"), profile());
    }

    #[test]
    fn test_relative_policy_uses_node_threshold() {
        // ---
        let thresholds = Thresholds::new(ThresholdPolicy::Relative, profile(), 5.0);
        thresholds.set_node_threshold("node-a", 10.0);

        let known = thresholds.profile_for("node-a");
        assert!((known.warning_level - 7.0).abs() < 1e-9);
        assert!((known.danger_level - 9.0).abs() < 1e-9);

        // unknown nodes fall back to the default threshold
        let unknown = thresholds.profile_for("node-b");
        assert!((unknown.danger_level - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_threshold_is_ignored() {
        // ---
        let thresholds = Thresholds::new(ThresholdPolicy::Relative, profile(), 5.0);
        thresholds.set_node_threshold("node-a", 0.0);
        assert_eq!(thresholds.profile_for("node-a"), ThresholdProfile::from_threshold(5.0));
    }
}
