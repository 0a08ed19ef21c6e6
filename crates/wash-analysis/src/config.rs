//! Run configuration for a detection pass.
//!
//! Every option has a default so a partial JSON file is a valid config.
//! [`DetectionConfig::validate`] must pass before any detector runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default suspicion threshold.
pub const DEFAULT_SUSPICION_THRESHOLD: f64 = 0.8;
/// Default minimum total degree for a neighborhood seed.
pub const DEFAULT_MIN_DEGREE: usize = 3;
/// Default maximum cycle length in nodes.
pub const DEFAULT_MAX_CYCLE_DEPTH: usize = 5;
/// Default visited-node budget per neighborhood expansion.
pub const DEFAULT_MAX_NEIGHBORHOOD_VISITS: usize = 20;

/// A configuration option outside its valid range.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid `{option}`: {reason}")]
    OutOfRange {
        option: &'static str,
        reason: String,
    },
}

/// Which detectors a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Cycle,
    Neighbor,
    #[default]
    Both,
}

impl Algorithm {
    pub fn runs_cycle(self) -> bool {
        matches!(self, Self::Cycle | Self::Both)
    }

    pub fn runs_neighbor(self) -> bool {
        matches!(self, Self::Neighbor | Self::Both)
    }
}

impl std::str::FromStr for Algorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cycle" | "circle" => Ok(Self::Cycle),
            "neighbor" | "neighbour" => Ok(Self::Neighbor),
            "both" => Ok(Self::Both),
            other => Err(ConfigError::OutOfRange {
                option: "algorithm",
                reason: format!("unknown algorithm '{other}'; use 'cycle', 'neighbor' or 'both'"),
            }),
        }
    }
}

/// Options recognized by the detection pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Minimum suspicion rate for a finding, in `[0, 1]`.
    pub suspicion_threshold: f64,
    /// Minimum in+out degree for a neighborhood seed.
    pub min_degree_for_key_node: usize,
    /// Maximum number of nodes in an enumerated cycle.
    pub max_cycle_depth: usize,
    /// Restrict cycle start nodes to the top-N by degree when the graph is larger.
    pub max_candidate_nodes: Option<usize>,
    /// Maximum nodes marked visited by one neighborhood expansion.
    pub max_neighborhood_visits: usize,
    /// Detectors to run.
    pub algorithm: Algorithm,
    /// Wall-clock limit for the whole detection pass.
    pub timeout_secs: Option<u64>,
    /// Maximum search steps (stack pops plus queue pops) per detector.
    pub max_search_steps: Option<u64>,
    /// Enumerate cycles per start node on the rayon pool.
    pub parallel: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            suspicion_threshold: DEFAULT_SUSPICION_THRESHOLD,
            min_degree_for_key_node: DEFAULT_MIN_DEGREE,
            max_cycle_depth: DEFAULT_MAX_CYCLE_DEPTH,
            max_candidate_nodes: None,
            max_neighborhood_visits: DEFAULT_MAX_NEIGHBORHOOD_VISITS,
            algorithm: Algorithm::Both,
            timeout_secs: None,
            max_search_steps: None,
            parallel: false,
        }
    }
}

impl DetectionConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the JSON is malformed or a value is out of range.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::OutOfRange {
            option: "config",
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every option against its valid range.
    ///
    /// # Errors
    /// Returns [`ConfigError`] naming the first offending option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let out_of_range = |option, reason: &str| {
            Err(ConfigError::OutOfRange {
                option,
                reason: reason.to_string(),
            })
        };

        if !(0.0..=1.0).contains(&self.suspicion_threshold) {
            return out_of_range("suspicion_threshold", "must be within [0, 1]");
        }
        if self.min_degree_for_key_node < 1 {
            return out_of_range("min_degree_for_key_node", "must be at least 1");
        }
        if self.max_cycle_depth < 3 {
            return out_of_range("max_cycle_depth", "must be at least 3");
        }
        if self.max_candidate_nodes == Some(0) {
            return out_of_range("max_candidate_nodes", "must be at least 1 when set");
        }
        if self.max_neighborhood_visits < 1 {
            return out_of_range("max_neighborhood_visits", "must be at least 1");
        }
        if self.timeout_secs == Some(0) {
            return out_of_range("timeout_secs", "must be positive when set");
        }
        if self.max_search_steps == Some(0) {
            return out_of_range("max_search_steps", "must be at least 1 when set");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DetectionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.suspicion_threshold, 0.8);
        assert_eq!(config.max_cycle_depth, 5);
        assert_eq!(config.max_neighborhood_visits, 20);
        assert_eq!(config.algorithm, Algorithm::Both);
    }

    #[test]
    fn threshold_out_of_range_names_option() {
        let config = DetectionConfig {
            suspicion_threshold: 1.5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("suspicion_threshold"));

        let nan = DetectionConfig {
            suspicion_threshold: f64::NAN,
            ..Default::default()
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn shallow_cycle_depth_rejected() {
        let config = DetectionConfig {
            max_cycle_depth: 2,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                option: "max_cycle_depth",
                ..
            })
        ));
    }

    #[test]
    fn zero_budgets_rejected() {
        for config in [
            DetectionConfig {
                max_neighborhood_visits: 0,
                ..Default::default()
            },
            DetectionConfig {
                min_degree_for_key_node: 0,
                ..Default::default()
            },
            DetectionConfig {
                max_candidate_nodes: Some(0),
                ..Default::default()
            },
            DetectionConfig {
                timeout_secs: Some(0),
                ..Default::default()
            },
            DetectionConfig {
                max_search_steps: Some(0),
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config = DetectionConfig::from_json(r#"{"suspicion_threshold": 0.5, "algorithm": "cycle"}"#)
            .expect("partial config should parse");
        assert_eq!(config.suspicion_threshold, 0.5);
        assert_eq!(config.algorithm, Algorithm::Cycle);
        assert_eq!(config.max_neighborhood_visits, 20);
    }

    #[test]
    fn json_validation_runs() {
        assert!(DetectionConfig::from_json(r#"{"max_cycle_depth": 1}"#).is_err());
        assert!(DetectionConfig::from_json("not json").is_err());
    }

    #[test]
    fn algorithm_from_str() {
        assert_eq!("circle".parse::<Algorithm>(), Ok(Algorithm::Cycle));
        assert_eq!("Neighbor".parse::<Algorithm>(), Ok(Algorithm::Neighbor));
        assert!("bogus".parse::<Algorithm>().is_err());
        assert!(Algorithm::Both.runs_cycle() && Algorithm::Both.runs_neighbor());
        assert!(!Algorithm::Cycle.runs_neighbor());
    }
}
