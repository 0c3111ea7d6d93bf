//! Consensus configuration
//!
//! Every tunable of the gossip engine, the validator and the consolidator
//! lives here. All sections deserialize with defaults so a partial JSON
//! document only needs to name the values it changes.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for one instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub gossip: GossipConfig,
    pub validation: ValidationConfig,
    pub consolidation: ConsolidationConfig,
}

impl ConsensusConfig {
    /// Parse from JSON and validate
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ConsensusConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.gossip.validate()?;
        self.validation.validate()?;
        self.consolidation.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Peers that receive the full record each round
    pub fanout: usize,
    /// Peers that receive only the record id each round
    pub digest_fanout: usize,
    pub interval_ms: u64,
    pub peer_timeout_ms: u64,
    /// How long a failed peer stays out of the selection pool
    pub cooldown_ms: u64,
    /// Run anti-entropy every N scheduler ticks
    pub anti_entropy_every: u64,
    /// Rounds after which a record stops being pushed eagerly
    pub max_push_rounds: u32,
    pub max_records_per_pull: usize,
    /// Multiplicative score penalty applied on peer failure
    pub failure_penalty: f64,
    /// Additive score reward applied on peer success
    pub success_reward: f64,
    pub min_selection_weight: f64,
    /// Fixed seed for reproducible peer selection (tests)
    pub rng_seed: Option<u64>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 3,
            digest_fanout: 9,
            interval_ms: 500,
            peer_timeout_ms: 5000,
            cooldown_ms: 30_000,
            anti_entropy_every: 10,
            max_push_rounds: 4,
            max_records_per_pull: 256,
            failure_penalty: 0.5,
            success_reward: 0.1,
            min_selection_weight: 0.05,
            rng_seed: None,
        }
    }
}

impl GossipConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Expected rounds for a record to reach `n` instances: ⌈log_fanout(n)⌉
    pub fn rounds_to_reach(&self, n: usize) -> u32 {
        if n <= 1 {
            return 0;
        }
        if self.fanout <= 1 {
            return (n - 1) as u32;
        }
        // Integer arithmetic avoids log() rounding at exact powers
        let mut reach: usize = 1;
        let mut rounds = 0;
        while reach < n {
            reach = reach.saturating_mul(self.fanout);
            rounds += 1;
        }
        rounds
    }

    /// Expected wall time for a record to reach `n` instances
    pub fn estimated_propagation(&self, n: usize) -> Duration {
        self.interval() * self.rounds_to_reach(n)
    }

    fn validate(&self) -> Result<()> {
        if self.fanout == 0 {
            return Err(Error::Config("gossip.fanout must be at least 1".into()));
        }
        if self.interval_ms == 0 || self.peer_timeout_ms == 0 {
            return Err(Error::Config("gossip intervals must be non-zero".into()));
        }
        if self.anti_entropy_every == 0 {
            return Err(Error::Config("gossip.anti_entropy_every must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.failure_penalty) {
            return Err(Error::Config("gossip.failure_penalty must be in [0, 1)".into()));
        }
        if !(0.0..=1.0).contains(&self.success_reward) {
            return Err(Error::Config("gossip.success_reward must be in [0, 1]".into()));
        }
        if !(self.min_selection_weight > 0.0 && self.min_selection_weight <= 1.0) {
            return Err(Error::Config("gossip.min_selection_weight must be in (0, 1]".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Fraction of votes dropped from each end before averaging
    pub trim_percent: f64,
    pub validation_threshold: f64,
    /// Total population; defaults to known peers plus self
    pub population: Option<usize>,
    pub collection_window_ms: u64,
    pub max_votes_per_window: usize,
    /// Distance from the median beyond which a voter is reported as an outlier
    pub outlier_tolerance: f64,
    /// Trim at least ⌊(n-1)/3⌋ votes per side so the tolerated Byzantine
    /// share can never reach the mean
    pub enforce_byzantine_budget: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            trim_percent: 0.2,
            validation_threshold: 0.7,
            population: None,
            collection_window_ms: 5000,
            max_votes_per_window: 1024,
            outlier_tolerance: 0.3,
            enforce_byzantine_budget: true,
        }
    }
}

impl ValidationConfig {
    pub fn collection_window(&self) -> Duration {
        Duration::from_millis(self.collection_window_ms)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..0.5).contains(&self.trim_percent) {
            return Err(Error::Config("validation.trim_percent must be in [0, 0.5)".into()));
        }
        if !(0.0..=1.0).contains(&self.validation_threshold) {
            return Err(Error::Config("validation.validation_threshold must be in [0, 1]".into()));
        }
        if self.population == Some(0) {
            return Err(Error::Config("validation.population must be positive".into()));
        }
        if self.max_votes_per_window == 0 {
            return Err(Error::Config("validation.max_votes_per_window must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Cosine similarity at or above which two records cluster together
    pub similarity_threshold: f64,
    pub max_iterations: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.88,
            max_iterations: 10,
        }
    }
}

impl ConsolidationConfig {
    fn validate(&self) -> Result<()> {
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(Error::Config("consolidation.similarity_threshold must be in (0, 1]".into()));
        }
        if self.max_iterations == 0 {
            return Err(Error::Config("consolidation.max_iterations must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ConsensusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gossip.fanout, 3);
        assert_eq!(config.validation.trim_percent, 0.2);
        assert_eq!(config.validation.validation_threshold, 0.7);
        assert_eq!(config.consolidation.max_iterations, 10);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ConsensusConfig::from_json(r#"{"gossip": {"fanout": 4}}"#).unwrap();
        assert_eq!(config.gossip.fanout, 4);
        assert_eq!(config.gossip.interval_ms, 500);
        assert_eq!(config.validation, ValidationConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ConsensusConfig::from_json(r#"{"validation": {"trim_percent": 0.6}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = ConsensusConfig::from_json(r#"{"gossip": {"fanout": 0}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        assert!(matches!(ConsensusConfig::from_json("not json"), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_rounds_to_reach() {
        let gossip = GossipConfig::default();
        assert_eq!(gossip.rounds_to_reach(1), 0);
        assert_eq!(gossip.rounds_to_reach(3), 1);
        assert_eq!(gossip.rounds_to_reach(10), 3);
        assert_eq!(gossip.rounds_to_reach(27), 3);
        assert_eq!(gossip.rounds_to_reach(28), 4);
        assert_eq!(gossip.estimated_propagation(27), Duration::from_millis(1500));
    }

    #[test]
    fn test_json_roundtrip() {
        let mut config = ConsensusConfig::default();
        config.gossip.rng_seed = Some(42);
        let json = config.to_json().unwrap();
        assert_eq!(ConsensusConfig::from_json(&json).unwrap(), config);
    }
}
