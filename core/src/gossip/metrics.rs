//! Gossip metrics and monitoring
//!
//! Tracks message propagation, rejected records and peer health for one
//! instance. The node worker owns the counters; callers get snapshots.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMetrics {
    /// Gossip rounds executed
    pub rounds: u64,

    /// Full records sent to eager peers
    pub pushes_sent: u64,

    /// Record ids sent to lazy peers
    pub digests_sent: u64,

    /// Records received that were new locally
    pub records_received: u64,

    /// Records received that were already held
    pub duplicates_received: u64,

    /// Records pulled in through PULL_RESPONSE
    pub records_pulled: u64,

    /// Records that failed integrity or authentication checks
    pub records_rejected: u64,

    pub votes_sent: u64,
    pub votes_received: u64,

    /// Votes refused: unknown voter, bad signature, out of range or
    /// implausible timestamp
    pub votes_rejected: u64,

    /// Votes parked until their record arrives
    pub votes_held_back: u64,

    pub anti_entropy_runs: u64,

    /// Sends or requests that failed or timed out
    pub peer_failures: u64,
}

impl GossipMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_receive(&mut self, is_duplicate: bool) {
        if is_duplicate {
            self.duplicates_received += 1;
        } else {
            self.records_received += 1;
        }
    }

    /// Fraction of received records that were duplicates
    pub fn duplicate_ratio(&self) -> f64 {
        let total = self.records_received + self.duplicates_received;
        if total == 0 {
            0.0
        } else {
            self.duplicates_received as f64 / total as f64
        }
    }

    /// Log a statistics summary
    pub fn log_summary(&self, instance: &crate::types::InstanceId) {
        tracing::info!(
            instance = %instance,
            rounds = self.rounds,
            pushes = self.pushes_sent,
            digests = self.digests_sent,
            received = self.records_received,
            duplicates = self.duplicates_received,
            rejected = self.records_rejected,
            votes_rejected = self.votes_rejected,
            peer_failures = self.peer_failures,
            "Gossip metrics summary"
        );
    }
}
