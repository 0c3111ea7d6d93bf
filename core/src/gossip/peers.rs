//! Known peers, reliability scores and randomized selection

use crate::config::GossipConfig;
use crate::types::{GossipPeer, InstanceId, PublicKeyBytes};
use rand::Rng;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PeerState {
    pub peer: GossipPeer,
    /// Excluded from selection until this instant
    pub cooldown_until: Option<Instant>,
    pub consecutive_failures: u32,
}

impl PeerState {
    fn is_available(&self, now: Instant) -> bool {
        self.cooldown_until.map(|until| now >= until).unwrap_or(true)
    }
}

/// Peer list of one instance
#[derive(Debug, Clone)]
pub struct PeerTable {
    peers: BTreeMap<InstanceId, PeerState>,
    config: GossipConfig,
}

impl PeerTable {
    pub fn new(config: GossipConfig) -> Self {
        Self {
            peers: BTreeMap::new(),
            config,
        }
    }

    /// Add a peer; returns false if it was already known
    pub fn add(&mut self, peer: GossipPeer) -> bool {
        if self.peers.contains_key(&peer.id) {
            return false;
        }
        self.peers.insert(
            peer.id.clone(),
            PeerState {
                peer,
                cooldown_until: None,
                consecutive_failures: 0,
            },
        );
        true
    }

    pub fn remove(&mut self, id: &InstanceId) -> bool {
        self.peers.remove(id).is_some()
    }

    pub fn get(&self, id: &InstanceId) -> Option<&PeerState> {
        self.peers.get(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Vote-signing key of a known peer
    pub fn public_key(&self, id: &InstanceId) -> Option<PublicKeyBytes> {
        self.peers.get(id).and_then(|s| s.peer.public_key)
    }

    pub fn ids(&self) -> impl Iterator<Item = &InstanceId> {
        self.peers.keys()
    }

    pub fn snapshot(&self) -> Vec<GossipPeer> {
        self.peers.values().map(|s| s.peer.clone()).collect()
    }

    /// Peers not cooling down
    pub fn available(&self, now: Instant) -> Vec<&InstanceId> {
        self.peers
            .iter()
            .filter(|(_, s)| s.is_available(now))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn is_available(&self, id: &InstanceId, now: Instant) -> bool {
        self.peers.get(id).map(|s| s.is_available(now)).unwrap_or(false)
    }

    /// Score down and bench a peer that failed or timed out
    pub fn mark_failed(&mut self, id: &InstanceId, now: Instant) {
        if let Some(state) = self.peers.get_mut(id) {
            state.peer.score *= 1.0 - self.config.failure_penalty;
            state.consecutive_failures += 1;
            state.cooldown_until = Some(now + self.config.cooldown());
            debug!(
                peer = %id,
                score = state.peer.score,
                failures = state.consecutive_failures,
                "Peer failed, cooling down"
            );
        }
    }

    pub fn mark_success(&mut self, id: &InstanceId) {
        if let Some(state) = self.peers.get_mut(id) {
            state.peer.score = (state.peer.score + self.config.success_reward).min(1.0);
            state.consecutive_failures = 0;
            state.cooldown_until = None;
        }
    }

    /// Lower a peer's score for misbehaviour without benching it
    pub fn penalize(&mut self, id: &InstanceId) {
        if let Some(state) = self.peers.get_mut(id) {
            state.peer.score *= 1.0 - self.config.failure_penalty;
        }
    }

    /// Draw up to `count` distinct available peers accepted by `eligible`
    ///
    /// Weighted sampling without replacement (Efraimidis-Spirakis): each
    /// candidate gets key `u^(1/w)` with `w = max(score, min_selection_weight)`
    /// and the largest keys win. Equal scores reduce to a uniform draw.
    pub fn select<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        count: usize,
        now: Instant,
        eligible: impl Fn(&InstanceId) -> bool,
    ) -> Vec<InstanceId> {
        if count == 0 {
            return Vec::new();
        }

        let mut keyed: Vec<(f64, &InstanceId)> = self
            .peers
            .iter()
            .filter(|(id, s)| s.is_available(now) && eligible(id))
            .map(|(id, s)| {
                let weight = s.peer.score.max(self.config.min_selection_weight);
                let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
                (u.powf(1.0 / weight), id)
            })
            .collect();

        keyed.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        keyed.into_iter().take(count).map(|(_, id)| id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn table(n: usize) -> PeerTable {
        let mut table = PeerTable::new(GossipConfig::default());
        for i in 0..n {
            table.add(GossipPeer::new(InstanceId::new(format!("p{}", i)), format!("local://p{}", i)));
        }
        table
    }

    #[test]
    fn test_select_without_replacement() {
        let table = table(10);
        let mut rng = StdRng::seed_from_u64(7);
        let picked = table.select(&mut rng, 3, Instant::now(), |_| true);
        assert_eq!(picked.len(), 3);
        let mut dedup = picked.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 3);

        // Asking for more than exist returns everyone once
        assert_eq!(table.select(&mut rng, 50, Instant::now(), |_| true).len(), 10);
    }

    #[test]
    fn test_cooldown_excludes_failed_peer() {
        let mut table = table(3);
        let now = Instant::now();
        let bad = InstanceId::new("p1");
        table.mark_failed(&bad, now);

        assert!(!table.is_available(&bad, now));
        assert_eq!(table.get(&bad).unwrap().peer.score, 0.5);

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            let picked = table.select(&mut rng, 3, now, |_| true);
            assert!(!picked.contains(&bad));
        }

        // Back in the pool once the cooldown elapses
        let later = now + GossipConfig::default().cooldown();
        assert!(table.is_available(&bad, later));

        table.mark_success(&bad);
        assert!((table.get(&bad).unwrap().peer.score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_low_score_selected_less_often() {
        let mut table = table(2);
        let now = Instant::now();
        for _ in 0..4 {
            table.penalize(&InstanceId::new("p0"));
        }

        let mut rng = StdRng::seed_from_u64(99);
        let mut counts: HashMap<InstanceId, usize> = HashMap::new();
        for _ in 0..2000 {
            let picked = table.select(&mut rng, 1, now, |_| true);
            *counts.entry(picked[0].clone()).or_default() += 1;
        }
        assert!(counts[&InstanceId::new("p1")] > counts.get(&InstanceId::new("p0")).copied().unwrap_or(0) * 3);
    }

    #[test]
    fn test_eligibility_filter() {
        let table = table(5);
        let mut rng = StdRng::seed_from_u64(3);
        let picked = table.select(&mut rng, 5, Instant::now(), |id| id.as_str() != "p2");
        assert_eq!(picked.len(), 4);
        assert!(!picked.contains(&InstanceId::new("p2")));
    }
}
