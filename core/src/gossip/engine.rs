//! Round planning for push/digest dissemination
//!
//! The engine is pure bookkeeping: it decides which peers get which record
//! in a round and remembers who has confirmed delivery. Network I/O is done
//! by the node's round executor, which reports outcomes back here.

use crate::config::GossipConfig;
use crate::gossip::message::GossipMessage;
use crate::gossip::peers::PeerTable;
use crate::storage::RecordStore;
use crate::types::{InstanceId, RecordId};
use crate::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use tracing::debug;

/// Dissemination state of a record at this instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropagationState {
    /// Not held locally
    Unknown,
    /// Still being pushed
    Pending,
    /// Push phase over; only anti-entropy carries it further
    Propagated,
}

#[derive(Debug, Clone)]
struct PushState {
    /// Bumped whenever local attributes change and the record must be re-sent
    version: u64,
    delivered: BTreeSet<InstanceId>,
    rounds: u32,
    state: PropagationState,
}

impl PushState {
    fn pending() -> Self {
        Self {
            version: 0,
            delivered: BTreeSet::new(),
            rounds: 0,
            state: PropagationState::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Push,
    Digest,
}

/// One message to one peer
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub peer: InstanceId,
    pub record_id: RecordId,
    pub version: u64,
    pub kind: DispatchKind,
    pub message: GossipMessage,
}

#[derive(Debug, Clone, Default)]
pub struct RoundPlan {
    pub round: u64,
    pub dispatches: Vec<Dispatch>,
}

impl RoundPlan {
    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }
}

pub struct GossipEngine {
    config: GossipConfig,
    me: InstanceId,
    states: HashMap<RecordId, PushState>,
    rng: StdRng,
    round: u64,
}

impl GossipEngine {
    pub fn new(config: GossipConfig, me: InstanceId, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            me,
            states: HashMap::new(),
            rng,
            round: 0,
        }
    }

    /// Start pushing a record that is new locally
    pub fn track(&mut self, id: RecordId) {
        self.states.entry(id).or_insert_with(PushState::pending);
    }

    /// Re-disseminate a record whose attributes changed
    pub fn bump(&mut self, id: RecordId) {
        let state = self.states.entry(id).or_insert_with(PushState::pending);
        state.version += 1;
        state.delivered.clear();
        state.rounds = 0;
        state.state = PropagationState::Pending;
    }

    pub fn state(&self, id: &RecordId) -> PropagationState {
        self.states
            .get(id)
            .map(|s| s.state)
            .unwrap_or(PropagationState::Unknown)
    }

    pub fn pending(&self) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self
            .states
            .iter()
            .filter(|(_, s)| s.state == PropagationState::Pending)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// A peer confirmed it holds `version` of the record
    pub fn on_delivered(&mut self, id: &RecordId, version: u64, peer: &InstanceId) {
        if let Some(state) = self.states.get_mut(id) {
            if state.version == version {
                state.delivered.insert(peer.clone());
            }
        }
    }

    /// Choose eager and lazy peers for every pending record
    pub fn plan_round(&mut self, store: &dyn RecordStore, peers: &PeerTable, now: Instant) -> Result<RoundPlan> {
        self.round += 1;
        let mut plan = RoundPlan {
            round: self.round,
            dispatches: Vec::new(),
        };

        let Self {
            config,
            me,
            states,
            rng,
            ..
        } = self;
        let config = &*config;
        let me = &*me;

        let mut pending: Vec<RecordId> = states
            .iter()
            .filter(|(_, s)| s.state == PropagationState::Pending)
            .map(|(id, _)| *id)
            .collect();
        pending.sort();

        for id in pending {
            let Some(state) = states.get_mut(&id) else {
                continue;
            };
            let Some(mut record) = store.get(&id)? else {
                state.state = PropagationState::Propagated;
                continue;
            };

            if state.rounds >= config.max_push_rounds {
                state.state = PropagationState::Propagated;
                continue;
            }

            // On the first version, peers already listed in seen_by are
            // skipped; after a bump everyone needs the new attributes.
            let exclude_seen = state.version == 0;
            let eligible = |peer: &InstanceId| {
                peer != me
                    && !state.delivered.contains(peer)
                    && !(exclude_seen && record.meta.gossip.seen_by.contains(peer))
            };

            if !peers.ids().any(|p| eligible(p)) {
                state.state = PropagationState::Propagated;
                debug!(record_id = %id, rounds = state.rounds, "Record fully propagated");
                continue;
            }

            let eager = peers.select(&mut *rng, config.fanout, now, &eligible);
            if eager.is_empty() {
                // Every remaining candidate is cooling down
                continue;
            }
            let lazy = peers.select(&mut *rng, config.digest_fanout, now, |p| eligible(p) && !eager.contains(p));

            state.rounds += 1;
            record.meta.gossip.fanout = config.fanout as u32;
            record.meta.gossip.round = record.meta.gossip.round.max(state.rounds);

            for peer in eager {
                plan.dispatches.push(Dispatch {
                    peer,
                    record_id: id,
                    version: state.version,
                    kind: DispatchKind::Push,
                    message: GossipMessage::Push {
                        record_id: id,
                        record: record.clone(),
                        sender_id: me.clone(),
                        round: state.rounds,
                    },
                });
            }
            // A digest cannot carry changed attributes to a peer that already
            // holds the id, so re-gossip sends the full record to everyone
            for peer in lazy {
                let (kind, message) = if state.version == 0 {
                    (
                        DispatchKind::Digest,
                        GossipMessage::Digest {
                            record_id: id,
                            sender_id: me.clone(),
                        },
                    )
                } else {
                    (
                        DispatchKind::Push,
                        GossipMessage::Push {
                            record_id: id,
                            record: record.clone(),
                            sender_id: me.clone(),
                            round: state.rounds,
                        },
                    )
                };
                plan.dispatches.push(Dispatch {
                    peer,
                    record_id: id,
                    version: state.version,
                    kind,
                    message,
                });
            }
        }

        Ok(plan)
    }

    /// One available peer for an anti-entropy exchange
    pub fn anti_entropy_peer(&mut self, peers: &PeerTable, now: Instant) -> Option<InstanceId> {
        let me = self.me.clone();
        peers.select(&mut self.rng, 1, now, |p| *p != me).into_iter().next()
    }
}
