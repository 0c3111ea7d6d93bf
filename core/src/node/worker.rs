//! Node worker: owns all mutable state of one instance

use super::{NodeCommand, RecordDraft};
use crate::clock::{LamportClock, VectorClock};
use crate::config::ConsensusConfig;
use crate::crdt::Tag;
use crate::crypto::IdentityProvider;
use crate::gossip::{DispatchKind, GossipEngine, GossipMessage, GossipMetrics, IdSummary, InboundEnvelope, PeerTable, RoundPlan};
use crate::record::{CausalStamp, MemoryRecord, ValidationVote};
use crate::storage::{self, RecordStore};
use crate::types::{now_millis, InstanceId, PublicKeyBytes, RecordId};
use crate::validation::{Admission, ByzantineValidator, ValidationOutcome, Validator, VoteHoldback, VoteWindows};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Result of one conversation with a peer, reported back by the executor
#[derive(Debug)]
pub(crate) enum PeerOutcome {
    Delivered {
        peer: InstanceId,
        /// Set for push and digest dispatches
        dispatch: Option<(RecordId, u64, DispatchKind)>,
    },
    Failed {
        peer: InstanceId,
        reason: String,
    },
}

/// What a maintenance pass decided
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    /// Records whose vote window closed with a decision
    pub decided: Vec<RecordId>,
    /// Records whose window closed without enough votes
    pub insufficient: Vec<RecordId>,
    /// Closed records re-validated because of late votes
    pub revalidated: Vec<RecordId>,
    pub expired_votes: usize,
}

pub(crate) struct NodeWorker {
    identity: Box<dyn IdentityProvider>,
    me: InstanceId,
    config: ConsensusConfig,
    store: Box<dyn RecordStore>,
    lamport: LamportClock,
    vector: VectorClock,
    peers: PeerTable,
    engine: GossipEngine,
    validator: ByzantineValidator,
    windows: VoteWindows,
    holdback: VoteHoldback,
    metrics: GossipMetrics,
    command_rx: mpsc::UnboundedReceiver<NodeCommand>,
    inbound_rx: mpsc::Receiver<InboundEnvelope>,
}

impl NodeWorker {
    pub(crate) fn new(
        identity: Box<dyn IdentityProvider>,
        config: ConsensusConfig,
        store: Box<dyn RecordStore>,
        command_rx: mpsc::UnboundedReceiver<NodeCommand>,
        inbound_rx: mpsc::Receiver<InboundEnvelope>,
    ) -> Self {
        let me = identity.instance_id().clone();
        let index = identity.vector_index();
        // Distinct but reproducible streams per instance when seeded
        let seed = config.gossip.rng_seed.map(|s| s.wrapping_add(index as u64));

        Self {
            me: me.clone(),
            lamport: LamportClock::new(),
            vector: VectorClock::new(index),
            peers: PeerTable::new(config.gossip.clone()),
            engine: GossipEngine::new(config.gossip.clone(), me, seed),
            validator: ByzantineValidator::new(config.validation.clone()),
            windows: VoteWindows::new(&config.validation),
            holdback: VoteHoldback::new(),
            metrics: GossipMetrics::new(),
            identity,
            config,
            store,
            command_rx,
            inbound_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(instance = %self.me, "Node worker running");

        loop {
            tokio::select! {
                Some(command) = self.command_rx.recv() => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(envelope) = self.inbound_rx.recv() => {
                    self.handle_envelope(envelope);
                }
                else => break,
            }
        }

        self.metrics.log_summary(&self.me);
        info!(instance = %self.me, "Node worker stopped");
    }

    /// Returns false when the worker should stop
    fn handle_command(&mut self, command: NodeCommand) -> bool {
        match command {
            NodeCommand::CreateRecord { draft, response } => {
                let _ = response.send(self.create_record(draft));
            }
            NodeCommand::GetRecord { id, response } => {
                let _ = response.send(self.store.get(&id));
            }
            NodeCommand::ListRecords { response } => {
                let _ = response.send(self.store.list_by_filter(&|_| true));
            }
            NodeCommand::RecordIds { response } => {
                let _ = response.send(self.store.ids());
            }
            NodeCommand::Ancestors { id, response } => {
                let _ = response.send(storage::ancestors(self.store.as_ref(), &id));
            }
            NodeCommand::AddPeer { peer, response } => {
                let added = peer.id != self.me && self.peers.add(peer);
                let _ = response.send(added);
            }
            NodeCommand::Peers { response } => {
                let _ = response.send(self.peers.snapshot());
            }
            NodeCommand::CastVote {
                record_id,
                confidence,
                response,
            } => {
                let _ = response.send(self.cast_vote(record_id, confidence));
            }
            NodeCommand::Validate { record_id, response } => {
                let _ = response.send(self.validate(&record_id));
            }
            NodeCommand::SetImportance {
                record_id,
                value,
                response,
            } => {
                let _ = response.send(self.set_importance(&record_id, value));
            }
            NodeCommand::AddLabel {
                record_id,
                label,
                response,
            } => {
                let _ = response.send(self.add_label(&record_id, label));
            }
            NodeCommand::RemoveLabel {
                record_id,
                label,
                response,
            } => {
                let _ = response.send(self.remove_label(&record_id, &label));
            }
            NodeCommand::ApplyConsolidation { canonical, response } => {
                let _ = response.send(self.apply_consolidation(canonical));
            }
            NodeCommand::PlanRound { response } => {
                let _ = response.send(self.plan_round());
            }
            NodeCommand::StartAntiEntropy { peer, response } => {
                let _ = response.send(self.start_anti_entropy(peer));
            }
            NodeCommand::HandleReply {
                peer,
                message,
                response,
            } => {
                let _ = response.send(Ok(self.handle_reply(&peer, message)));
            }
            NodeCommand::ReportOutcomes { outcomes, response } => {
                self.apply_outcomes(outcomes);
                let _ = response.send(());
            }
            NodeCommand::Maintenance { response } => {
                let _ = response.send(self.maintenance());
            }
            NodeCommand::PropagationState { id, response } => {
                let _ = response.send(self.engine.state(&id));
            }
            NodeCommand::Metrics { response } => {
                let _ = response.send(self.metrics.clone());
            }
            NodeCommand::Shutdown => return false,
        }
        true
    }

    fn create_record(&mut self, draft: RecordDraft) -> Result<MemoryRecord> {
        for parent in &draft.parents {
            if !self.store.contains(parent)? {
                return Err(Error::UnknownParent(*parent));
            }
        }
        if let Some(importance) = draft.importance {
            check_unit_interval("importance", importance)?;
        }

        let lamport_time = self.lamport.tick();
        let vector_time = self.vector.tick();
        let stamp = CausalStamp {
            lamport_time,
            vector_time,
            causal_parents: draft.parents.into_iter().collect(),
        };

        let mut record = MemoryRecord::new_signed(
            self.identity.as_ref(),
            draft.content,
            draft.memory_type,
            now_millis(),
            stamp,
        );
        if let Some(importance) = draft.importance {
            record.meta.importance.set(importance, lamport_time, self.me.clone());
        }

        let id = record.id();
        self.store.put(record.clone())?;
        self.engine.track(id);

        info!(
            instance = %self.me,
            record_id = %id,
            memory_type = %record.memory_type(),
            lamport = lamport_time,
            "Created record"
        );
        Ok(record)
    }

    fn require(&self, id: &RecordId) -> Result<MemoryRecord> {
        self.store.get(id)?.ok_or(Error::NotFound(*id))
    }

    fn population(&self) -> usize {
        self.config
            .validation
            .population
            .unwrap_or(self.peers.len() + 1)
    }

    fn cast_vote(&mut self, record_id: RecordId, confidence: f64) -> Result<(ValidationVote, Vec<InstanceId>)> {
        self.require(&record_id)?;
        check_unit_interval("confidence", confidence)?;
        let timestamp = self.lamport.tick();
        let vote = ValidationVote::signed(self.identity.as_ref(), record_id, confidence, timestamp)?;

        self.apply_vote(vote.clone())?;
        self.engine.bump(record_id);

        let peers: Vec<InstanceId> = self.peers.ids().cloned().collect();
        self.metrics.votes_sent += peers.len() as u64;
        debug!(instance = %self.me, record_id = %record_id, confidence, "Cast vote");
        Ok((vote, peers))
    }

    /// Key a voter signs with: ours, or a known peer's
    fn voter_key(&self, voter: &InstanceId) -> Option<PublicKeyBytes> {
        if *voter == self.me {
            Some(self.identity.public_key())
        } else {
            self.peers.public_key(voter)
        }
    }

    /// Accept only signed, in-range votes from members of the population
    fn authenticate_vote(&self, vote: &ValidationVote) -> Result<()> {
        let key = self.voter_key(&vote.instance_id).ok_or_else(|| Error::VoteRejected {
            voter: vote.instance_id.clone(),
            reason: "not a known member".into(),
        })?;
        vote.verify(&key)
    }

    /// Record a vote in the record's metadata and its collection window
    ///
    /// Votes for unknown records are held back until the record arrives.
    fn apply_vote(&mut self, vote: ValidationVote) -> Result<bool> {
        let Some(mut record) = self.store.get(&vote.record_id)? else {
            match self.holdback.buffer(vote, now_millis()) {
                Ok(()) => self.metrics.votes_held_back += 1,
                Err(e) => warn!(instance = %self.me, error = %e, "Dropping vote"),
            }
            return Ok(false);
        };

        if !record.meta.validation.record_vote(vote.clone()) {
            return Ok(false);
        }
        self.store.put(record)?;

        let record_id = vote.record_id;
        if self.windows.offer(vote, Instant::now()) == Admission::Late {
            debug!(instance = %self.me, record_id = %record_id, "Late vote, re-validation pending");
        }
        Ok(true)
    }

    fn validate(&mut self, record_id: &RecordId) -> Result<ValidationOutcome> {
        let record = self.require(record_id)?;
        let votes: Vec<ValidationVote> = record.meta.validation.votes.values().cloned().collect();
        self.decide(record_id, &votes)
    }

    /// Run the validator and store a decision in the record's metadata
    fn decide(&mut self, record_id: &RecordId, votes: &[ValidationVote]) -> Result<ValidationOutcome> {
        let outcome = self.validator.validate(record_id, votes, self.population());

        if let ValidationOutcome::Decided(report) = &outcome {
            if let Some(mut record) = self.store.get(record_id)? {
                record.meta.validation.assessment = Some(report.assessment());
                self.store.put(record)?;
            }
            info!(
                instance = %self.me,
                record_id = %record_id,
                valid = report.valid,
                trimmed_mean = report.trimmed_mean,
                votes = report.vote_count,
                "Validation decided"
            );
        }
        Ok(outcome)
    }

    fn set_importance(&mut self, record_id: &RecordId, value: f64) -> Result<bool> {
        check_unit_interval("importance", value)?;
        let mut record = self.require(record_id)?;
        let timestamp = self.lamport.merge(record.meta.importance.timestamp());
        if !record.meta.importance.set(value, timestamp, self.me.clone()) {
            return Ok(false);
        }
        self.store.put(record)?;
        self.engine.bump(*record_id);
        Ok(true)
    }

    fn add_label(&mut self, record_id: &RecordId, label: String) -> Result<()> {
        let mut record = self.require(record_id)?;
        let seq = self.lamport.tick();
        record.meta.labels.add(label, Tag::new(self.me.clone(), seq));
        self.store.put(record)?;
        self.engine.bump(*record_id);
        Ok(())
    }

    fn remove_label(&mut self, record_id: &RecordId, label: &str) -> Result<bool> {
        let mut record = self.require(record_id)?;
        if !record.meta.labels.remove(&label.to_string()) {
            return Ok(false);
        }
        self.lamport.tick();
        self.store.put(record)?;
        self.engine.bump(*record_id);
        Ok(true)
    }

    /// Store consolidated representatives, stamping changed confidences
    fn apply_consolidation(&mut self, canonical: Vec<MemoryRecord>) -> Result<Vec<MemoryRecord>> {
        let mut applied = Vec::with_capacity(canonical.len());
        for mut record in canonical {
            let id = record.id();
            let stored = self.require(&id)?;
            if let Some(value) = record.meta.convergence.confidence() {
                let current = stored.meta.convergence.confidence.clone();
                let seen = current.as_ref().map_or(0, |r| r.timestamp());
                record.meta.convergence.confidence = current;
                if stored.meta.convergence.confidence() != Some(value) {
                    let timestamp = self.lamport.merge(seen);
                    record.meta.convergence.set_confidence(value, timestamp, self.me.clone());
                }
            }
            if self.store.put(record)?.changed() {
                self.engine.bump(id);
            }
            applied.push(self.require(&id)?);
        }
        Ok(applied)
    }

    fn plan_round(&mut self) -> Result<RoundPlan> {
        let plan = self
            .engine
            .plan_round(self.store.as_ref(), &self.peers, Instant::now())?;
        self.metrics.rounds += 1;
        for dispatch in &plan.dispatches {
            match dispatch.kind {
                DispatchKind::Push => self.metrics.pushes_sent += 1,
                DispatchKind::Digest => self.metrics.digests_sent += 1,
            }
        }
        Ok(plan)
    }

    fn start_anti_entropy(&mut self, peer: Option<InstanceId>) -> Option<(InstanceId, GossipMessage)> {
        let peer = match peer {
            Some(peer) => peer,
            None => self.engine.anti_entropy_peer(&self.peers, Instant::now())?,
        };
        self.metrics.anti_entropy_runs += 1;
        debug!(instance = %self.me, peer = %peer, "Starting anti-entropy");
        Some((
            peer,
            GossipMessage::SummaryRequest {
                sender_id: self.me.clone(),
            },
        ))
    }

    fn apply_outcomes(&mut self, outcomes: Vec<PeerOutcome>) {
        for outcome in outcomes {
            match outcome {
                PeerOutcome::Delivered { peer, dispatch } => {
                    self.peers.mark_success(&peer);
                    let Some((record_id, version, kind)) = dispatch else {
                        continue;
                    };
                    self.engine.on_delivered(&record_id, version, &peer);
                    // Digest conversations end with the peer holding the record
                    // (acked as known, or pulled)
                    if let Ok(Some(mut record)) = self.store.get(&record_id) {
                        if record.meta.gossip.seen_by.insert(peer.clone()) {
                            if let Err(e) = self.store.put(record) {
                                warn!(instance = %self.me, error = %e, "Failed to update seen_by");
                            }
                        }
                    }
                    debug!(instance = %self.me, peer = %peer, record_id = %record_id, ?kind, "Delivered");
                }
                PeerOutcome::Failed { peer, reason } => {
                    self.metrics.peer_failures += 1;
                    self.peers.mark_failed(&peer, Instant::now());
                    warn!(instance = %self.me, peer = %peer, reason = %reason, "Peer unreachable");
                }
            }
        }
    }

    fn maintenance(&mut self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let now = Instant::now();

        for record_id in self.windows.due(now) {
            let votes = self.windows.close(&record_id);
            match self.decide(&record_id, &votes) {
                Ok(ValidationOutcome::Decided(_)) => report.decided.push(record_id),
                Ok(ValidationOutcome::Insufficient { received, required }) => {
                    debug!(instance = %self.me, record_id = %record_id, received, required, "Window closed without quorum");
                    report.insufficient.push(record_id);
                }
                Err(e) => warn!(instance = %self.me, record_id = %record_id, error = %e, "Validation failed"),
            }
        }

        for (record_id, votes) in self.windows.take_revalidations() {
            match self.decide(&record_id, &votes) {
                Ok(_) => report.revalidated.push(record_id),
                Err(e) => warn!(instance = %self.me, record_id = %record_id, error = %e, "Re-validation failed"),
            }
        }

        let expired = self.holdback.expire_old_votes(now_millis());
        if !expired.is_empty() {
            debug!(instance = %self.me, count = expired.len(), "Expired held-back votes");
        }
        report.expired_votes = expired.len();
        report
    }

    // Inbound traffic (this instance is the responder)

    fn handle_envelope(&mut self, envelope: InboundEnvelope) {
        let message = match GossipMessage::decode(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(instance = %self.me, error = %e, "Dropping undecodable gossip message");
                return;
            }
        };

        let reply = self.handle_inbound(message);
        let Some(tx) = envelope.reply else {
            return;
        };
        match reply.encode() {
            Ok(bytes) => {
                let _ = tx.send(bytes);
            }
            Err(e) => warn!(instance = %self.me, error = %e, "Failed to encode reply"),
        }
    }

    fn handle_inbound(&mut self, message: GossipMessage) -> GossipMessage {
        let from = message.sender_id().clone();
        debug!(instance = %self.me, peer = %from, kind = message.kind(), "Inbound gossip");

        match message {
            GossipMessage::Push { record, .. } => {
                let _ = self.ingest(&from, record, false);
                self.ack()
            }
            GossipMessage::Digest { record_id, .. } => match self.store.contains(&record_id) {
                Ok(true) => self.ack(),
                _ => self.pull_request(),
            },
            GossipMessage::PullRequest { known_ids, .. } => self.pull_response(known_ids),
            GossipMessage::PullResponse { records, .. } => {
                for record in records {
                    let _ = self.ingest(&from, record, true);
                }
                self.ack()
            }
            GossipMessage::Vote { vote, .. } => {
                self.metrics.votes_received += 1;
                if let Err(e) = self.authenticate_vote(&vote) {
                    warn!(instance = %self.me, peer = %from, error = %e, "Rejected vote");
                    self.metrics.votes_rejected += 1;
                    self.peers.penalize(&from);
                    return self.ack();
                }
                self.lamport.merge(vote.timestamp);
                if let Err(e) = self.apply_vote(vote) {
                    warn!(instance = %self.me, peer = %from, error = %e, "Failed to apply vote");
                }
                self.ack()
            }
            GossipMessage::SummaryRequest { .. } => self.summary(),
            GossipMessage::Summary { .. } | GossipMessage::Ack { .. } => self.ack(),
        }
    }

    // Replies (this instance started the conversation)

    fn handle_reply(&mut self, peer: &InstanceId, message: GossipMessage) -> Option<GossipMessage> {
        match message {
            GossipMessage::Ack { .. } => None,
            GossipMessage::PullRequest { known_ids, .. } => Some(self.pull_response(known_ids)),
            GossipMessage::PullResponse { records, .. } => {
                for record in records {
                    let _ = self.ingest(peer, record, true);
                }
                None
            }
            GossipMessage::Summary { summary, .. } => {
                let mine = match self.store.ids() {
                    Ok(ids) => IdSummary::of(&ids),
                    Err(e) => {
                        warn!(instance = %self.me, error = %e, "Failed to summarize store");
                        return None;
                    }
                };
                if summary == mine {
                    debug!(instance = %self.me, peer = %peer, "Already in sync");
                    None
                } else {
                    Some(self.pull_request())
                }
            }
            other => {
                debug!(instance = %self.me, peer = %peer, kind = other.kind(), "Unexpected reply");
                None
            }
        }
    }

    fn ack(&self) -> GossipMessage {
        GossipMessage::Ack {
            sender_id: self.me.clone(),
        }
    }

    fn pull_request(&self) -> GossipMessage {
        let known_ids: Vec<RecordId> = self.store.ids().map(|ids| ids.into_iter().collect()).unwrap_or_default();
        GossipMessage::PullRequest {
            known_ids,
            sender_id: self.me.clone(),
        }
    }

    fn pull_response(&self, known_ids: Vec<RecordId>) -> GossipMessage {
        let known: BTreeSet<RecordId> = known_ids.into_iter().collect();
        let mut records = self
            .store
            .list_by_filter(&|r| !known.contains(&r.id()))
            .unwrap_or_default();
        records.truncate(self.config.gossip.max_records_per_pull);
        GossipMessage::PullResponse {
            records,
            sender_id: self.me.clone(),
        }
    }

    fn summary(&self) -> GossipMessage {
        let ids = self.store.ids().unwrap_or_default();
        GossipMessage::Summary {
            summary: IdSummary::of(&ids),
            sender_id: self.me.clone(),
        }
    }

    /// Verify and merge a record received from `from`
    ///
    /// Rejected records are never stored or re-gossiped, and the sender's
    /// score is penalized. Votes carried in the metadata are checked one by
    /// one like direct votes; the sender's assessment is never adopted.
    fn ingest(&mut self, from: &InstanceId, mut record: MemoryRecord, pulled: bool) -> Result<()> {
        let record_id = record.id();
        if let Err(e) = record.verify().and_then(|_| record.meta.check_remote_clocks()) {
            warn!(
                instance = %self.me,
                peer = %from,
                record_id = %record_id,
                error = %e,
                "Rejected record"
            );
            self.metrics.records_rejected += 1;
            self.peers.penalize(from);
            return Err(e);
        }

        record.meta.validation.assessment = None;
        let carried = record.meta.validation.votes.len();
        record.meta.validation.votes.retain(|voter, vote| {
            *voter == vote.instance_id && vote.record_id == record_id && self.authenticate_vote(vote).is_ok()
        });
        let dropped = carried - record.meta.validation.votes.len();
        if dropped > 0 {
            warn!(instance = %self.me, peer = %from, record_id = %record_id, dropped, "Dropped forged votes");
            self.metrics.votes_rejected += dropped as u64;
            self.peers.penalize(from);
        }

        let before = self.store.get(&record_id)?;
        record.meta.gossip.seen_by.insert(self.me.clone());
        record.meta.gossip.seen_by.insert(from.clone());
        record.meta.crdt.added_by.insert(self.me.clone());

        let lamport_time = record.meta.lamport_time;
        let vector_time = record.meta.vector_time.clone();
        self.store.put(record)?;

        match before {
            None => {
                self.lamport.merge(lamport_time);
                self.vector.merge(&vector_time);
                self.engine.track(record_id);
                self.metrics.record_receive(false);
                if pulled {
                    self.metrics.records_pulled += 1;
                }
                debug!(instance = %self.me, peer = %from, record_id = %record_id, "Accepted record");

                for vote in self.holdback.on_record_accepted(&record_id) {
                    self.apply_vote(vote)?;
                }
            }
            Some(before) => {
                self.metrics.record_receive(true);
                let after = self.require(&record_id)?;
                if before.meta.attributes_differ(&after.meta) {
                    self.engine.bump(record_id);
                }
            }
        }
        Ok(())
    }
}

fn check_unit_interval(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!("{} must be in [0, 1], got {}", name, value)))
    }
}
