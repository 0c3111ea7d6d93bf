//! Memory node: one agent instance
//!
//! All local state (store, clocks, peers, gossip and vote bookkeeping) is
//! owned by a single worker task. `MemoryNode` is a cheap cloneable handle
//! that talks to the worker over a command channel, so local writes and
//! concurrently arriving gossip are serialized without locks. Network
//! calls are made by the handle, never by the worker, which keeps two
//! workers from waiting on each other.

mod round;
mod worker;

pub use round::{AntiEntropyReport, RoundReport};
pub use worker::MaintenanceReport;

use crate::config::ConsensusConfig;
use crate::consolidation::{ConsolidationReport, Consolidator, Embedder};
use crate::crypto::{IdentityProvider, InstanceInfo};
use crate::gossip::{GossipMessage, GossipMetrics, InboundEnvelope, PeerTransport, PropagationState, RoundPlan};
use crate::record::{MemoryRecord, ValidationVote};
use crate::storage::RecordStore;
use crate::types::{GossipPeer, InstanceId, MemoryType, RecordId};
use crate::validation::ValidationOutcome;
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use worker::{NodeWorker, PeerOutcome};

/// Input for a new record
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub content: String,
    pub memory_type: MemoryType,
    pub importance: Option<f64>,
    /// Must already be stored locally
    pub parents: Vec<RecordId>,
}

impl RecordDraft {
    pub fn new(content: impl Into<String>, memory_type: MemoryType) -> Self {
        Self {
            content: content.into(),
            memory_type,
            importance: None,
            parents: Vec::new(),
        }
    }

    pub fn importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn parent(mut self, parent: RecordId) -> Self {
        self.parents.push(parent);
        self
    }
}

/// Commands sent to the node worker
pub(crate) enum NodeCommand {
    CreateRecord {
        draft: RecordDraft,
        response: oneshot::Sender<Result<MemoryRecord>>,
    },
    GetRecord {
        id: RecordId,
        response: oneshot::Sender<Result<Option<MemoryRecord>>>,
    },
    ListRecords {
        response: oneshot::Sender<Result<Vec<MemoryRecord>>>,
    },
    RecordIds {
        response: oneshot::Sender<Result<BTreeSet<RecordId>>>,
    },
    Ancestors {
        id: RecordId,
        response: oneshot::Sender<Result<Vec<RecordId>>>,
    },
    AddPeer {
        peer: GossipPeer,
        response: oneshot::Sender<bool>,
    },
    Peers {
        response: oneshot::Sender<Vec<GossipPeer>>,
    },
    CastVote {
        record_id: RecordId,
        confidence: f64,
        response: oneshot::Sender<Result<(ValidationVote, Vec<InstanceId>)>>,
    },
    Validate {
        record_id: RecordId,
        response: oneshot::Sender<Result<ValidationOutcome>>,
    },
    SetImportance {
        record_id: RecordId,
        value: f64,
        response: oneshot::Sender<Result<bool>>,
    },
    AddLabel {
        record_id: RecordId,
        label: String,
        response: oneshot::Sender<Result<()>>,
    },
    RemoveLabel {
        record_id: RecordId,
        label: String,
        response: oneshot::Sender<Result<bool>>,
    },
    ApplyConsolidation {
        canonical: Vec<MemoryRecord>,
        response: oneshot::Sender<Result<Vec<MemoryRecord>>>,
    },
    PlanRound {
        response: oneshot::Sender<Result<RoundPlan>>,
    },
    StartAntiEntropy {
        peer: Option<InstanceId>,
        response: oneshot::Sender<Option<(InstanceId, GossipMessage)>>,
    },
    HandleReply {
        peer: InstanceId,
        message: GossipMessage,
        response: oneshot::Sender<Result<Option<GossipMessage>>>,
    },
    ReportOutcomes {
        outcomes: Vec<PeerOutcome>,
        response: oneshot::Sender<()>,
    },
    Maintenance {
        response: oneshot::Sender<MaintenanceReport>,
    },
    PropagationState {
        id: RecordId,
        response: oneshot::Sender<PropagationState>,
    },
    Metrics {
        response: oneshot::Sender<GossipMetrics>,
    },
    Shutdown,
}

/// Handle to a running instance
#[derive(Clone)]
pub struct MemoryNode {
    info: InstanceInfo,
    config: Arc<ConsensusConfig>,
    command_tx: mpsc::UnboundedSender<NodeCommand>,
    transport: Arc<dyn PeerTransport>,
    scheduler: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl MemoryNode {
    /// Start the worker for one instance
    ///
    /// Must be called from within a tokio runtime. `inbound` is the inbox
    /// the transport delivers this instance's messages to.
    pub fn spawn<I>(
        identity: I,
        config: ConsensusConfig,
        store: Box<dyn RecordStore>,
        transport: Arc<dyn PeerTransport>,
        inbound: mpsc::Receiver<InboundEnvelope>,
    ) -> Result<Self>
    where
        I: IdentityProvider + 'static,
    {
        config.validate()?;

        let info = InstanceInfo {
            instance_id: identity.instance_id().clone(),
            public_key: identity.public_key(),
            vector_index: identity.vector_index(),
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let worker = NodeWorker::new(Box::new(identity), config.clone(), store, command_rx, inbound);
        tokio::spawn(worker.run());

        info!(instance = %info.instance_id, vector_index = info.vector_index, "Memory node started");

        Ok(Self {
            info,
            config: Arc::new(config),
            command_tx,
            transport,
            scheduler: Arc::new(RwLock::new(None)),
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.info.instance_id
    }

    /// Public description of this instance
    pub fn info(&self) -> &InstanceInfo {
        &self.info
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(make(tx)).map_err(|_| Error::NodeStopped)?;
        rx.await.map_err(|_| Error::NodeStopped)
    }

    /// Fingerprint, sign, stamp and store a new record
    pub async fn create_record(&self, draft: RecordDraft) -> Result<MemoryRecord> {
        self.call(|response| NodeCommand::CreateRecord { draft, response }).await?
    }

    pub async fn remember(&self, content: impl Into<String>, memory_type: MemoryType) -> Result<MemoryRecord> {
        self.create_record(RecordDraft::new(content, memory_type)).await
    }

    pub async fn get(&self, id: &RecordId) -> Result<Option<MemoryRecord>> {
        let id = *id;
        self.call(|response| NodeCommand::GetRecord { id, response }).await?
    }

    pub async fn records(&self) -> Result<Vec<MemoryRecord>> {
        self.call(|response| NodeCommand::ListRecords { response }).await?
    }

    pub async fn record_ids(&self) -> Result<BTreeSet<RecordId>> {
        self.call(|response| NodeCommand::RecordIds { response }).await?
    }

    pub async fn holds(&self, id: &RecordId) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }

    /// Transitive causal parents of a stored record
    pub async fn ancestors(&self, id: &RecordId) -> Result<Vec<RecordId>> {
        let id = *id;
        self.call(|response| NodeCommand::Ancestors { id, response }).await?
    }

    pub async fn add_peer(&self, peer: GossipPeer) -> Result<bool> {
        self.call(|response| NodeCommand::AddPeer { peer, response }).await
    }

    pub async fn peers(&self) -> Result<Vec<GossipPeer>> {
        self.call(|response| NodeCommand::Peers { response }).await
    }

    /// Vote on a record locally and broadcast the vote to every known peer
    pub async fn cast_vote(&self, record_id: &RecordId, confidence: f64) -> Result<ValidationVote> {
        let record_id = *record_id;
        let (vote, peers) = self
            .call(|response| NodeCommand::CastVote {
                record_id,
                confidence,
                response,
            })
            .await??;

        let message = GossipMessage::Vote {
            vote: vote.clone(),
            sender_id: self.instance_id().clone(),
        };
        let outcomes = round::broadcast(self, &peers, &message).await?;
        self.report(outcomes).await?;
        Ok(vote)
    }

    /// Run the validator over all votes known for a record
    pub async fn validate(&self, record_id: &RecordId) -> Result<ValidationOutcome> {
        let record_id = *record_id;
        self.call(|response| NodeCommand::Validate { record_id, response }).await?
    }

    /// Write the importance register; returns whether the write took effect
    pub async fn set_importance(&self, record_id: &RecordId, value: f64) -> Result<bool> {
        let record_id = *record_id;
        self.call(|response| NodeCommand::SetImportance {
            record_id,
            value,
            response,
        })
        .await?
    }

    pub async fn add_label(&self, record_id: &RecordId, label: impl Into<String>) -> Result<()> {
        let record_id = *record_id;
        let label = label.into();
        self.call(|response| NodeCommand::AddLabel {
            record_id,
            label,
            response,
        })
        .await?
    }

    pub async fn remove_label(&self, record_id: &RecordId, label: &str) -> Result<bool> {
        let record_id = *record_id;
        let label = label.to_string();
        self.call(|response| NodeCommand::RemoveLabel {
            record_id,
            label,
            response,
        })
        .await?
    }

    /// Consolidate near-duplicates among the local records
    ///
    /// Canonical representatives gain provenance and an aggregated
    /// confidence; no record is ever removed. The report carries the
    /// representatives as stored.
    pub async fn consolidate(&self, embedder: &dyn Embedder) -> Result<ConsolidationReport> {
        let records = self.records().await?;
        let consolidator = Consolidator::new(self.config.consolidation.clone(), self.config.validation.clone());
        let mut report = consolidator.consolidate(&records, embedder);

        for warning in &report.warnings {
            warn!(instance = %self.instance_id(), "{}", warning);
        }

        let merged: Vec<MemoryRecord> = report
            .clusters
            .iter()
            .filter(|c| c.converged)
            .map(|c| c.canonical_record.clone())
            .collect();
        if !merged.is_empty() {
            let applied = self
                .call(|response| NodeCommand::ApplyConsolidation {
                    canonical: merged,
                    response,
                })
                .await??;
            for record in applied {
                if let Some(slot) = report.canonical.iter_mut().find(|r| r.id() == record.id()) {
                    *slot = record.clone();
                }
                if let Some(cluster) = report
                    .clusters
                    .iter_mut()
                    .find(|c| c.converged && c.canonical_record.id() == record.id())
                {
                    cluster.canonical_record = record;
                }
            }
        }
        Ok(report)
    }

    pub async fn propagation_state(&self, id: &RecordId) -> Result<PropagationState> {
        let id = *id;
        self.call(|response| NodeCommand::PropagationState { id, response }).await
    }

    pub async fn metrics(&self) -> Result<GossipMetrics> {
        self.call(|response| NodeCommand::Metrics { response }).await
    }

    /// Close due vote windows, re-validate late votes, expire held-back votes
    pub async fn maintenance(&self) -> Result<MaintenanceReport> {
        self.call(|response| NodeCommand::Maintenance { response }).await
    }

    /// One gossip round: plan, send concurrently, join with a per-peer timeout
    pub async fn gossip_round(&self) -> Result<RoundReport> {
        let plan = self.call(|response| NodeCommand::PlanRound { response }).await??;
        let (report, outcomes) = round::execute(self, plan).await;
        self.report(outcomes).await?;
        Ok(report)
    }

    /// Exchange id-set summaries with a random peer and pull what is missing
    pub async fn anti_entropy(&self) -> Result<AntiEntropyReport> {
        self.anti_entropy_inner(None).await
    }

    /// Anti-entropy against a specific peer
    pub async fn anti_entropy_with(&self, peer: &InstanceId) -> Result<AntiEntropyReport> {
        self.anti_entropy_inner(Some(peer.clone())).await
    }

    async fn anti_entropy_inner(&self, peer: Option<InstanceId>) -> Result<AntiEntropyReport> {
        let start = self
            .call(|response| NodeCommand::StartAntiEntropy { peer, response })
            .await?;
        let Some((peer, message)) = start else {
            return Ok(AntiEntropyReport::default());
        };

        let before = self.record_ids().await?.len();
        let (report, outcome) = round::reconcile(self, peer, message).await;
        self.report(vec![outcome]).await?;
        let after = self.record_ids().await?.len();

        Ok(AntiEntropyReport {
            records_pulled: after.saturating_sub(before),
            ..report
        })
    }

    pub(crate) async fn handle_reply(&self, peer: &InstanceId, message: GossipMessage) -> Result<Option<GossipMessage>> {
        let peer = peer.clone();
        self.call(|response| NodeCommand::HandleReply {
            peer,
            message,
            response,
        })
        .await?
    }

    async fn report(&self, outcomes: Vec<PeerOutcome>) -> Result<()> {
        if outcomes.is_empty() {
            return Ok(());
        }
        self.call(|response| NodeCommand::ReportOutcomes { outcomes, response }).await
    }

    pub(crate) fn transport(&self) -> &dyn PeerTransport {
        self.transport.as_ref()
    }

    /// Run gossip rounds on a fixed interval until stopped
    ///
    /// Every `anti_entropy_every` ticks the round is followed by an
    /// anti-entropy exchange. Vote windows are serviced on every tick.
    pub async fn start_scheduler(&self) {
        self.stop_scheduler().await;

        let node = self.clone();
        let gossip = self.config.gossip.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(gossip.interval());
            interval.tick().await; // Skip first immediate tick
            let mut ticks: u64 = 0;

            loop {
                interval.tick().await;
                ticks += 1;

                if let Err(e) = node.gossip_round().await {
                    if matches!(e, Error::NodeStopped) {
                        break;
                    }
                    warn!(instance = %node.instance_id(), error = %e, "Gossip round failed");
                }

                if ticks % gossip.anti_entropy_every == 0 {
                    if let Err(e) = node.anti_entropy().await {
                        warn!(instance = %node.instance_id(), error = %e, "Anti-entropy failed");
                    }
                }

                if node.maintenance().await.is_err() {
                    break;
                }
            }
        });

        *self.scheduler.write().await = Some(task);
        info!(instance = %self.instance_id(), interval_ms = self.config.gossip.interval_ms, "Gossip scheduler started");
    }

    pub async fn stop_scheduler(&self) {
        if let Some(handle) = self.scheduler.write().await.take() {
            handle.abort();
            info!(instance = %self.instance_id(), "Gossip scheduler stopped");
        }
    }

    /// Stop the scheduler and the worker; later calls fail with `NodeStopped`
    pub async fn shutdown(&self) {
        self.stop_scheduler().await;
        let _ = self.command_tx.send(NodeCommand::Shutdown);
    }
}

impl std::fmt::Debug for MemoryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNode")
            .field("instance_id", &self.info.instance_id)
            .field("vector_index", &self.info.vector_index)
            .finish_non_exhaustive()
    }
}
