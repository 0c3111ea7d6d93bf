//! Round execution: concurrent peer conversations with per-peer timeouts
//!
//! A conversation is a short request/reply exchange (push then ack, digest
//! then pull, summary then pull). Each runs under `peer_timeout`; a peer
//! that errors or times out is reported back to the worker and never fails
//! the round as a whole.

use super::worker::PeerOutcome;
use super::MemoryNode;
use crate::gossip::{DispatchKind, GossipMessage, RoundPlan};
use crate::types::InstanceId;
use crate::{Error, Result};
use futures::future::join_all;
use serde::Serialize;
use tokio::time::timeout;
use tracing::debug;

/// Upper bound on request/reply steps in one conversation
const MAX_CONVERSATION_STEPS: usize = 4;

/// Summary of one gossip round
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundReport {
    pub round: u64,
    pub pushes: usize,
    pub digests: usize,
    /// Dispatches the peer acknowledged
    pub delivered: usize,
    pub failed: Vec<InstanceId>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AntiEntropyReport {
    /// None when no peer was available
    pub peer: Option<InstanceId>,
    pub success: bool,
    pub records_pulled: usize,
}

/// Drive one conversation until the local side has nothing more to say
async fn converse(node: &MemoryNode, peer: &InstanceId, first: GossipMessage) -> Result<()> {
    let mut next = Some(first);
    let mut steps = 0;

    while let Some(message) = next.take() {
        steps += 1;
        if steps > MAX_CONVERSATION_STEPS {
            debug!(peer = %peer, "Conversation step limit reached");
            break;
        }
        let reply = node.transport().request(peer, message.encode()?).await?;
        let reply = GossipMessage::decode(&reply)?;
        next = node.handle_reply(peer, reply).await?;
    }
    Ok(())
}

/// `converse` under the configured peer timeout
async fn converse_bounded(node: &MemoryNode, peer: &InstanceId, first: GossipMessage) -> Result<()> {
    match timeout(node.config().gossip.peer_timeout(), converse(node, peer, first)).await {
        Ok(result) => result,
        Err(_) => Err(Error::PeerUnreachable {
            peer: peer.clone(),
            reason: "timed out".into(),
        }),
    }
}

/// Whether an error means the remote side did not take part
///
/// Other errors (a stopped local worker) are not the peer's fault.
fn peer_failure(error: &Error) -> bool {
    !matches!(error, Error::NodeStopped)
}

pub(crate) async fn execute(node: &MemoryNode, plan: RoundPlan) -> (RoundReport, Vec<PeerOutcome>) {
    let mut report = RoundReport {
        round: plan.round,
        ..Default::default()
    };

    let conversations = plan.dispatches.into_iter().map(|dispatch| async move {
        let result = converse_bounded(node, &dispatch.peer, dispatch.message).await;
        (dispatch.peer, dispatch.record_id, dispatch.version, dispatch.kind, result)
    });

    let mut outcomes = Vec::new();
    for (peer, record_id, version, kind, result) in join_all(conversations).await {
        match kind {
            DispatchKind::Push => report.pushes += 1,
            DispatchKind::Digest => report.digests += 1,
        }
        match result {
            Ok(()) => {
                report.delivered += 1;
                outcomes.push(PeerOutcome::Delivered {
                    peer,
                    dispatch: Some((record_id, version, kind)),
                });
            }
            Err(e) if peer_failure(&e) => {
                report.failed.push(peer.clone());
                outcomes.push(PeerOutcome::Failed {
                    peer,
                    reason: e.to_string(),
                });
            }
            Err(e) => debug!(peer = %peer, error = %e, "Conversation aborted locally"),
        }
    }

    debug!(
        instance = %node.instance_id(),
        round = report.round,
        pushes = report.pushes,
        digests = report.digests,
        failed = report.failed.len(),
        "Gossip round complete"
    );
    (report, outcomes)
}

pub(crate) async fn reconcile(node: &MemoryNode, peer: InstanceId, first: GossipMessage) -> (AntiEntropyReport, PeerOutcome) {
    match converse_bounded(node, &peer, first).await {
        Ok(()) => (
            AntiEntropyReport {
                peer: Some(peer.clone()),
                success: true,
                records_pulled: 0,
            },
            PeerOutcome::Delivered { peer, dispatch: None },
        ),
        Err(e) => (
            AntiEntropyReport {
                peer: Some(peer.clone()),
                success: false,
                records_pulled: 0,
            },
            PeerOutcome::Failed {
                peer,
                reason: e.to_string(),
            },
        ),
    }
}

/// Fire-and-forget send to every peer, each bounded by the peer timeout
pub(crate) async fn broadcast(node: &MemoryNode, peers: &[InstanceId], message: &GossipMessage) -> Result<Vec<PeerOutcome>> {
    let payload = message.encode()?;
    let limit = node.config().gossip.peer_timeout();

    let sends = peers.iter().map(|peer| {
        let payload = payload.clone();
        async move {
            let result = match timeout(limit, node.transport().send(peer, payload)).await {
                Ok(result) => result,
                Err(_) => Err(Error::PeerUnreachable {
                    peer: peer.clone(),
                    reason: "timed out".into(),
                }),
            };
            match result {
                Ok(()) => PeerOutcome::Delivered {
                    peer: peer.clone(),
                    dispatch: None,
                },
                Err(e) => PeerOutcome::Failed {
                    peer: peer.clone(),
                    reason: e.to_string(),
                },
            }
        }
    });

    Ok(join_all(sends).await)
}
