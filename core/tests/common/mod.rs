//! Shared helpers for integration tests

use chrysalis_core::gossip::{GossipMessage, PeerTransport};
use chrysalis_core::record::MemoryRecord;
use chrysalis_core::simtest::SimCluster;
use chrysalis_core::types::RecordId;
use chrysalis_core::MemoryNode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Initialize logging for tests (safe to call from every test)
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chrysalis_core=debug")))
        .try_init();
}

/// Poll `node` until its copy of `id` satisfies `check`
///
/// Votes are broadcast fire-and-forget, so the receiving worker may
/// still have them queued when the sender returns.
pub async fn await_record<F>(node: &MemoryNode, id: &RecordId, check: F) -> anyhow::Result<MemoryRecord>
where
    F: Fn(&MemoryRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(record) = node.get(id).await? {
            if check(&record) {
                return Ok(record);
            }
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("record {} never reached the expected state on {}", id, node.instance_id());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Deliver a hand-built message to node `to` and decode its reply
#[allow(dead_code)]
pub async fn send(cluster: &SimCluster, to: usize, message: GossipMessage) -> anyhow::Result<GossipMessage> {
    let reply = cluster
        .network()
        .request(cluster[to].instance_id(), message.encode()?)
        .await?;
    Ok(GossipMessage::decode(&reply)?)
}
