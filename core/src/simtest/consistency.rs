//! Utilities for waiting on cluster consistency

use super::SimCluster;
use crate::types::RecordId;
use anyhow::{bail, Result};
use std::time::Duration;

/// Wait until every node holds `id`
///
/// Polls; something else (the scheduler, or the test itself) must drive
/// gossip meanwhile.
pub async fn await_record_everywhere(timeout: Duration, cluster: &SimCluster, id: &RecordId) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if cluster.holders(id).await? == cluster.len() {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            bail!("Record {} not everywhere after {:?}", id, timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until all nodes hold identical record id sets
pub async fn await_consistency(timeout: Duration, cluster: &SimCluster) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let mut views = Vec::with_capacity(cluster.len());
        for node in cluster.iter() {
            views.push(node.record_ids().await?);
        }
        if views.windows(2).all(|w| w[0] == w[1]) {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            bail!("Cluster not consistent after {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
