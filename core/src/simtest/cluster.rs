//! Cluster of simulated instances that can talk to each other

use crate::config::ConsensusConfig;
use crate::crypto::LocalIdentity;
use crate::gossip::LocalNetwork;
use crate::node::{MemoryNode, RoundReport};
use crate::storage::MemoryStore;
use crate::types::{GossipPeer, InstanceId, RecordId};
use anyhow::Result;
use futures::future::join_all;
use std::ops::Index;
use std::sync::Arc;

/// A fully meshed set of nodes on one `LocalNetwork`
///
/// Node `i` is named `agent-{i:02}` and owns vector clock slot `i`.
pub struct SimCluster {
    nodes: Vec<MemoryNode>,
    network: LocalNetwork,
}

impl SimCluster {
    /// Create a cluster of N nodes with default configuration
    pub async fn new(count: usize) -> Result<Self> {
        Self::with_config(count, ConsensusConfig::default()).await
    }

    /// Create a cluster where every node uses `config`
    pub async fn with_config(count: usize, config: ConsensusConfig) -> Result<Self> {
        let network = LocalNetwork::new();
        let mut nodes = Vec::with_capacity(count);

        for i in 0..count {
            let id = Self::instance_name(i);
            let inbox = network.register(id.clone()).await;
            let identity = LocalIdentity::generate(id, i);
            let node = MemoryNode::spawn(
                identity,
                config.clone(),
                Box::new(MemoryStore::new()),
                Arc::new(network.clone()),
                inbox,
            )?;
            nodes.push(node);
        }

        for node in &nodes {
            for other in &nodes {
                if node.instance_id() != other.instance_id() {
                    let peer = GossipPeer::new(other.instance_id().clone(), "local").with_public_key(other.info().public_key);
                    node.add_peer(peer).await?;
                }
            }
        }

        Ok(Self { nodes, network })
    }

    pub fn instance_name(index: usize) -> InstanceId {
        InstanceId::new(format!("agent-{:02}", index))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MemoryNode> {
        self.nodes.iter()
    }

    pub fn get(&self, index: usize) -> Option<&MemoryNode> {
        self.nodes.get(index)
    }

    /// The shared network, for partitions and delays
    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    /// One gossip round on every node, all running concurrently
    pub async fn run_round(&self) -> Result<Vec<RoundReport>> {
        let reports = join_all(self.nodes.iter().map(|n| n.gossip_round())).await;
        Ok(reports.into_iter().collect::<crate::Result<Vec<_>>>()?)
    }

    pub async fn run_rounds(&self, rounds: usize) -> Result<()> {
        for _ in 0..rounds {
            self.run_round().await?;
        }
        Ok(())
    }

    /// One anti-entropy exchange per node, all running concurrently
    pub async fn run_anti_entropy(&self) -> Result<()> {
        let results = join_all(self.nodes.iter().map(|n| n.anti_entropy())).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Number of nodes holding `id`
    pub async fn holders(&self, id: &RecordId) -> Result<usize> {
        let mut count = 0;
        for node in &self.nodes {
            if node.holds(id).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }

    pub fn into_inner(self) -> Vec<MemoryNode> {
        self.nodes
    }
}

impl Index<usize> for SimCluster {
    type Output = MemoryNode;

    fn index(&self, index: usize) -> &Self::Output {
        &self.nodes[index]
    }
}
