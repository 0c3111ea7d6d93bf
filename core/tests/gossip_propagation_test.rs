//! Integration tests for push/digest gossip across simulated clusters

mod common;

use chrysalis_core::config::{ConsensusConfig, GossipConfig};
use chrysalis_core::gossip::PropagationState;
use chrysalis_core::simtest::{await_consistency, SimCluster};
use chrysalis_core::types::MemoryType;
use std::time::Duration;

fn seeded(seed: u64) -> ConsensusConfig {
    ConsensusConfig {
        gossip: GossipConfig {
            rng_seed: Some(seed),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_record_reaches_27_instances_within_expected_rounds() -> anyhow::Result<()> {
    common::init_test_logging();

    let config = seeded(27);
    let expected_rounds = config.gossip.rounds_to_reach(27);
    assert_eq!(expected_rounds, 3);

    let cluster = SimCluster::with_config(27, config).await?;
    let record = cluster[0]
        .remember("release 1.4 shipped to production", MemoryType::Observation)
        .await?;
    println!("✓ Record {} created on {}", record.id(), cluster[0].instance_id());

    for round in 1..=expected_rounds {
        cluster.run_round().await?;
        println!("  round {}: {} holders", round, cluster.holders(&record.id()).await?);
    }

    assert_eq!(cluster.holders(&record.id()).await?, 27);
    println!("✓ All 27 instances hold the record after {} rounds", expected_rounds);
    Ok(())
}

#[tokio::test]
async fn test_ten_node_cluster_converges() -> anyhow::Result<()> {
    common::init_test_logging();

    let cluster = SimCluster::with_config(10, seeded(10)).await?;
    let mut ids = Vec::new();
    for i in 0..5 {
        let record = cluster[i * 2]
            .remember(format!("observation number {}", i), MemoryType::Observation)
            .await?;
        ids.push(record.id());
    }

    cluster.run_rounds(3).await?;
    await_consistency(Duration::from_secs(2), &cluster).await?;

    for node in cluster.iter() {
        let held = node.record_ids().await?;
        assert_eq!(held.len(), 5);
        for id in &ids {
            assert!(held.contains(id));
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_push_phase_ends_once_everyone_has_it() -> anyhow::Result<()> {
    let cluster = SimCluster::with_config(5, seeded(5)).await?;
    let record = cluster[1].remember("short lived push", MemoryType::Action).await?;

    cluster.run_round().await?;
    assert_eq!(cluster.holders(&record.id()).await?, 5);

    // Nobody is left to send to, so the next round retires the record
    cluster.run_round().await?;
    assert_eq!(cluster[1].propagation_state(&record.id()).await?, PropagationState::Propagated);

    let metrics = cluster[1].metrics().await?;
    assert!(metrics.pushes_sent >= 3);
    assert_eq!(metrics.peer_failures, 0);
    Ok(())
}

#[tokio::test]
async fn test_duplicates_are_absorbed() -> anyhow::Result<()> {
    let cluster = SimCluster::with_config(8, seeded(8)).await?;
    let record = cluster[0].remember("heard it twice", MemoryType::Conversation).await?;

    cluster.run_rounds(3).await?;

    let mut duplicates = 0;
    for node in cluster.iter() {
        let copies = node
            .records()
            .await?
            .into_iter()
            .filter(|r| r.id() == record.id())
            .count();
        assert_eq!(copies, 1);
        duplicates += node.metrics().await?.duplicates_received;
    }
    println!("✓ {} duplicate deliveries merged away", duplicates);
    Ok(())
}

#[tokio::test]
async fn test_attribute_changes_are_regossiped() -> anyhow::Result<()> {
    common::init_test_logging();

    let cluster = SimCluster::with_config(10, seeded(99)).await?;
    let record = cluster[0].remember("the cache is cold", MemoryType::Knowledge).await?;
    cluster.run_rounds(3).await?;
    assert_eq!(cluster.holders(&record.id()).await?, 10);

    cluster[3].set_importance(&record.id(), 0.95).await?;
    cluster[3].add_label(&record.id(), "perf").await?;
    cluster.run_rounds(2).await?;

    for node in cluster.iter() {
        let copy = node.get(&record.id()).await?.expect("record present");
        assert_eq!(copy.importance(), 0.95);
        assert_eq!(copy.labels(), vec!["perf".to_string()]);
    }
    println!("✓ Importance and labels reached every replica");
    Ok(())
}

#[tokio::test]
async fn test_seen_by_accumulates() -> anyhow::Result<()> {
    let cluster = SimCluster::with_config(4, seeded(4)).await?;
    let record = cluster[0].remember("who has seen this", MemoryType::Thought).await?;
    cluster.run_rounds(2).await?;

    let origin_copy = cluster[0].get(&record.id()).await?.expect("record present");
    assert_eq!(origin_copy.meta.gossip.seen_by.len(), 4);
    assert_eq!(origin_copy.origin(), cluster[0].instance_id());
    Ok(())
}
