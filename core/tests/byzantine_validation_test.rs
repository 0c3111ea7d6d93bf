//! Integration tests for vote dissemination and Byzantine-resistant validation

mod common;

use chrysalis_core::config::{ConsensusConfig, GossipConfig, ValidationConfig};
use chrysalis_core::crypto::LocalIdentity;
use chrysalis_core::gossip::GossipMessage;
use chrysalis_core::node::RecordDraft;
use chrysalis_core::simtest::SimCluster;
use chrysalis_core::record::ValidationVote;
use chrysalis_core::types::{InstanceId, MemoryType};
use chrysalis_core::validation::ValidationOutcome;
use chrysalis_core::Error;

fn config() -> ConsensusConfig {
    ConsensusConfig {
        gossip: GossipConfig {
            rng_seed: Some(3),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_two_byzantine_voters_cannot_sink_a_record() -> anyhow::Result<()> {
    common::init_test_logging();

    let config = config();
    let cluster = SimCluster::with_config(10, config.clone()).await?;
    let record = cluster[0]
        .create_record(RecordDraft::new("the primary database is in us-east-1", MemoryType::Knowledge).importance(0.9))
        .await?;
    cluster.run_rounds(config.gossip.rounds_to_reach(10) as usize).await?;
    assert_eq!(cluster.holders(&record.id()).await?, 10);
    assert!((record.importance() - 0.9).abs() < 1e-9);

    // Eight honest voters, two colluding at zero
    for i in 0..10 {
        let confidence = if i < 8 { 0.9 } else { 0.0 };
        cluster[i].cast_vote(&record.id(), confidence).await?;
    }

    common::await_record(&cluster[0], &record.id(), |r| r.meta.validation.votes.len() == 10).await?;
    let report = cluster[0].validate(&record.id()).await?.into_result()?;

    println!(
        "✓ valid={} trimmed_mean={:.3} median={:.3} trimmed_per_side={}",
        report.valid, report.trimmed_mean, report.median, report.trimmed_per_side
    );
    assert!(report.valid);
    assert!((report.trimmed_mean - 0.9).abs() < 1e-9);
    assert_eq!(report.threshold_required, 7);
    assert_eq!(report.outliers.len(), 2);

    let stored = cluster[0].get(&record.id()).await?.expect("record present");
    assert!(stored.meta.validation.meets_threshold());
    assert_eq!(stored.meta.validation.verified_by().len(), 10);
    assert!((stored.confidence() - 0.9).abs() < 1e-9);
    Ok(())
}

#[tokio::test]
async fn test_too_few_votes_stays_pending() -> anyhow::Result<()> {
    let cluster = SimCluster::with_config(10, config()).await?;
    let record = cluster[0].remember("maybe true", MemoryType::Thought).await?;
    cluster.run_rounds(3).await?;

    for i in 0..6 {
        cluster[i].cast_vote(&record.id(), 0.9).await?;
    }
    common::await_record(&cluster[0], &record.id(), |r| r.meta.validation.votes.len() == 6).await?;

    let outcome = cluster[0].validate(&record.id()).await?;
    assert_eq!(outcome, ValidationOutcome::Insufficient { received: 6, required: 7 });
    assert!(matches!(
        outcome.into_result(),
        Err(Error::InsufficientVotes { received: 6, required: 7 })
    ));

    // A seventh voter tips it over
    cluster[6].cast_vote(&record.id(), 0.8).await?;
    common::await_record(&cluster[0], &record.id(), |r| r.meta.validation.votes.len() == 7).await?;
    assert!(cluster[0].validate(&record.id()).await?.is_valid());
    Ok(())
}

#[tokio::test]
async fn test_revote_replaces_earlier_vote() -> anyhow::Result<()> {
    let cluster = SimCluster::with_config(3, config()).await?;
    let record = cluster[0].remember("flaky test is fixed", MemoryType::Result).await?;
    cluster.run_rounds(2).await?;

    cluster[1].cast_vote(&record.id(), 0.2).await?;
    cluster[1].cast_vote(&record.id(), 0.9).await?;

    let copy = common::await_record(&cluster[0], &record.id(), |r| {
        r.meta
            .validation
            .votes
            .get(cluster[1].instance_id())
            .map(|v| v.confidence == 0.9)
            .unwrap_or(false)
    })
    .await?;
    assert_eq!(copy.meta.validation.votes.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_vote_before_record_is_held_back() -> anyhow::Result<()> {
    let cluster = SimCluster::with_config(2, config()).await?;
    let record = cluster[0].remember("vote raced ahead", MemoryType::Observation).await?;

    // The vote reaches agent-01 before the record does
    cluster[0].cast_vote(&record.id(), 0.75).await?;
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while cluster[1].metrics().await?.votes_held_back == 0 {
        assert!(tokio::time::Instant::now() < deadline, "vote never held back");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(cluster[1].get(&record.id()).await?.is_none());

    cluster.run_round().await?;
    let copy = common::await_record(&cluster[1], &record.id(), |r| !r.meta.validation.votes.is_empty()).await?;
    assert_eq!(copy.meta.validation.votes[cluster[0].instance_id()].confidence, 0.75);
    Ok(())
}

#[tokio::test]
async fn test_vote_window_closes_with_decision() -> anyhow::Result<()> {
    let config = ConsensusConfig {
        validation: ValidationConfig {
            collection_window_ms: 50,
            population: Some(3),
            ..Default::default()
        },
        ..config()
    };
    let cluster = SimCluster::with_config(3, config).await?;
    let record = cluster[0].remember("windowed", MemoryType::Knowledge).await?;
    cluster.run_rounds(2).await?;

    for i in 0..3 {
        cluster[i].cast_vote(&record.id(), 0.85).await?;
    }
    common::await_record(&cluster[0], &record.id(), |r| r.meta.validation.votes.len() == 3).await?;

    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    let report = cluster[0].maintenance().await?;
    assert_eq!(report.decided, vec![record.id()]);

    let stored = cluster[0].get(&record.id()).await?.expect("record present");
    assert!(stored.meta.validation.meets_threshold());
    Ok(())
}

#[tokio::test]
async fn test_out_of_range_vote_rejected() -> anyhow::Result<()> {
    let cluster = SimCluster::with_config(2, config()).await?;
    let record = cluster[0].remember("bounded", MemoryType::Thought).await?;
    assert!(cluster[0].cast_vote(&record.id(), 1.2).await.is_err());
    assert!(cluster[0].cast_vote(&record.id(), f64::NAN).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_one_peer_cannot_invent_voters() -> anyhow::Result<()> {
    common::init_test_logging();

    let cluster = SimCluster::with_config(10, config()).await?;
    let record = cluster[0].remember("sybils agree", MemoryType::Knowledge).await?;
    cluster.run_rounds(3).await?;

    // agent-09 speaks for seven made-up instances, each with a valid key of its own
    for i in 0..7 {
        let sybil = LocalIdentity::generate(InstanceId::new(format!("sybil-{}", i)), 10 + i);
        let vote = ValidationVote::signed(&sybil, record.id(), 1.0, 1)?;
        let message = GossipMessage::Vote {
            vote,
            sender_id: SimCluster::instance_name(9),
        };
        common::send(&cluster, 0, message).await?;
    }

    let outcome = cluster[0].validate(&record.id()).await?;
    assert_eq!(outcome, ValidationOutcome::Insufficient { received: 0, required: 7 });
    assert_eq!(cluster[0].metrics().await?.votes_rejected, 7);

    let peers = cluster[0].peers().await?;
    let score = peers
        .iter()
        .find(|p| p.id == SimCluster::instance_name(9))
        .map(|p| p.score)
        .unwrap_or(1.0);
    assert!(score < 1.0);
    Ok(())
}
