//! SimTest - in-process cluster simulation
//!
//! Runs many memory nodes on one tokio runtime, wired together through a
//! `LocalNetwork`, so gossip, validation and partitions can be exercised
//! without sockets.
//!
//! # Architecture
//!
//! - `SimCluster`: N fully meshed nodes sharing one network
//! - Utilities for awaiting propagation and consistency
//!
//! # Example
//!
//! ```no_run
//! use chrysalis_core::simtest::*;
//! use chrysalis_core::MemoryType;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let cluster = SimCluster::new(5).await?;
//! let record = cluster[0].remember("the build is green", MemoryType::Observation).await?;
//! cluster.run_rounds(3).await?;
//! assert_eq!(cluster.holders(&record.id()).await?, 5);
//! # Ok(())
//! # }
//! ```

mod cluster;
mod consistency;

pub use cluster::SimCluster;
pub use consistency::{await_consistency, await_record_everywhere};
