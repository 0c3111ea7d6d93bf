//! Gossip dissemination
//!
//! Each round a record is pushed in full to `fanout` randomly drawn peers
//! and announced by id to a wider lazy set. Periodic anti-entropy compares
//! id-set summaries with one peer and pulls whatever is missing. Delivery
//! is best-effort and at-least-once; duplicates are absorbed by merge.

pub mod engine;
pub mod message;
pub mod metrics;
pub mod peers;
pub mod transport;

pub use engine::{Dispatch, DispatchKind, GossipEngine, PropagationState, RoundPlan};
pub use message::{GossipMessage, IdSummary};
pub use metrics::GossipMetrics;
pub use peers::{PeerState, PeerTable};
pub use transport::{InboundEnvelope, LocalNetwork, PeerTransport};
