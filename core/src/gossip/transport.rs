//! Peer transport abstraction
//!
//! The core never opens sockets itself. An embedding application supplies
//! a `PeerTransport`; `LocalNetwork` is the in-process implementation used
//! for simulation and tests.

use crate::types::InstanceId;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Moves opaque payloads between instances
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver a payload; `Ok` once the peer has accepted it
    async fn send(&self, peer: &InstanceId, payload: Bytes) -> Result<()>;

    /// Deliver a payload and wait for the peer's response
    async fn request(&self, peer: &InstanceId, payload: Bytes) -> Result<Bytes>;
}

/// Inbound payload handed to a node, with a reply slot for requests
#[derive(Debug)]
pub struct InboundEnvelope {
    pub payload: Bytes,
    pub reply: Option<oneshot::Sender<Bytes>>,
}

/// Capacity of each node's inbox
const INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Endpoint {
    inbox: mpsc::Sender<InboundEnvelope>,
    unreachable: bool,
    delay: Option<Duration>,
}

/// In-process router between simulated instances
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    endpoints: Arc<RwLock<HashMap<InstanceId, Endpoint>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an instance and return its inbox
    pub async fn register(&self, id: InstanceId) -> mpsc::Receiver<InboundEnvelope> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.endpoints.write().await.insert(
            id,
            Endpoint {
                inbox: tx,
                unreachable: false,
                delay: None,
            },
        );
        rx
    }

    pub async fn unregister(&self, id: &InstanceId) {
        self.endpoints.write().await.remove(id);
    }

    /// Simulate a partition: deliveries to `id` fail immediately
    pub async fn set_unreachable(&self, id: &InstanceId, unreachable: bool) {
        if let Some(endpoint) = self.endpoints.write().await.get_mut(id) {
            endpoint.unreachable = unreachable;
        }
    }

    /// Simulate a slow link to `id`
    pub async fn set_delay(&self, id: &InstanceId, delay: Option<Duration>) {
        if let Some(endpoint) = self.endpoints.write().await.get_mut(id) {
            endpoint.delay = delay;
        }
    }

    async fn endpoint(&self, peer: &InstanceId) -> Result<Endpoint> {
        let endpoint = self
            .endpoints
            .read()
            .await
            .get(peer)
            .cloned()
            .ok_or_else(|| peer_unreachable(peer, "unknown peer"))?;
        if endpoint.unreachable {
            return Err(peer_unreachable(peer, "partitioned"));
        }
        if let Some(delay) = endpoint.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(endpoint)
    }
}

fn peer_unreachable(peer: &InstanceId, reason: &str) -> Error {
    Error::PeerUnreachable {
        peer: peer.clone(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl PeerTransport for LocalNetwork {
    async fn send(&self, peer: &InstanceId, payload: Bytes) -> Result<()> {
        let endpoint = self.endpoint(peer).await?;
        endpoint
            .inbox
            .send(InboundEnvelope { payload, reply: None })
            .await
            .map_err(|_| peer_unreachable(peer, "inbox closed"))
    }

    async fn request(&self, peer: &InstanceId, payload: Bytes) -> Result<Bytes> {
        let endpoint = self.endpoint(peer).await?;
        let (tx, rx) = oneshot::channel();
        endpoint
            .inbox
            .send(InboundEnvelope {
                payload,
                reply: Some(tx),
            })
            .await
            .map_err(|_| peer_unreachable(peer, "inbox closed"))?;
        rx.await.map_err(|_| peer_unreachable(peer, "no response"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_reply() {
        let network = LocalNetwork::new();
        let mut inbox = network.register(InstanceId::new("b")).await;

        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                if let Some(reply) = envelope.reply {
                    let _ = reply.send(envelope.payload);
                }
            }
        });

        let echoed = network
            .request(&InstanceId::new("b"), Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(&echoed[..], b"ping");
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let network = LocalNetwork::new();
        let _inbox = network.register(InstanceId::new("b")).await;
        network.set_unreachable(&InstanceId::new("b"), true).await;

        let err = network
            .send(&InstanceId::new("b"), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let err = network
            .send(&InstanceId::new("nobody"), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_dropped_inbox_is_unreachable() {
        let network = LocalNetwork::new();
        let inbox = network.register(InstanceId::new("b")).await;
        drop(inbox);
        assert!(network.request(&InstanceId::new("b"), Bytes::new()).await.is_err());
    }
}
