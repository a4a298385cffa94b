//! In-process peer network
//!
//! Every node gets an unbounded inbox. Channels push each message through
//! the wire codec before delivering it, so tests exercise the same encoding
//! real connections use. Nodes can be switched offline to model churn.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{NetworkError, PeerChannel};
use crate::model::PeerId;
use crate::protocol::{decode_frame, encode_frame, Inbound, PeerMessage};

struct SimNode {
    inbox: mpsc::UnboundedSender<Inbound>,
    online: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct SimNetwork {
    nodes: Mutex<HashMap<PeerId, SimNode>>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node and hand back its inbox.
    pub fn join(&self, id: PeerId) -> mpsc::UnboundedReceiver<Inbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = SimNode {
            inbox: tx,
            online: Arc::new(AtomicBool::new(true)),
        };
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, node);
        rx
    }

    /// A channel from `from` to `to`.
    pub fn channel(self: &Arc<Self>, from: PeerId, to: PeerId) -> Arc<SimChannel> {
        Arc::new(SimChannel {
            from,
            to,
            network: Arc::clone(self),
        })
    }

    pub fn set_online(&self, id: PeerId, online: bool) {
        if let Some(node) = self
            .nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
        {
            node.online.store(online, Ordering::SeqCst);
        }
    }

    pub fn is_online(&self, id: &PeerId) -> bool {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|n| n.online.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn deliver(&self, to: PeerId, inbound: Inbound) -> Result<(), NetworkError> {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let node = nodes.get(&to).ok_or(NetworkError::UnknownPeer(to))?;
        node.inbox
            .send(inbound)
            .map_err(|_| NetworkError::SendFailed(format!("inbox of {} closed", to)))
    }
}

pub struct SimChannel {
    from: PeerId,
    to: PeerId,
    network: Arc<SimNetwork>,
}

#[async_trait]
impl PeerChannel for SimChannel {
    fn peer_id(&self) -> PeerId {
        self.to
    }

    fn is_online(&self) -> bool {
        self.network.is_online(&self.from) && self.network.is_online(&self.to)
    }

    async fn send(&self, message: &PeerMessage) -> Result<(), NetworkError> {
        if !self.is_online() {
            return Err(NetworkError::Offline(self.to));
        }
        let frame = encode_frame(message)?;
        let decoded = decode_frame(&frame)?;
        self.network
            .deliver(self.to, Inbound::new(self.from, decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockId;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_delivers_through_codec() {
        let network = SimNetwork::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let _inbox_a = network.join(a);
        let mut inbox_b = network.join(b);

        let message = PeerMessage::Delete {
            ids: vec![BlockId::new_random()],
        };
        network.channel(a, b).send(&message).await.unwrap();

        let received = inbox_b.try_recv().unwrap();
        assert_eq!(received.from, a);
        assert_eq!(received.message, message);
    }

    #[tokio::test]
    async fn test_offline_peer_fails_fast() {
        let network = SimNetwork::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let _inbox_a = network.join(a);
        let mut inbox_b = network.join(b);
        let channel = network.channel(a, b);

        network.set_online(b, false);
        assert!(!channel.is_online());
        assert!(matches!(
            channel.send(&PeerMessage::CatalogRequest).await,
            Err(NetworkError::Offline(_))
        ));
        assert!(inbox_b.try_recv().is_err());

        network.set_online(b, true);
        assert!(channel.send(&PeerMessage::CatalogRequest).await.is_ok());
    }
}
