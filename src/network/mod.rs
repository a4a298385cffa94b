//! Peer channels
//!
//! A `PeerChannel` delivers messages to one peer, reliably and in order once
//! connected, with no promise that anything comes back. The `PeerRegistry`
//! holds the current channel per peer; transports and the user-management
//! side add and remove entries explicitly.

pub mod selection;
pub mod simulated;
pub mod tcp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::model::PeerId;
use crate::protocol::{PeerMessage, ProtocolError};

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Peer {0} is offline")]
    Offline(PeerId),

    #[error("No channel to peer {0}")]
    UnknownPeer(PeerId),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl NetworkError {
    /// Failures that the next sweep simply retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NetworkError::Offline(_) | NetworkError::UnknownPeer(_) | NetworkError::SendFailed(_)
        )
    }
}

#[async_trait]
pub trait PeerChannel: Send + Sync {
    fn peer_id(&self) -> PeerId;

    fn is_online(&self) -> bool;

    /// Queue a message for the peer. Fails fast when the peer is unreachable.
    async fn send(&self, message: &PeerMessage) -> Result<(), NetworkError>;
}

#[derive(Default)]
pub struct PeerRegistry {
    channels: RwLock<HashMap<PeerId, Arc<dyn PeerChannel>>>,
}

impl PeerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register (or replace) the channel for its peer.
    pub async fn add(&self, channel: Arc<dyn PeerChannel>) {
        let peer = channel.peer_id();
        self.channels.write().await.insert(peer, channel);
        log::debug!("Registered channel to peer {}", peer);
    }

    pub async fn remove(&self, peer: &PeerId) -> Option<Arc<dyn PeerChannel>> {
        let removed = self.channels.write().await.remove(peer);
        if removed.is_some() {
            log::debug!("Removed channel to peer {}", peer);
        }
        removed
    }

    /// Remove the peer's entry only if it is still `channel`; a newer
    /// connection may already have replaced it.
    pub async fn remove_if_current(&self, channel: &Arc<dyn PeerChannel>) -> bool {
        let mut channels = self.channels.write().await;
        let peer = channel.peer_id();
        let same = channels
            .get(&peer)
            .map(|c| Arc::as_ptr(c) as *const () == Arc::as_ptr(channel) as *const ())
            .unwrap_or(false);
        if same {
            channels.remove(&peer);
        }
        same
    }

    pub async fn get(&self, peer: &PeerId) -> Option<Arc<dyn PeerChannel>> {
        self.channels.read().await.get(peer).cloned()
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.channels.read().await.keys().copied().collect()
    }

    pub async fn online_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .channels
            .read()
            .await
            .values()
            .filter(|c| c.is_online())
            .map(|c| c.peer_id())
            .collect();
        peers.sort();
        peers
    }

    pub async fn is_online(&self, peer: &PeerId) -> bool {
        self.channels
            .read()
            .await
            .get(peer)
            .map(|c| c.is_online())
            .unwrap_or(false)
    }

    pub async fn send(&self, peer: &PeerId, message: &PeerMessage) -> Result<(), NetworkError> {
        let channel = self
            .get(peer)
            .await
            .ok_or(NetworkError::UnknownPeer(*peer))?;
        if !channel.is_online() {
            return Err(NetworkError::Offline(*peer));
        }
        channel.send(message).await
    }

    /// Send, logging instead of failing. Returns whether the message left.
    pub async fn deliver(&self, peer: &PeerId, message: &PeerMessage) -> bool {
        match self.send(peer, message).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Could not send {} to {}: {}", message.kind(), peer, e);
                false
            }
        }
    }

    /// Send to every online peer. Returns how many sends succeeded.
    pub async fn broadcast(&self, message: &PeerMessage) -> usize {
        let mut sent = 0;
        for peer in self.online_peers().await {
            if self.deliver(&peer, message).await {
                sent += 1;
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingChannel {
        peer: PeerId,
        online: AtomicBool,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl PeerChannel for CountingChannel {
        fn peer_id(&self) -> PeerId {
            self.peer
        }

        fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        async fn send(&self, _message: &PeerMessage) -> Result<(), NetworkError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn channel(online: bool) -> Arc<CountingChannel> {
        Arc::new(CountingChannel {
            peer: Uuid::new_v4(),
            online: AtomicBool::new(online),
            sent: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_broadcast_skips_offline_peers() {
        let registry = PeerRegistry::new();
        let up = channel(true);
        let down = channel(false);
        registry.add(up.clone()).await;
        registry.add(down.clone()).await;

        assert_eq!(registry.online_peers().await, vec![up.peer]);
        assert_eq!(registry.broadcast(&PeerMessage::CatalogRequest).await, 1);
        assert_eq!(up.sent.load(Ordering::SeqCst), 1);
        assert_eq!(down.sent.load(Ordering::SeqCst), 0);

        assert!(matches!(
            registry.send(&down.peer, &PeerMessage::CatalogRequest).await,
            Err(NetworkError::Offline(_))
        ));
        assert!(!registry.deliver(&Uuid::new_v4(), &PeerMessage::CatalogRequest).await);
    }

    #[tokio::test]
    async fn test_remove_if_current_ignores_replaced_channel() {
        let registry = PeerRegistry::new();
        let old: Arc<dyn PeerChannel> = channel(true);
        let peer = old.peer_id();
        registry.add(old.clone()).await;

        let replacement: Arc<dyn PeerChannel> = Arc::new(CountingChannel {
            peer,
            online: AtomicBool::new(true),
            sent: AtomicUsize::new(0),
        });
        registry.add(replacement.clone()).await;

        assert!(!registry.remove_if_current(&old).await);
        assert!(registry.get(&peer).await.is_some());
        assert!(registry.remove_if_current(&replacement).await);
        assert!(registry.get(&peer).await.is_none());
    }
}
