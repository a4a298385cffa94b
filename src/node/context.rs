//! State shared by every engine of one node.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;
use crate::cloud::ObjectStore;
use crate::config::NodeConfig;
use crate::model::{BlockId, BlockLocation, PeerId};
use crate::network::PeerRegistry;
use crate::pipeline::BlockCipher;
use crate::protocol::PeerMessage;
use crate::store::{BlockFiles, MetadataStore, StoreError};

pub struct NodeContext {
    pub config: NodeConfig,
    pub store: MetadataStore,
    pub cipher: BlockCipher,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<PeerRegistry>,
    pub object_stores: Vec<Arc<dyn ObjectStore>>,
    /// Encrypted safety copies awaiting enough verified replicas.
    pub staging: BlockFiles,
    /// Decrypted blocks awaiting file materialization.
    pub restore_cache: BlockFiles,
}

impl NodeContext {
    pub fn new(
        config: NodeConfig,
        store: MetadataStore,
        cipher: BlockCipher,
        clock: Arc<dyn Clock>,
        registry: Arc<PeerRegistry>,
        object_stores: Vec<Arc<dyn ObjectStore>>,
    ) -> Self {
        let staging = BlockFiles::new(config.staging_dir());
        let restore_cache = BlockFiles::new(config.restore_cache_dir());
        Self {
            config,
            store,
            cipher,
            clock,
            registry,
            object_stores,
            staging,
            restore_cache,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn local_id(&self) -> PeerId {
        self.config.node_id
    }

    /// How long a verification keeps counting.
    pub fn valid_window(&self) -> Duration {
        self.config.replication.verification_valid()
    }

    pub fn replica_target(&self) -> usize {
        self.config.replication.minimal_replicas
    }

    pub fn object_store(&self, name: &str) -> Option<&Arc<dyn ObjectStore>> {
        self.object_stores.iter().find(|s| s.name() == name)
    }

    pub fn is_recovering(&self) -> Result<bool, StoreError> {
        self.store.read(|c| c.is_recovering())
    }

    /// The block's ciphertext from the staging copy or, failing that, from a
    /// cloud copy that still authenticates.
    pub async fn local_ciphertext(&self, id: &BlockId) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(data) = self.staging.get(id).await? {
            return Ok(Some(data));
        }
        let copies = self
            .store
            .read(|c| c.block(id).map(|b| b.cloud.clone()).unwrap_or_default())?;
        for copy in copies {
            let Some(store) = self.object_store(&copy.store) else {
                continue;
            };
            match store.download(&copy.object).await {
                Ok(data) if self.cipher.decrypt(id, &data).is_ok() => return Ok(Some(data)),
                Ok(_) => log::warn!("Cloud copy of {} in {} does not authenticate", id, copy.store),
                Err(e) => log::debug!("Could not read {} from {}: {}", id, copy.store, e),
            }
        }
        Ok(None)
    }

    /// Pull a demoted location's copy off the peer. The location itself goes
    /// once the peer acknowledges.
    pub async fn demote_and_delete(&self, id: &BlockId, peer: PeerId) -> Result<(), StoreError> {
        let now = self.now();
        let window = self.valid_window();
        self.store.transaction(|c| {
            match c.location_mut(id, &peer) {
                Some(location) => location.demote(now, window),
                None => {
                    let mut location =
                        BlockLocation::provisional(id.clone(), peer, now, window);
                    location.demote(now, window);
                    c.upsert_location(location);
                }
            }
            Ok::<_, StoreError>(())
        })?;
        self.registry
            .deliver(&peer, &PeerMessage::Delete { ids: vec![id.clone()] })
            .await;
        Ok(())
    }
}

/// A single node context over a temp directory, a manual clock and a
/// simulated network, for engine tests.
#[cfg(test)]
pub(crate) struct TestEnv {
    pub clock: Arc<crate::clock::ManualClock>,
    pub network: Arc<crate::network::simulated::SimNetwork>,
    pub inbox: tokio::sync::mpsc::UnboundedReceiver<crate::protocol::Inbound>,
    pub dir: tempfile::TempDir,
}

#[cfg(test)]
impl TestEnv {
    /// Join a remote peer to the network and register a channel to it.
    pub async fn add_peer(
        &self,
        ctx: &NodeContext,
    ) -> (PeerId, tokio::sync::mpsc::UnboundedReceiver<crate::protocol::Inbound>) {
        let peer = uuid::Uuid::new_v4();
        let inbox = self.network.join(peer);
        ctx.registry
            .add(self.network.channel(ctx.local_id(), peer))
            .await;
        (peer, inbox)
    }
}

#[cfg(test)]
pub(crate) fn test_context(configure: impl FnOnce(&mut NodeConfig)) -> (Arc<NodeContext>, TestEnv) {
    use crate::clock::ManualClock;
    use crate::network::simulated::SimNetwork;
    use crate::pipeline::BlockKey;

    let dir = tempfile::tempdir().unwrap();
    let mut config = NodeConfig::with_data_dir(dir.path());
    configure(&mut config);
    let clock = Arc::new(ManualClock::starting_now());
    let network = SimNetwork::new();
    let inbox = network.join(config.node_id);
    let object_stores: Vec<Arc<dyn ObjectStore>> = config
        .cloud
        .iter()
        .map(|c| {
            Arc::new(crate::cloud::LocalDirObjectStore::new(c.name.clone(), c.directory.clone()))
                as Arc<dyn ObjectStore>
        })
        .collect();
    let ctx = NodeContext::new(
        config,
        MetadataStore::in_memory(),
        BlockCipher::new(&BlockKey::generate()).unwrap(),
        clock.clone(),
        PeerRegistry::new(),
        object_stores,
    );
    (
        Arc::new(ctx),
        TestEnv {
            clock,
            network,
            inbox,
            dir,
        },
    )
}
