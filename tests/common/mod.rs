//! In-process cluster for end-to-end tests.
//!
//! Every node runs the full message stack over a `SimNetwork` and shares one
//! `ManualClock`. Nothing runs in the background: tests call the sweeps
//! explicitly and `settle` delivers messages until the network is quiet.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use peerkeep::cloud::{LocalDirObjectStore, ObjectStore, UrlBlobFetcher};
use peerkeep::config::BackupRoot;
use peerkeep::network::simulated::SimNetwork;
use peerkeep::network::PeerRegistry;
use peerkeep::protocol::Inbound;
use peerkeep::store::BlockFiles;
use peerkeep::{BlockId, ManualClock, Node, NodeConfig, NodeDeps, PeerId};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

pub struct TestNode {
    pub node: Arc<Node>,
    pub inbox: UnboundedReceiver<Inbound>,
    pub data: TempDir,
    /// Contents of the node's "docs" backup root.
    pub files: TempDir,
}

impl TestNode {
    pub fn id(&self) -> PeerId {
        self.node.id()
    }

    pub fn docs(&self) -> &Path {
        self.files.path()
    }

    pub fn write_file(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.files.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }
}

pub struct Cluster {
    pub network: Arc<SimNetwork>,
    pub clock: Arc<ManualClock>,
    pub nodes: Vec<TestNode>,
    /// Key files live outside data dirs so a node can be rebuilt from scratch.
    pub keys: TempDir,
}

impl Cluster {
    /// `size` fully connected nodes.
    pub async fn new(size: usize) -> Self {
        Self::with_config(size, |_, _| {}).await
    }

    /// `configure` sees each node's index and config before it opens.
    pub async fn with_config(size: usize, configure: impl Fn(usize, &mut NodeConfig)) -> Self {
        let mut cluster = Self {
            network: SimNetwork::new(),
            clock: Arc::new(ManualClock::starting_now()),
            nodes: Vec::new(),
            keys: tempfile::tempdir().unwrap(),
        };
        for i in 0..size {
            let data = tempfile::tempdir().unwrap();
            let files = tempfile::tempdir().unwrap();
            let mut config = NodeConfig::with_data_dir(data.path());
            config.key_file = Some(cluster.keys.path().join(format!("node-{}.key", i)));
            config.backup_roots.push(BackupRoot {
                name: "docs".into(),
                path: files.path().to_path_buf(),
            });
            configure(i, &mut config);
            let node = cluster.open(config, data, files);
            cluster.nodes.push(node);
        }
        for i in 0..size {
            cluster.connect(i).await;
        }
        cluster
    }

    fn open(&self, config: NodeConfig, data: TempDir, files: TempDir) -> TestNode {
        let object_stores: Vec<Arc<dyn ObjectStore>> = config
            .cloud
            .iter()
            .map(|c| Arc::new(LocalDirObjectStore::new(c.name.clone(), c.directory.clone())) as Arc<dyn ObjectStore>)
            .collect();
        let inbox = self.network.join(config.node_id);
        let deps = NodeDeps {
            clock: self.clock.clone(),
            registry: PeerRegistry::new(),
            object_stores,
            fetcher: Arc::new(UrlBlobFetcher::new().unwrap()),
        };
        TestNode {
            node: Node::open(config, deps).unwrap(),
            inbox,
            data,
            files,
        }
    }

    /// Register channels from node `i` to every other node and back.
    async fn connect(&self, i: usize) {
        let id = self.nodes[i].id();
        for (j, other) in self.nodes.iter().enumerate() {
            if j == i {
                continue;
            }
            self.nodes[i]
                .node
                .registry()
                .add(self.network.channel(id, other.id()))
                .await;
            other.node.registry().add(self.network.channel(other.id(), id)).await;
        }
    }

    pub fn node(&self, i: usize) -> &Arc<Node> {
        &self.nodes[i].node
    }

    /// Deliver queued messages, round after round, until no node has any.
    pub async fn settle(&mut self) -> usize {
        let mut total = 0;
        for _ in 0..100 {
            let mut moved = 0;
            for n in self.nodes.iter_mut() {
                moved += n.node.drain(&mut n.inbox).await;
            }
            if moved == 0 {
                return total;
            }
            total += moved;
        }
        panic!("cluster did not settle");
    }

    /// Simulate losing node `i`'s disk: a fresh data dir, the same identity
    /// and key, and the same backup root contents.
    pub async fn rebuild(&mut self, i: usize, configure: impl FnOnce(&mut NodeConfig)) {
        let old = &self.nodes[i];
        let data = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::with_data_dir(data.path());
        config.node_id = old.id();
        config.key_file = Some(self.keys.path().join(format!("node-{}.key", i)));
        configure(&mut config);
        let files = tempfile::tempdir().unwrap();
        let rebuilt = self.open(config, data, files);
        self.nodes[i] = rebuilt;
        self.connect(i).await;
    }

    /// Backup, then alternate distribution and verification until every
    /// block of node `owner` is at its replica target and released.
    pub async fn replicate(&mut self, owner: usize) {
        for _ in 0..5 {
            self.node(owner).distribute().await.unwrap();
            self.settle().await;
            self.node(owner).verify().await.unwrap();
            self.settle().await;
        }
        self.node(owner).distribute().await.unwrap();
        self.settle().await;
    }

    /// Files hosted by node `host` on behalf of node `owner`.
    pub fn hosted(&self, host: usize, owner: usize) -> BlockFiles {
        let root = self.nodes[host].data.path().join("hosted");
        BlockFiles::new(root.join(self.nodes[owner].id().to_string()).join("blocks"))
    }

    pub fn block_ids(&self, i: usize) -> Vec<BlockId> {
        self.node(i)
            .context()
            .store
            .read(|c| c.blocks().map(|b| b.id.clone()).collect())
            .unwrap()
    }
}

/// Deterministic content that does not repeat at chunk boundaries.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ (i / 7919) as u8).collect()
}
