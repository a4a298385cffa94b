//! A complete peerkeep node
//!
//! `Node` owns the shared context and every engine. Inbound peer messages
//! are offered to the engines in turn (host, replication, verification,
//! recovery) until one claims them; the periodic sweeps are exposed both as
//! plain async methods and as scheduler jobs.

pub mod context;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backup::{BackupEngine, BackupError, FileBackup, RootBackup};
use crate::clock::{Clock, SystemClock};
use crate::cloud::{BlobFetcher, CloudError, LocalDirObjectStore, ObjectStore, UrlBlobFetcher};
use crate::config::{ConfigError, NodeConfig};
use crate::host::store::HostedBlockStore;
use crate::host::{HostError, HostService};
use crate::model::{BlockId, PeerId, RecoveryState};
use crate::network::{NetworkError, PeerRegistry};
use crate::pipeline::{BlockCipher, BlockKey, CryptoError};
use crate::protocol::{Dispatch, Inbound, MessageHandler};
use crate::recovery::{CloudRecovery, RecoveryEngine, RecoveryError, RestoreSweep};
use crate::replication::{DistributeSummary, ReplicationEngine, UploadSummary};
use crate::scheduler::{JobFactory, TaskKind, TaskScheduler};
use crate::store::{MetadataStore, StoreError};
use crate::verification::{VerificationEngine, VerifySweep};

use context::NodeContext;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),
}

/// Collaborators a node does not build itself.
pub struct NodeDeps {
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<PeerRegistry>,
    pub object_stores: Vec<Arc<dyn ObjectStore>>,
    pub fetcher: Arc<dyn BlobFetcher>,
}

impl NodeDeps {
    /// System clock, an empty registry, the configured directory object
    /// stores and a URL fetcher.
    pub fn from_config(config: &NodeConfig) -> Result<Self, NodeError> {
        let object_stores = config
            .cloud
            .iter()
            .map(|c| Arc::new(LocalDirObjectStore::new(c.name.clone(), c.directory.clone())) as Arc<dyn ObjectStore>)
            .collect();
        Ok(Self {
            clock: Arc::new(SystemClock),
            registry: PeerRegistry::new(),
            object_stores,
            fetcher: Arc::new(UrlBlobFetcher::new()?),
        })
    }
}

pub struct Node {
    ctx: Arc<NodeContext>,
    host: HostService,
    replication: ReplicationEngine,
    verification: VerificationEngine,
    recovery: RecoveryEngine,
    backup: BackupEngine,
}

impl Node {
    pub fn open(config: NodeConfig, deps: NodeDeps) -> Result<Arc<Self>, NodeError> {
        config.validate()?;
        let key = BlockKey::load_or_generate(&config.key_path())?;
        let cipher = BlockCipher::new(&key)?;
        let store = MetadataStore::load_or_create(config.metadata_path())?;
        let host = HostService::new(
            config.host.clone(),
            HostedBlockStore::new(config.host_dir()),
            Arc::clone(&deps.registry),
            deps.fetcher,
        );

        let ctx = Arc::new(NodeContext::new(
            config,
            store,
            cipher,
            deps.clock,
            deps.registry,
            deps.object_stores,
        ));
        if let Some(state) = ctx.store.read(|c| c.recovery_state())? {
            log::info!("Resuming recovery in state {:?}", state);
        }
        log::info!("Node {} opened at {}", ctx.local_id(), ctx.config.data_dir.display());

        Ok(Arc::new(Self {
            host,
            replication: ReplicationEngine::new(Arc::clone(&ctx)),
            verification: VerificationEngine::new(Arc::clone(&ctx)),
            recovery: RecoveryEngine::new(Arc::clone(&ctx)),
            backup: BackupEngine::new(Arc::clone(&ctx)),
            ctx,
        }))
    }

    pub fn id(&self) -> PeerId {
        self.ctx.local_id()
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.ctx.registry
    }

    pub fn host(&self) -> &HostService {
        &self.host
    }

    /// Offer a message to each engine until one takes it.
    pub async fn dispatch(&self, inbound: Inbound) {
        let handlers: [&dyn MessageHandler; 4] = [
            &self.host,
            &self.replication,
            &self.verification,
            &self.recovery,
        ];
        let mut pending = inbound;
        for handler in handlers {
            match handler.handle(pending).await {
                Dispatch::Handled => return,
                Dispatch::Pass(inbound) => pending = inbound,
            }
        }
        log::debug!(
            "Unhandled {} from {}",
            pending.message.kind(),
            pending.from
        );
    }

    /// Dispatch everything already queued. Returns how many messages were
    /// handled.
    pub async fn drain(&self, inbox: &mut mpsc::UnboundedReceiver<Inbound>) -> usize {
        let mut handled = 0;
        while let Ok(inbound) = inbox.try_recv() {
            self.dispatch(inbound).await;
            handled += 1;
        }
        handled
    }

    /// Dispatch inbound messages until the inbox closes.
    pub fn spawn_dispatch_loop(
        self: &Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Inbound>,
    ) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(inbound) = inbox.recv().await {
                node.dispatch(inbound).await;
            }
            log::info!("Inbox closed; dispatch loop stopped");
        })
    }

    /// Register every periodic sweep with the scheduler.
    pub fn start_background(self: &Arc<Self>, scheduler: &Arc<TaskScheduler>) {
        let intervals = &self.ctx.config.scheduler;
        let secs = |s: u64| std::time::Duration::from_secs(s.max(1));

        scheduler.every(TaskKind::Backup, secs(intervals.backup_interval_secs), self.job(|node| {
            async move { node.backup_all().await.map(|_| ()).map_err(|e| e.to_string()) }.boxed()
        }));
        scheduler.every(TaskKind::Upload, secs(intervals.upload_interval_secs), self.job(|node| {
            async move { node.upload().await.map(|_| ()).map_err(|e| e.to_string()) }.boxed()
        }));
        scheduler.every(
            TaskKind::Distribute,
            secs(intervals.distribute_interval_secs),
            self.job(|node| {
                async move { node.distribute().await.map(|_| ()).map_err(|e| e.to_string()) }.boxed()
            }),
        );
        scheduler.every(TaskKind::Verify, secs(intervals.verify_interval_secs), self.job(|node| {
            async move { node.verify().await.map(|_| ()).map_err(|e| e.to_string()) }.boxed()
        }));
        scheduler.every(TaskKind::Restore, secs(intervals.restore_interval_secs), self.job(|node| {
            async move { node.restore_sweep().await.map(|_| ()).map_err(|e| e.to_string()) }.boxed()
        }));
        scheduler.every(TaskKind::Flush, secs(intervals.flush_interval_secs), self.job(|node| {
            async move { node.flush().await.map(|_| ()).map_err(|e| e.to_string()) }.boxed()
        }));
    }

    /// Write pending metadata changes to disk.
    pub async fn flush(&self) -> Result<bool, NodeError> {
        Ok(self.ctx.store.flush().await?)
    }

    /// Flush after a sweep; a failed flush is retried by the next one.
    async fn persisted<T>(&self, result: Result<T, NodeError>) -> Result<T, NodeError> {
        if let Err(e) = self.ctx.store.flush().await {
            log::warn!("Metadata flush failed: {}", e);
        }
        result
    }

    fn job(
        self: &Arc<Self>,
        run: fn(Arc<Node>) -> futures_util::future::BoxFuture<'static, Result<(), String>>,
    ) -> JobFactory {
        let node = Arc::clone(self);
        Arc::new(move || run(Arc::clone(&node)))
    }

    // ===== Backup =====

    /// Backups are skipped, not failed, while recovering.
    pub async fn backup_all(&self) -> Result<RootBackup, NodeError> {
        let result = match self.backup.backup_all().await {
            Err(BackupError::Recovering) => {
                log::info!("Backup skipped while recovering");
                Ok(RootBackup::default())
            }
            other => other.map_err(NodeError::from),
        };
        self.persisted(result).await
    }

    pub async fn backup_root(&self, name: &str) -> Result<RootBackup, NodeError> {
        let result = self.backup.backup_root(name).await.map_err(NodeError::from);
        self.persisted(result).await
    }

    /// Back up one file below a configured root.
    pub async fn backup_file(&self, root: &str, path: &Path) -> Result<FileBackup, NodeError> {
        let root = self
            .ctx
            .config
            .backup_root(root)
            .cloned()
            .ok_or_else(|| BackupError::UnknownRoot(root.to_string()))?;
        let result = self.backup.backup_file(&root, path).await.map_err(NodeError::from);
        self.persisted(result).await
    }

    pub async fn write_catalog_snapshot(&self) -> Result<BlockId, NodeError> {
        let result = self.backup.write_catalog_snapshot().await.map_err(NodeError::from);
        self.persisted(result).await
    }

    // ===== Replication and verification =====

    pub async fn upload(&self) -> Result<UploadSummary, NodeError> {
        let result = self.replication.upload_staged().await.map_err(NodeError::from);
        self.persisted(result).await
    }

    /// Push pending blocks, then ask holders to return under-replicated ones.
    pub async fn distribute(&self) -> Result<DistributeSummary, NodeError> {
        let result = async {
            let summary = self.replication.distribute().await?;
            if !summary.skipped_for_recovery {
                self.replication.verify_enough_replicas().await?;
            }
            Ok::<_, NodeError>(summary)
        }
        .await;
        self.persisted(result).await
    }

    pub async fn verify(&self) -> Result<VerifySweep, NodeError> {
        let result = self.verification.verify_sweep().await.map_err(NodeError::from);
        self.persisted(result).await
    }

    pub fn has_enough_verified_replicas(&self, id: &BlockId) -> Result<bool, NodeError> {
        Ok(self.replication.has_enough_verified_replicas(id)?)
    }

    // ===== Recovery and restore =====

    pub fn recovery_state(&self) -> Result<Option<RecoveryState>, NodeError> {
        Ok(self.recovery.state()?)
    }

    pub async fn start_recovery(&self) -> Result<usize, NodeError> {
        let result = self.recovery.start().await.map_err(NodeError::from);
        self.persisted(result).await
    }

    pub fn recovered_catalogs(&self) -> Result<Vec<BlockId>, NodeError> {
        Ok(self.recovery.recovered_catalogs()?)
    }

    pub fn bind_directory(&self, name: &str, target: impl Into<PathBuf>) -> Result<(), NodeError> {
        Ok(self.recovery.bind_directory(name, target)?)
    }

    pub async fn select_catalog(&self, id: &BlockId) -> Result<usize, NodeError> {
        let result = self.recovery.select_catalog(id).await.map_err(NodeError::from);
        self.persisted(result).await
    }

    pub async fn recover_from_cloud(&self) -> Result<CloudRecovery, NodeError> {
        let result = self.recovery.recover_from_cloud().await.map_err(NodeError::from);
        self.persisted(result).await
    }

    pub async fn request_restore(
        &self,
        directory: &str,
        relative_path: &str,
        at: DateTime<Utc>,
        target: impl Into<PathBuf>,
    ) -> Result<usize, NodeError> {
        let result = self
            .recovery
            .request_restore(directory, relative_path, at, target)
            .await
            .map_err(NodeError::from);
        self.persisted(result).await
    }

    pub async fn restore_sweep(&self) -> Result<RestoreSweep, NodeError> {
        let result = self.recovery.restore_sweep().await.map_err(NodeError::from);
        self.persisted(result).await
    }
}
