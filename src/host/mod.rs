//! Hosting role
//!
//! The peer side of the protocol: store other owners' ciphertext, prove
//! possession on request, hand blocks back and report inventories for
//! recovery.

pub mod store;

pub use store::{HostedBlockStore, PutOutcome};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::cloud::{BlobFetcher, CloudError};
use crate::config::HostConfig;
use crate::model::{proof_of_storage, BlockId, ChallengeId, PeerId};
use crate::network::PeerRegistry;
use crate::pipeline::verify_mac;
use crate::protocol::{
    BackupFailReason, Dispatch, DownloadRef, Inbound, MessageHandler, MissingReason, PeerMessage,
    RestorePurpose,
};

#[derive(Error, Debug)]
pub enum HostError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Invalid block ID: {0}")]
    InvalidBlockId(String),

    #[error("Block {0} already stored with a different MAC")]
    DifferentMac(String),
}

pub struct HostService {
    config: HostConfig,
    store: HostedBlockStore,
    registry: Arc<PeerRegistry>,
    fetcher: Arc<dyn BlobFetcher>,
}

impl HostService {
    pub fn new(
        config: HostConfig,
        store: HostedBlockStore,
        registry: Arc<PeerRegistry>,
        fetcher: Arc<dyn BlobFetcher>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            fetcher,
        }
    }

    pub fn store(&self) -> &HostedBlockStore {
        &self.store
    }

    fn accepts_owner(&self, owner: &PeerId) -> bool {
        match &self.config.allowed_owners {
            Some(allowed) => allowed.contains(owner),
            None => true,
        }
    }

    async fn handle_backup(
        &self,
        owner: PeerId,
        id: BlockId,
        download_ref: DownloadRef,
        mac: [u8; 32],
        mac_secret: [u8; 32],
    ) {
        let reply = match self.store_backup(&owner, &id, download_ref, &mac, &mac_secret).await {
            Ok(outcome) => {
                log::debug!("Backup {} from {}: {:?}", id, owner, outcome);
                PeerMessage::BackupOk { id }
            }
            Err(reason) => {
                log::info!("Refusing backup {} from {}: {:?}", id, owner, reason);
                PeerMessage::BackupFail { id, reason }
            }
        };
        self.registry.deliver(&owner, &reply).await;
    }

    async fn store_backup(
        &self,
        owner: &PeerId,
        id: &BlockId,
        download_ref: DownloadRef,
        mac: &[u8; 32],
        mac_secret: &[u8; 32],
    ) -> Result<PutOutcome, BackupFailReason> {
        if !self.accepts_owner(owner) {
            return Err(BackupFailReason::NotAllowed);
        }
        if !id.is_well_formed() {
            return Err(BackupFailReason::General);
        }
        match self.store.stored_mac(owner, id).await {
            Ok(Some(existing)) if &existing == mac => return Ok(PutOutcome::AlreadyStored),
            Ok(Some(_)) => return Err(BackupFailReason::AlreadyStoredDifferentMac),
            Ok(None) => {}
            Err(e) => {
                log::error!("Host index unreadable for {}: {}", owner, e);
                return Err(BackupFailReason::General);
            }
        }

        let data = match download_ref {
            DownloadRef::Inline { data } => data,
            DownloadRef::Shared { url } => match self.fetcher.fetch(&url).await {
                Ok(data) => data,
                Err(CloudError::NotFound(_)) => return Err(BackupFailReason::NotFound),
                Err(e) => {
                    log::warn!("Download of {} failed: {}", id, e);
                    return Err(BackupFailReason::General);
                }
            },
        };

        if verify_mac(mac_secret, &data, mac).is_err() {
            return Err(BackupFailReason::WrongMac);
        }

        match self.store.put(owner, id, &data, mac).await {
            Ok(outcome) => Ok(outcome),
            Err(HostError::DifferentMac(_)) => Err(BackupFailReason::AlreadyStoredDifferentMac),
            Err(e) => {
                log::error!("Failed to store {} for {}: {}", id, owner, e);
                Err(BackupFailReason::General)
            }
        }
    }

    async fn handle_delete(&self, owner: PeerId, ids: Vec<BlockId>) {
        let mut deleted = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.delete(&owner, &id).await {
                Ok(()) => deleted.push(id),
                Err(e) => log::warn!("Failed to delete {} for {}: {}", id, owner, e),
            }
        }
        if !deleted.is_empty() {
            self.registry
                .deliver(&owner, &PeerMessage::DeleteOk { ids: deleted })
                .await;
        }
    }

    async fn handle_verify(&self, owner: PeerId, id: BlockId, challenge_id: ChallengeId) {
        let reply = match self.store.get(&owner, &id).await {
            Ok(Some(stored)) => PeerMessage::VerifyOk {
                hash: proof_of_storage(&challenge_id, &stored),
                id,
                challenge_id,
            },
            Ok(None) => PeerMessage::VerifyFail {
                id,
                reason: MissingReason::Missing,
            },
            Err(e) => {
                log::warn!("Verify of {} for {} failed: {}", id, owner, e);
                PeerMessage::VerifyFail {
                    id,
                    reason: MissingReason::General,
                }
            }
        };
        self.registry.deliver(&owner, &reply).await;
    }

    async fn handle_restore_request(
        &self,
        owner: PeerId,
        ids: Vec<BlockId>,
        purpose: RestorePurpose,
    ) {
        for id in ids {
            let reply = match self.store.get(&owner, &id).await {
                Ok(Some(data)) => PeerMessage::RestoreResponse { id, purpose, data },
                Ok(None) => PeerMessage::RestoreFail {
                    id,
                    reason: MissingReason::Missing,
                },
                Err(e) => {
                    log::warn!("Restore of {} for {} failed: {}", id, owner, e);
                    PeerMessage::RestoreFail {
                        id,
                        reason: MissingReason::General,
                    }
                }
            };
            if !self.registry.deliver(&owner, &reply).await {
                break;
            }
        }
    }

    async fn handle_catalog_request(&self, owner: PeerId) {
        let block_ids = match self.store.inventory(&owner).await {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!("Inventory for {} unavailable: {}", owner, e);
                return;
            }
        };
        let latest = self.store.latest_catalog(&owner).await.ok().flatten();
        if !self
            .registry
            .deliver(&owner, &PeerMessage::CatalogInventory { block_ids })
            .await
        {
            return;
        }

        if let Some(snapshot_id) = latest {
            match self.store.get(&owner, &snapshot_id).await {
                Ok(Some(snapshot_bytes)) => {
                    self.registry
                        .deliver(
                            &owner,
                            &PeerMessage::CatalogSnapshot {
                                snapshot_id,
                                snapshot_bytes,
                            },
                        )
                        .await;
                }
                Ok(None) => log::warn!("Catalog {} indexed but missing on disk", snapshot_id),
                Err(e) => log::warn!("Catalog {} unreadable: {}", snapshot_id, e),
            }
        }
    }
}

#[async_trait]
impl MessageHandler for HostService {
    async fn handle(&self, inbound: Inbound) -> Dispatch {
        let from = inbound.from;
        match inbound.message {
            PeerMessage::Backup {
                id,
                download_ref,
                mac,
                mac_secret,
            } => self.handle_backup(from, id, download_ref, mac, mac_secret).await,
            PeerMessage::Delete { ids } => self.handle_delete(from, ids).await,
            PeerMessage::Verify { id, challenge_id } => {
                self.handle_verify(from, id, challenge_id).await
            }
            PeerMessage::RestoreRequest { ids, purpose } => {
                self.handle_restore_request(from, ids, purpose).await
            }
            PeerMessage::CatalogRequest => self.handle_catalog_request(from).await,
            message => return Dispatch::Pass(Inbound::new(from, message)),
        }
        Dispatch::Handled
    }
}
