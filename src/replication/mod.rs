//! Replication engine
//!
//! Keeps every block at `minimal_replicas` verified remote locations. Blocks
//! still holding a local safety copy (staged file or cloud object) are pushed
//! to random online peers until enough placements exist; the safety copy is
//! only released once the verified count reaches the target. Blocks that
//! lost replicas after release are fetched back from a holder and re-staged.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{BlockId, BlockLocation, CloudCopy, ContentHash, PeerId};
use crate::network::selection::{choose_one, choose_up_to};
use crate::node::context::NodeContext;
use crate::pipeline::new_mac;
use crate::protocol::{
    BackupFailReason, Dispatch, DownloadRef, Inbound, MessageHandler, PeerMessage, RestorePurpose,
};
use crate::store::StoreError;
use crate::verification::replenish_secrets;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DistributeSummary {
    pub skipped_for_recovery: bool,
    pub pushes: usize,
    pub released: usize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub failed: usize,
}

type Placement = (BlockId, PeerId);

pub struct ReplicationEngine {
    ctx: Arc<NodeContext>,
    /// Peers that refused a block, with when they did.
    refusals: Mutex<HashMap<Placement, DateTime<Utc>>>,
    /// Which object store a pointer push was served from, and when.
    /// Unanswered entries are forgotten after the refusal back-off.
    pushed_via: Mutex<HashMap<Placement, (String, DateTime<Utc>)>>,
}

impl ReplicationEngine {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            ctx,
            refusals: Mutex::new(HashMap::new()),
            pushed_via: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_enough_verified_replicas(&self, id: &BlockId) -> Result<bool, StoreError> {
        let now = self.ctx.now();
        let window = self.ctx.valid_window();
        let target = self.ctx.replica_target();
        self.ctx
            .store
            .read(|c| c.verified_count(id, now, window) >= target)
    }

    pub async fn distribute(&self) -> Result<DistributeSummary, StoreError> {
        let mut summary = DistributeSummary::default();
        if self.ctx.is_recovering()? {
            log::info!("Distribution suspended while recovering");
            summary.skipped_for_recovery = true;
            return Ok(summary);
        }

        summary.released = self.release_safety_copies().await?;

        let now = self.ctx.now();
        self.prune(now);
        let window = self.ctx.valid_window();
        let target = self.ctx.replica_target();
        let online = self.ctx.registry.online_peers().await;

        // Blocks still short of verified replicas, with every holder and the
        // number of placements that still count: verified ones, plus
        // unverified ones on online peers that have not been told to delete.
        let pending: Vec<(BlockId, Vec<PeerId>, usize)> = self.ctx.store.read(|c| {
            c.blocks()
                .filter(|b| b.has_safety_copy())
                .filter(|b| c.verified_count(&b.id, now, window) < target)
                .map(|b| {
                    let placed = c
                        .locations(&b.id)
                        .filter(|l| {
                            l.is_verified(now, window)
                                || (!l.delete_requested && online.contains(&l.peer_id))
                        })
                        .count();
                    let peers = c.locations(&b.id).map(|l| l.peer_id).collect();
                    (b.id.clone(), peers, placed)
                })
                .collect()
        })?;

        for (id, holders, placed) in pending {
            let shortfall = target.saturating_sub(placed);
            if shortfall == 0 {
                // Enough placements; waiting for them to pass verification.
                continue;
            }
            let candidates: Vec<PeerId> = online
                .iter()
                .copied()
                .filter(|p| !holders.contains(p) && !self.is_refused(&id, p, now))
                .collect();
            let chosen = choose_up_to(&candidates, shortfall);
            if chosen.is_empty() {
                log::debug!("No push target available for {}", id);
                continue;
            }

            let Some((message, via)) = self.backup_message(&id).await? else {
                continue;
            };
            for peer in chosen {
                if self.ctx.registry.deliver(&peer, &message).await {
                    summary.pushes += 1;
                    if let Some(store) = &via {
                        lock(&self.pushed_via).insert((id.clone(), peer), (store.clone(), now));
                    }
                }
            }
        }

        log::debug!("Distribute: {:?}", summary);
        Ok(summary)
    }

    /// BACKUP for a block: a pointer to a usable cloud copy when there is
    /// one, the staged ciphertext otherwise.
    async fn backup_message(
        &self,
        id: &BlockId,
    ) -> Result<Option<(PeerMessage, Option<String>)>, StoreError> {
        let Some(block) = self.ctx.store.read(|c| c.block(id).cloned())? else {
            return Ok(None);
        };

        let (download_ref, via, ciphertext) = match block.shareable_copy() {
            Some(copy) => (
                DownloadRef::Shared {
                    url: copy.url.clone().unwrap_or_default(),
                },
                Some(copy.store.clone()),
                None,
            ),
            None if block.staged => match self.ctx.staging.get(id).await? {
                Some(data) => (DownloadRef::Inline { data: data.clone() }, None, Some(data)),
                None => {
                    log::warn!("Staged copy of {} is missing", id);
                    return Ok(None);
                }
            },
            None => return Ok(None),
        };

        let mac = match (block.mac, ciphertext) {
            (Some(mac), _) => mac,
            (None, Some(data)) => {
                let mac = new_mac(&data).map_err(|e| StoreError::PersistenceError(e.to_string()))?;
                self.ctx.store.transaction(|c| {
                    if let Some(b) = c.block_mut(id) {
                        b.mac = Some(mac);
                    }
                    Ok::<_, StoreError>(())
                })?;
                mac
            }
            (None, None) => {
                log::warn!("No MAC recorded for pointer push of {}", id);
                return Ok(None);
            }
        };

        Ok(Some((
            PeerMessage::Backup {
                id: id.clone(),
                download_ref,
                mac: mac.mac,
                mac_secret: mac.secret,
            },
            via,
        )))
    }

    /// Drop staged and cloud copies of blocks that reached the target.
    /// The count is re-checked inside the transaction that clears them.
    async fn release_safety_copies(&self) -> Result<usize, StoreError> {
        let now = self.ctx.now();
        let window = self.ctx.valid_window();
        let target = self.ctx.replica_target();

        let candidates: Vec<BlockId> = self.ctx.store.read(|c| {
            c.blocks()
                .filter(|b| b.has_safety_copy())
                .filter(|b| c.verified_count(&b.id, now, window) >= target)
                .map(|b| b.id.clone())
                .collect()
        })?;

        let mut released = 0;
        for id in candidates {
            let taken = self.ctx.store.transaction(|c| {
                if c.is_recovering() || c.verified_count(&id, now, window) < target {
                    return Ok::<_, StoreError>(None);
                }
                let Some(block) = c.block_mut(&id) else {
                    return Ok(None);
                };
                let staged = std::mem::replace(&mut block.staged, false);
                let cloud = std::mem::take(&mut block.cloud);
                Ok(Some((staged, cloud)))
            })?;
            let Some((staged, cloud)) = taken else {
                continue;
            };

            if staged {
                if let Err(e) = self.ctx.staging.remove(&id).await {
                    log::warn!("Could not remove staged copy of {}: {}", id, e);
                    self.restore_copy(&id, true, None)?;
                }
            }
            for copy in cloud {
                let result = match self.ctx.object_store(&copy.store) {
                    Some(store) => store.delete(&copy.object).await,
                    None => Ok(()),
                };
                if let Err(e) = result {
                    log::warn!("Could not delete {} from {}: {}", copy.object, copy.store, e);
                    self.restore_copy(&id, false, Some(copy))?;
                }
            }
            log::info!("Released safety copies of {}", id);
            released += 1;
        }
        Ok(released)
    }

    fn restore_copy(&self, id: &BlockId, staged: bool, cloud: Option<CloudCopy>) -> Result<(), StoreError> {
        self.ctx.store.transaction(|c| {
            if let Some(block) = c.block_mut(id) {
                block.staged |= staged;
                if let Some(copy) = cloud {
                    block.cloud.push(copy);
                }
            }
            Ok::<_, StoreError>(())
        })
    }

    /// Blocks below target with no local copy left are requested back from a
    /// random online holder so they can be pushed again.
    pub async fn verify_enough_replicas(&self) -> Result<usize, StoreError> {
        if self.ctx.is_recovering()? {
            return Ok(0);
        }
        let now = self.ctx.now();
        let window = self.ctx.valid_window();
        let target = self.ctx.replica_target();
        let online: HashSet<PeerId> = self.ctx.registry.online_peers().await.into_iter().collect();

        let short: Vec<(BlockId, Vec<PeerId>)> = self.ctx.store.read(|c| {
            c.blocks()
                .filter(|b| !b.has_safety_copy())
                .filter(|b| c.verified_count(&b.id, now, window) < target)
                .map(|b| (b.id.clone(), c.holders(&b.id)))
                .collect()
        })?;

        let mut requests: HashMap<PeerId, Vec<BlockId>> = HashMap::new();
        for (id, holders) in short {
            let reachable: Vec<PeerId> = holders.into_iter().filter(|p| online.contains(p)).collect();
            match choose_one(&reachable) {
                Some(peer) => requests.entry(peer).or_default().push(id),
                None => log::warn!("Block {} is under-replicated and no holder is online", id),
            }
        }

        let mut requested = 0;
        for (peer, ids) in requests {
            let count = ids.len();
            let message = PeerMessage::RestoreRequest {
                ids,
                purpose: RestorePurpose::Redistribution,
            };
            if self.ctx.registry.deliver(&peer, &message).await {
                requested += count;
            }
        }
        Ok(requested)
    }

    /// Upload staged blocks that have no usable copy in some object store.
    pub async fn upload_staged(&self) -> Result<UploadSummary, StoreError> {
        let mut summary = UploadSummary::default();
        if self.ctx.object_stores.is_empty() {
            return Ok(summary);
        }
        let now = self.ctx.now();
        let window = self.ctx.valid_window();
        let target = self.ctx.replica_target();

        let staged: Vec<(BlockId, Vec<CloudCopy>)> = self.ctx.store.read(|c| {
            c.blocks()
                .filter(|b| b.staged)
                .filter(|b| c.verified_count(&b.id, now, window) < target)
                .map(|b| (b.id.clone(), b.cloud.clone()))
                .collect()
        })?;

        for (id, copies) in staged {
            for store in &self.ctx.object_stores {
                let usable = copies
                    .iter()
                    .any(|c| c.store == store.name() && !c.needs_reupload);
                if usable {
                    continue;
                }
                let path = self.ctx.staging.path(&id);
                let uploaded = async {
                    let object = store.upload(&path).await?;
                    let url = store.share(&object).await?;
                    Ok::<_, crate::cloud::CloudError>((object, url))
                }
                .await;
                match uploaded {
                    Ok((object, url)) => {
                        let name = store.name().to_string();
                        self.ctx.store.transaction(|c| {
                            if let Some(block) = c.block_mut(&id) {
                                block.cloud.retain(|copy| copy.store != name);
                                block.cloud.push(CloudCopy {
                                    store: name.clone(),
                                    object,
                                    url: Some(url),
                                    needs_reupload: false,
                                });
                            }
                            Ok::<_, StoreError>(())
                        })?;
                        summary.uploaded += 1;
                    }
                    Err(e) => {
                        log::warn!("Upload of {} to {} failed: {}", id, store.name(), e);
                        summary.failed += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Drop refusals whose back-off has passed and pushes nobody answered.
    fn prune(&self, now: DateTime<Utc>) {
        let backoff = self.ctx.config.replication.refusal_backoff();
        lock(&self.refusals).retain(|_, at| now - *at < backoff);
        lock(&self.pushed_via).retain(|_, (_, at)| now - *at < backoff);
    }

    fn is_refused(&self, id: &BlockId, peer: &PeerId, now: DateTime<Utc>) -> bool {
        let backoff = self.ctx.config.replication.refusal_backoff();
        lock(&self.refusals)
            .get(&(id.clone(), *peer))
            .map(|at| now - *at < backoff)
            .unwrap_or(false)
    }

    fn on_backup_ok(&self, from: PeerId, id: BlockId) -> Result<(), StoreError> {
        lock(&self.refusals).remove(&(id.clone(), from));
        lock(&self.pushed_via).remove(&(id.clone(), from));

        let now = self.ctx.now();
        let window = self.ctx.valid_window();
        self.ctx.store.transaction(|c| {
            if !c.contains_block(&id) {
                return Ok::<_, StoreError>(());
            }
            match c.location_mut(&id, &from) {
                Some(location) if location.delete_requested => {}
                Some(location) if !location.is_verified(now, window) => {
                    location.verified_at = location
                        .verified_at
                        .max(crate::model::stale_timestamp(now, window));
                }
                Some(_) => {}
                None => c.upsert_location(BlockLocation::provisional(id.clone(), from, now, window)),
            }
            log::debug!("{} accepted {}", from, id);
            Ok(())
        })
    }

    fn on_backup_fail(&self, from: PeerId, id: BlockId, reason: BackupFailReason) -> Result<(), StoreError> {
        let via = lock(&self.pushed_via)
            .remove(&(id.clone(), from))
            .map(|(store, _)| store);
        match reason {
            BackupFailReason::NotAllowed | BackupFailReason::AlreadyStoredDifferentMac => {
                log::info!("{} refused {}: {:?}", from, id, reason);
                lock(&self.refusals).insert((id, from), self.ctx.now());
                Ok(())
            }
            BackupFailReason::WrongMac | BackupFailReason::NotFound => {
                let Some(store) = via else {
                    log::warn!("{} rejected inline push of {}: {:?}", from, id, reason);
                    return Ok(());
                };
                log::warn!("Cloud copy of {} in {} unusable ({:?}), re-uploading", id, store, reason);
                self.ctx.store.transaction(|c| {
                    if let Some(copy) = c.block_mut(&id).and_then(|b| b.cloud_copy_mut(&store)) {
                        copy.needs_reupload = true;
                    }
                    Ok::<_, StoreError>(())
                })
            }
            BackupFailReason::General => {
                log::warn!("{} failed to store {}", from, id);
                Ok(())
            }
        }
    }

    /// A block requested for redistribution came back: re-stage it so the
    /// next distribution pushes it again.
    async fn on_restore_response(&self, from: PeerId, id: BlockId, data: Vec<u8>) -> Result<(), StoreError> {
        let plaintext = match self.ctx.cipher.decrypt(&id, &data) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                log::warn!("{} returned a corrupt copy of {}: {}", from, id, e);
                return self.ctx.demote_and_delete(&id, from).await;
            }
        };
        let expected: Option<ContentHash> = self
            .ctx
            .store
            .read(|c| c.block(&id).and_then(|b| b.hash().copied()))?;
        if expected.map_or(false, |h| h != ContentHash::of(&plaintext)) {
            log::warn!("{} returned {} with the wrong content", from, id);
            return self.ctx.demote_and_delete(&id, from).await;
        }

        let mac = new_mac(&data).map_err(|e| StoreError::PersistenceError(e.to_string()))?;
        self.ctx.staging.put(&id, &data).await?;
        replenish_secrets(&self.ctx, &id, &data)?;
        let now = self.ctx.now();
        self.ctx.store.transaction(|c| {
            if let Some(block) = c.block_mut(&id) {
                block.staged = true;
                block.mac.get_or_insert(mac);
            }
            c.record_verified(&id, from, now);
            Ok::<_, StoreError>(())
        })?;
        log::info!("Re-staged {} from {} for redistribution", id, from);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn log_failure(kind: &str, result: Result<(), StoreError>) {
    if let Err(e) = result {
        log::error!("Handling {} failed: {}", kind, e);
    }
}

#[async_trait]
impl MessageHandler for ReplicationEngine {
    async fn handle(&self, inbound: Inbound) -> Dispatch {
        let from = inbound.from;
        match inbound.message {
            PeerMessage::BackupOk { id } => log_failure("BACKUP_OK", self.on_backup_ok(from, id)),
            PeerMessage::BackupFail { id, reason } => {
                log_failure("BACKUP_FAIL", self.on_backup_fail(from, id, reason))
            }
            PeerMessage::RestoreResponse {
                id,
                purpose: RestorePurpose::Redistribution,
                data,
            } => log_failure(
                "RESTORE_RESPONSE",
                self.on_restore_response(from, id, data).await,
            ),
            message => return Dispatch::Pass(Inbound::new(from, message)),
        }
        Dispatch::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, RecoveryState, VerificationSecret};
    use crate::node::context::{test_context, TestEnv};
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn staged_block(ctx: &NodeContext) -> (BlockId, Vec<u8>) {
        let id = BlockId::new_random();
        let plaintext = b"replicated content".to_vec();
        let ciphertext = ctx.cipher.encrypt(&id, &plaintext).unwrap();
        ctx.staging.put(&id, &ciphertext).await.unwrap();
        let mut block = Block::data(id.clone(), ContentHash::of(&plaintext), plaintext.len() as u64, ctx.now());
        block.staged = true;
        block.mac = Some(new_mac(&ciphertext).unwrap());
        let secrets = VerificationSecret::generate_batch(&ciphertext, 12);
        ctx.store
            .transaction(|c| {
                c.insert_block(block);
                c.add_secrets(&id, secrets);
                Ok::<_, StoreError>(())
            })
            .unwrap();
        (id, ciphertext)
    }

    async fn peers(env: &TestEnv, ctx: &NodeContext, n: usize) -> Vec<(PeerId, UnboundedReceiver<Inbound>)> {
        let mut peers = Vec::new();
        for _ in 0..n {
            peers.push(env.add_peer(ctx).await);
        }
        peers
    }

    fn verify_all(ctx: &NodeContext, id: &BlockId, holders: &[PeerId]) {
        let now = ctx.now();
        ctx.store
            .transaction(|c| {
                for peer in holders {
                    c.record_verified(id, *peer, now);
                }
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_distribute_pushes_inline_copy_to_each_peer() {
        let (ctx, env) = test_context(|_| {});
        let mut remote = peers(&env, &ctx, 4).await;
        let (id, ciphertext) = staged_block(&ctx).await;
        let engine = ReplicationEngine::new(ctx.clone());

        let summary = engine.distribute().await.unwrap();
        assert_eq!(summary.pushes, 3);

        let mut received = 0;
        for (_, inbox) in remote.iter_mut() {
            if let Ok(inbound) = inbox.try_recv() {
                let PeerMessage::Backup { id: pushed, download_ref, .. } = inbound.message else {
                    panic!("expected BACKUP");
                };
                assert_eq!(pushed, id);
                assert_eq!(download_ref, DownloadRef::Inline { data: ciphertext.clone() });
                received += 1;
            }
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn test_acknowledged_placement_is_provisional() {
        let (ctx, env) = test_context(|_| {});
        let remote = peers(&env, &ctx, 3).await;
        let (id, _) = staged_block(&ctx).await;
        let engine = ReplicationEngine::new(ctx.clone());
        engine.distribute().await.unwrap();

        for (peer, _) in &remote {
            engine
                .handle(Inbound::new(*peer, PeerMessage::BackupOk { id: id.clone() }))
                .await;
        }
        assert_eq!(ctx.store.read(|c| c.holders(&id).len()).unwrap(), 3);
        assert!(!engine.has_enough_verified_replicas(&id).unwrap());

        // Every holder is already placed; nothing more to push.
        assert_eq!(engine.distribute().await.unwrap().pushes, 0);
        assert!(ctx.staging.contains(&id).await);
    }

    #[tokio::test]
    async fn test_safety_copy_released_once_verified() {
        let (ctx, env) = test_context(|_| {});
        let remote = peers(&env, &ctx, 3).await;
        let (id, _) = staged_block(&ctx).await;
        let engine = ReplicationEngine::new(ctx.clone());

        let holders: Vec<PeerId> = remote.iter().map(|(p, _)| *p).collect();
        verify_all(&ctx, &id, &holders[..2]);
        assert_eq!(engine.distribute().await.unwrap().released, 0);

        verify_all(&ctx, &id, &holders);
        let summary = engine.distribute().await.unwrap();
        assert_eq!((summary.released, summary.pushes), (1, 0));
        assert!(!ctx.staging.contains(&id).await);
        assert!(!ctx.store.read(|c| c.block(&id).unwrap().staged).unwrap());
        assert!(engine.has_enough_verified_replicas(&id).unwrap());
    }

    #[tokio::test]
    async fn test_refusing_peer_is_not_asked_again() {
        let (ctx, env) = test_context(|_| {});
        let mut remote = peers(&env, &ctx, 1).await;
        let (id, _) = staged_block(&ctx).await;
        let engine = ReplicationEngine::new(ctx.clone());
        let (peer, inbox) = &mut remote[0];

        assert_eq!(engine.distribute().await.unwrap().pushes, 1);
        inbox.try_recv().unwrap();
        let refusal = PeerMessage::BackupFail {
            id: id.clone(),
            reason: BackupFailReason::NotAllowed,
        };
        engine.handle(Inbound::new(*peer, refusal)).await;

        assert_eq!(engine.distribute().await.unwrap().pushes, 0);
        assert!(inbox.try_recv().is_err());

        env.clock.advance(ctx.config.replication.refusal_backoff() + chrono::Duration::minutes(1));
        assert_eq!(engine.distribute().await.unwrap().pushes, 1);
    }

    #[tokio::test]
    async fn test_distribution_suspended_during_recovery() {
        let (ctx, env) = test_context(|_| {});
        let _remote = peers(&env, &ctx, 3).await;
        staged_block(&ctx).await;
        ctx.store
            .transaction(|c| {
                c.set_recovery_state(Some(RecoveryState::Initialized));
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let summary = ReplicationEngine::new(ctx).distribute().await.unwrap();
        assert!(summary.skipped_for_recovery);
        assert_eq!(summary.pushes, 0);
    }

    #[tokio::test]
    async fn test_lost_replica_is_fetched_back_and_restaged() {
        let (ctx, env) = test_context(|_| {});
        let mut remote = peers(&env, &ctx, 3).await;
        let (id, ciphertext) = staged_block(&ctx).await;
        let engine = ReplicationEngine::new(ctx.clone());
        let holders: Vec<PeerId> = remote.iter().map(|(p, _)| *p).collect();
        verify_all(&ctx, &id, &holders);
        engine.distribute().await.unwrap();

        // One holder drops out.
        ctx.store
            .transaction(|c| {
                c.remove_location(&id, &holders[2]);
                Ok::<_, StoreError>(())
            })
            .unwrap();
        assert_eq!(engine.verify_enough_replicas().await.unwrap(), 1);

        let requests: Vec<PeerMessage> = remote
            .iter_mut()
            .filter_map(|(_, inbox)| inbox.try_recv().ok())
            .map(|inbound| inbound.message)
            .collect();
        assert_eq!(requests.len(), 1);
        let request = requests.into_iter().next().unwrap();
        assert_eq!(
            request,
            PeerMessage::RestoreRequest {
                ids: vec![id.clone()],
                purpose: RestorePurpose::Redistribution,
            }
        );

        let response = PeerMessage::RestoreResponse {
            id: id.clone(),
            purpose: RestorePurpose::Redistribution,
            data: ciphertext,
        };
        engine.handle(Inbound::new(holders[0], response)).await;
        assert!(ctx.staging.contains(&id).await);
        assert!(ctx.store.read(|c| c.block(&id).unwrap().staged).unwrap());
        assert_eq!(engine.distribute().await.unwrap().pushes, 1);
    }

    #[tokio::test]
    async fn test_corrupt_redistribution_copy_is_demoted() {
        let (ctx, env) = test_context(|_| {});
        let (peer, _inbox) = env.add_peer(&ctx).await;
        let (id, _) = staged_block(&ctx).await;
        verify_all(&ctx, &id, &[peer]);
        let engine = ReplicationEngine::new(ctx.clone());

        let forged = ctx.cipher.encrypt(&id, b"other content").unwrap();
        let response = PeerMessage::RestoreResponse {
            id: id.clone(),
            purpose: RestorePurpose::Redistribution,
            data: forged,
        };
        engine.handle(Inbound::new(peer, response)).await;
        let location = ctx.store.read(|c| c.location(&id, &peer).cloned()).unwrap().unwrap();
        assert!(location.delete_requested);
    }

    #[tokio::test]
    async fn test_wrong_mac_on_pointer_push_forces_reupload() {
        let bucket = tempfile::tempdir().unwrap();
        let bucket_path = bucket.path().to_path_buf();
        let (ctx, env) = test_context(|config| {
            config.cloud.push(crate::config::CloudConfig {
                name: "bucket".into(),
                directory: bucket_path,
            });
        });
        let (peer, mut inbox) = env.add_peer(&ctx).await;
        let (id, ciphertext) = staged_block(&ctx).await;
        let engine = ReplicationEngine::new(ctx.clone());

        let uploaded = engine.upload_staged().await.unwrap();
        assert_eq!((uploaded.uploaded, uploaded.failed), (1, 0));
        assert_eq!(std::fs::read(bucket.path().join(id.to_string())).unwrap(), ciphertext);
        // A usable copy is not uploaded twice.
        assert_eq!(engine.upload_staged().await.unwrap().uploaded, 0);

        assert_eq!(engine.distribute().await.unwrap().pushes, 1);
        let PeerMessage::Backup { download_ref, mac, mac_secret, .. } = inbox.try_recv().unwrap().message else {
            panic!("expected BACKUP");
        };
        let DownloadRef::Shared { url } = download_ref else {
            panic!("expected a pointer push");
        };
        assert!(url.starts_with("file://"));
        let recorded = ctx.store.read(|c| c.block(&id).unwrap().mac).unwrap().unwrap();
        assert_eq!((mac, mac_secret), (recorded.mac, recorded.secret));

        let rejection = PeerMessage::BackupFail {
            id: id.clone(),
            reason: BackupFailReason::WrongMac,
        };
        engine.handle(Inbound::new(peer, rejection)).await;
        let copy = ctx
            .store
            .read(|c| c.block(&id).unwrap().cloud.clone())
            .unwrap();
        assert_eq!(copy.len(), 1);
        assert!(copy[0].needs_reupload);

        let uploaded = engine.upload_staged().await.unwrap();
        assert_eq!(uploaded.uploaded, 1);
        let copy = ctx
            .store
            .read(|c| c.block(&id).unwrap().cloud.clone())
            .unwrap();
        assert_eq!(copy.len(), 1);
        assert!(!copy[0].needs_reupload);
        assert!(copy[0].url.is_some());
    }

    #[tokio::test]
    async fn test_wrong_mac_on_inline_push_leaves_cloud_copies_alone() {
        let (ctx, env) = test_context(|_| {});
        let (peer, mut inbox) = env.add_peer(&ctx).await;
        let (id, _) = staged_block(&ctx).await;
        let engine = ReplicationEngine::new(ctx.clone());

        engine.distribute().await.unwrap();
        inbox.try_recv().unwrap();
        let rejection = PeerMessage::BackupFail {
            id: id.clone(),
            reason: BackupFailReason::WrongMac,
        };
        engine.handle(Inbound::new(peer, rejection)).await;

        assert!(ctx.store.read(|c| c.block(&id).unwrap().cloud.is_empty()).unwrap());
        assert!(!engine.is_refused(&id, &peer, ctx.now()));
    }

    #[tokio::test]
    async fn test_unanswered_pushes_and_old_refusals_are_forgotten() {
        let bucket = tempfile::tempdir().unwrap();
        let bucket_path = bucket.path().to_path_buf();
        let (ctx, env) = test_context(|config| {
            config.cloud.push(crate::config::CloudConfig {
                name: "bucket".into(),
                directory: bucket_path,
            });
        });
        let (silent, _silent_inbox) = env.add_peer(&ctx).await;
        let (refuser, _refuser_inbox) = env.add_peer(&ctx).await;
        let (id, _) = staged_block(&ctx).await;
        let engine = ReplicationEngine::new(ctx.clone());
        engine.upload_staged().await.unwrap();

        assert_eq!(engine.distribute().await.unwrap().pushes, 2);
        let refusal = PeerMessage::BackupFail {
            id: id.clone(),
            reason: BackupFailReason::NotAllowed,
        };
        engine.handle(Inbound::new(refuser, refusal)).await;
        assert_eq!(lock(&engine.refusals).len(), 1);
        assert!(lock(&engine.pushed_via).contains_key(&(id.clone(), silent)));

        env.clock.advance(ctx.config.replication.refusal_backoff() + chrono::Duration::minutes(1));
        engine.prune(ctx.now());
        assert!(lock(&engine.refusals).is_empty());
        assert!(lock(&engine.pushed_via).is_empty());
    }
}
