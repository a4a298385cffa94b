//! Verification engine
//!
//! Keeps locations honest. Each sweep looks at every location held by an
//! online peer: ones silent past the deletion threshold are dropped (and the
//! peer told to delete), ones older than the re-verification interval are
//! challenged with the block's active challenge. Answers are checked against
//! the expected digest recorded when the secret was generated.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{
    ActiveChallenge, BlockId, ChallengeId, ContentHash, PeerId, ProofDigest, VerificationSecret,
};
use crate::network::selection::choose_one;
use crate::node::context::NodeContext;
use crate::protocol::{
    Dispatch, Inbound, MessageHandler, MissingReason, PeerMessage, RestorePurpose,
};
use crate::store::StoreError;

/// Top the block's secret pool back up to the configured size from a copy
/// of its ciphertext. Returns how many secrets were added.
pub fn replenish_secrets(
    ctx: &NodeContext,
    id: &BlockId,
    ciphertext: &[u8],
) -> Result<usize, StoreError> {
    let target = ctx.config.verification.secrets_per_block;
    let have = ctx.store.read(|c| c.secret_count(id))?;
    if have >= target {
        return Ok(0);
    }
    let fresh = VerificationSecret::generate_batch(ciphertext, target - have);
    ctx.store.transaction(|c| {
        let room = target.saturating_sub(c.secret_count(id));
        let batch: Vec<VerificationSecret> = fresh.into_iter().take(room).collect();
        let added = batch.len();
        c.add_secrets(id, batch);
        Ok::<_, StoreError>(added)
    })
}

/// What one verification sweep did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VerifySweep {
    pub skipped_for_recovery: bool,
    pub expired: usize,
    pub challenged: usize,
    pub fetched_for_secrets: usize,
    pub deletes_resent: usize,
}

pub struct VerificationEngine {
    ctx: Arc<NodeContext>,
}

impl VerificationEngine {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Replenish from a local copy of the ciphertext (staged or in an
    /// object store) when the pool is at or below the low water mark.
    /// Returns whether the block can currently be challenged.
    pub async fn ensure_secrets(&self, id: &BlockId) -> Result<bool, StoreError> {
        let now = self.ctx.now();
        let low_water = self.ctx.config.verification.secrets_low_water;
        let (count, local_copy, live_challenge) = self.ctx.store.read(|c| {
            (
                c.secret_count(id),
                c.block(id).map(|b| b.has_safety_copy()).unwrap_or(false),
                c.active_challenge(id).map(|a| !a.is_expired(now)).unwrap_or(false),
            )
        })?;

        if count <= low_water && local_copy {
            if let Some(ciphertext) = self.ctx.local_ciphertext(id).await? {
                let added = replenish_secrets(&self.ctx, id, &ciphertext)?;
                log::debug!("Replenished {} secrets for {}", added, id);
                return Ok(true);
            }
        }
        Ok(count > 0 || live_challenge)
    }

    /// The block's live challenge, promoting a fresh secret when there is
    /// none or the previous one expired.
    pub fn obtain_challenge(&self, id: &BlockId) -> Result<Option<ActiveChallenge>, StoreError> {
        let now = self.ctx.now();
        let ttl = self.ctx.config.verification.challenge_ttl();
        self.ctx.store.transaction(|c| {
            if let Some(active) = c.active_challenge(id) {
                if !active.is_expired(now) {
                    return Ok(Some(active.clone()));
                }
            }
            match c.take_secret(id) {
                Some(secret) => {
                    let challenge = ActiveChallenge::new(id.clone(), secret, now, ttl);
                    c.activate_challenge(challenge.clone());
                    Ok(Some(challenge))
                }
                None => {
                    c.retire_challenge(id);
                    Ok::<_, StoreError>(None)
                }
            }
        })
    }

    pub async fn verify_sweep(&self) -> Result<VerifySweep, StoreError> {
        let mut summary = VerifySweep::default();
        if self.ctx.is_recovering()? {
            log::info!("Verification suspended while recovering");
            summary.skipped_for_recovery = true;
            return Ok(summary);
        }

        let now = self.ctx.now();
        let reverify = self.ctx.config.verification.reverify_interval();
        let threshold = self.ctx.config.verification.deletion_threshold();
        let online: HashSet<PeerId> = self.ctx.registry.online_peers().await.into_iter().collect();

        let mut expired: Vec<(BlockId, PeerId)> = Vec::new();
        let mut due: BTreeMap<BlockId, Vec<PeerId>> = BTreeMap::new();
        let mut pending_deletes: HashMap<PeerId, Vec<BlockId>> = HashMap::new();
        self.ctx.store.read(|c| {
            for location in c.all_locations().filter(|l| online.contains(&l.peer_id)) {
                let age = location.age(now);
                if age > threshold {
                    expired.push((location.block_id.clone(), location.peer_id));
                } else if location.delete_requested {
                    pending_deletes
                        .entry(location.peer_id)
                        .or_default()
                        .push(location.block_id.clone());
                } else if age > reverify {
                    due.entry(location.block_id.clone())
                        .or_default()
                        .push(location.peer_id);
                }
            }
        })?;

        // Silent too long: drop the location without a challenge.
        let removed = self.ctx.store.transaction(|c| {
            if c.is_recovering() {
                return Ok::<_, StoreError>(Vec::new());
            }
            let mut removed = Vec::new();
            for (id, peer) in &expired {
                let still_expired = c
                    .location(id, peer)
                    .map(|l| l.age(now) > threshold)
                    .unwrap_or(false);
                if still_expired {
                    c.remove_location(id, peer);
                    removed.push((id.clone(), *peer));
                }
            }
            Ok(removed)
        })?;
        let mut deletes: HashMap<PeerId, Vec<BlockId>> = HashMap::new();
        for (id, peer) in removed {
            log::info!("Location of {} on {} unverified past threshold, removed", id, peer);
            deletes.entry(peer).or_default().push(id);
            summary.expired += 1;
        }
        for (peer, ids) in deletes {
            self.ctx
                .registry
                .deliver(&peer, &PeerMessage::Delete { ids })
                .await;
        }

        // Demoted copies whose delete was never acknowledged.
        for (peer, ids) in pending_deletes {
            summary.deletes_resent += ids.len();
            self.ctx
                .registry
                .deliver(&peer, &PeerMessage::Delete { ids })
                .await;
        }

        for (id, peers) in due {
            self.ensure_secrets(&id).await?;
            match self.obtain_challenge(&id)? {
                Some(challenge) => {
                    let message = PeerMessage::Verify {
                        id: id.clone(),
                        challenge_id: challenge.challenge_id(),
                    };
                    for peer in peers {
                        if self.ctx.registry.deliver(&peer, &message).await {
                            summary.challenged += 1;
                        }
                    }
                }
                None => {
                    if self.request_for_verification(&id, &online).await? {
                        summary.fetched_for_secrets += 1;
                    }
                }
            }
        }

        log::debug!("Verify sweep: {:?}", summary);
        Ok(summary)
    }

    /// No secret left and no local copy: fetch the block from a random
    /// online holder. Its answer seeds new secrets and verifies that holder.
    async fn request_for_verification(
        &self,
        id: &BlockId,
        online: &HashSet<PeerId>,
    ) -> Result<bool, StoreError> {
        let holders: Vec<PeerId> = self
            .ctx
            .store
            .read(|c| c.holders(id))?
            .into_iter()
            .filter(|p| online.contains(p))
            .collect();
        let Some(peer) = choose_one(&holders) else {
            log::warn!("Block {} cannot be verified: no secrets and no holder online", id);
            return Ok(false);
        };
        Ok(self
            .ctx
            .registry
            .deliver(
                &peer,
                &PeerMessage::RestoreRequest {
                    ids: vec![id.clone()],
                    purpose: RestorePurpose::Verification,
                },
            )
            .await)
    }

    async fn on_verify_ok(
        &self,
        from: PeerId,
        id: BlockId,
        challenge_id: ChallengeId,
        hash: ProofDigest,
    ) -> Result<(), StoreError> {
        let now = self.ctx.now();
        let outcome = self.ctx.store.transaction(|c| {
            let active = match c.active_challenge(&id) {
                Some(active) if active.challenge_id() == challenge_id && !active.is_expired(now) => {
                    active
                }
                _ => return Ok::<_, StoreError>(Answer::Stale),
            };
            if !active.accepts(&hash) {
                return Ok(Answer::Wrong);
            }
            if c.location(&id, &from).map(|l| l.delete_requested).unwrap_or(false) {
                return Ok(Answer::Stale);
            }
            c.record_verified(&id, from, now);
            Ok(Answer::Correct)
        })?;

        match outcome {
            Answer::Correct => log::debug!("{} verified {}", from, id),
            Answer::Stale => log::debug!("Ignoring stale answer from {} for {}", from, id),
            Answer::Wrong => {
                log::warn!("{} failed verification of {}, requesting delete", from, id);
                self.ctx.demote_and_delete(&id, from).await?;
            }
        }
        Ok(())
    }

    fn on_verify_fail(&self, from: PeerId, id: BlockId, reason: MissingReason) -> Result<(), StoreError> {
        match reason {
            MissingReason::Missing => {
                log::info!("{} no longer holds {}, removing location", from, id);
                self.ctx.store.transaction(|c| {
                    c.remove_location(&id, &from);
                    Ok::<_, StoreError>(())
                })
            }
            MissingReason::General => {
                log::warn!("{} could not answer verification of {}", from, id);
                Ok(())
            }
        }
    }

    fn on_delete_ok(&self, from: PeerId, ids: Vec<BlockId>) -> Result<(), StoreError> {
        self.ctx.store.transaction(|c| {
            for id in &ids {
                if c.location(id, &from).map(|l| l.delete_requested).unwrap_or(false) {
                    c.remove_location(id, &from);
                    log::info!("{} confirmed delete of {}", from, id);
                }
            }
            Ok::<_, StoreError>(())
        })
    }

    async fn on_restore_response(
        &self,
        from: PeerId,
        id: BlockId,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        if !self.content_matches(&id, &data)? {
            log::warn!("{} returned a corrupt copy of {}", from, id);
            return self.ctx.demote_and_delete(&id, from).await;
        }
        let added = replenish_secrets(&self.ctx, &id, &data)?;
        let now = self.ctx.now();
        self.ctx.store.transaction(|c| {
            c.record_verified(&id, from, now);
            Ok::<_, StoreError>(())
        })?;
        log::debug!("{} proved {} by transfer, {} secrets seeded", from, id, added);
        Ok(())
    }

    /// The ciphertext opens under its ID and, for data blocks, hashes to the
    /// recorded content hash.
    fn content_matches(&self, id: &BlockId, ciphertext: &[u8]) -> Result<bool, StoreError> {
        let plaintext = match self.ctx.cipher.decrypt(id, ciphertext) {
            Ok(plaintext) => plaintext,
            Err(_) => return Ok(false),
        };
        let expected: Option<ContentHash> = self.ctx.store.read(|c| c.block(id).and_then(|b| b.hash().copied()))?;
        Ok(expected.map_or(true, |h| h == ContentHash::of(&plaintext)))
    }
}

enum Answer {
    Correct,
    Wrong,
    Stale,
}

fn log_failure(kind: &str, result: Result<(), StoreError>) {
    if let Err(e) = result {
        log::error!("Handling {} failed: {}", kind, e);
    }
}

#[async_trait]
impl MessageHandler for VerificationEngine {
    async fn handle(&self, inbound: Inbound) -> Dispatch {
        let from = inbound.from;
        match inbound.message {
            PeerMessage::VerifyOk {
                id,
                challenge_id,
                hash,
            } => log_failure("VERIFY_OK", self.on_verify_ok(from, id, challenge_id, hash).await),
            PeerMessage::VerifyFail { id, reason } => {
                log_failure("VERIFY_FAIL", self.on_verify_fail(from, id, reason))
            }
            PeerMessage::DeleteOk { ids } => log_failure("DELETE_OK", self.on_delete_ok(from, ids)),
            PeerMessage::RestoreResponse {
                id,
                purpose: RestorePurpose::Verification,
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
