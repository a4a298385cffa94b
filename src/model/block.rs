//! Blocks and block locations

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::ModelError;

/// Reserved prefix for catalog snapshot block IDs.
pub const CATALOG_PREFIX: &str = "catalog-";

const MAX_BLOCK_ID_LEN: usize = 128;

/// Peers are identified by their node UUID.
pub type PeerId = Uuid;

/// Opaque, globally unique block identifier. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    /// Fresh ID for a data or version block.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Fresh catalog snapshot ID. The embedded millisecond timestamp is
    /// fixed-width hex, so newer snapshots sort after older ones.
    pub fn new_catalog(at: DateTime<Utc>) -> Self {
        let millis = u64::try_from(at.timestamp_millis()).unwrap_or(0);
        Self(format!(
            "{}{:016x}-{}",
            CATALOG_PREFIX,
            millis,
            Uuid::new_v4().simple()
        ))
    }

    /// Parse an ID received from a peer or an object listing.
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let id = Self(raw.to_string());
        if id.is_well_formed() {
            Ok(id)
        } else {
            Err(ModelError::MalformedBlockId(raw.to_string()))
        }
    }

    /// IDs double as file and object names, so only a safe alphabet is accepted.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_BLOCK_ID_LEN
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }

    pub fn is_catalog(&self) -> bool {
        self.0.starts_with(CATALOG_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Associated data binding a ciphertext to this identity.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 of a block's plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// Raw file content; hash known.
    Data,
    /// A path version record.
    Version,
    /// A catalog snapshot.
    Catalog,
    /// Discovered during recovery, content not seen yet.
    Unclassified,
}

/// Integrity pair sent along with every push: the receiving peer checks
/// `HMAC-SHA256(secret, ciphertext) == mac` before storing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMac {
    pub secret: [u8; 32],
    pub mac: [u8; 32],
}

/// A copy of the ciphertext held by one object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudCopy {
    /// Name of the object store holding it.
    pub store: String,
    pub object: String,
    /// Time-limited download URL handed to peers, once shared.
    pub url: Option<String>,
    /// Set when a peer reported the shared copy unusable.
    pub needs_reupload: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub kind: BlockKind,
    hash: Option<ContentHash>,
    /// Plaintext size, when known.
    pub size: Option<u64>,
    pub created_at: DateTime<Utc>,
    /// A local encrypted safety copy sits in the staging area.
    pub staged: bool,
    pub mac: Option<BlockMac>,
    pub cloud: Vec<CloudCopy>,
}

impl Block {
    pub fn data(id: BlockId, hash: ContentHash, size: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: BlockKind::Data,
            hash: Some(hash),
            size: Some(size),
            created_at: now,
            staged: false,
            mac: None,
            cloud: Vec::new(),
        }
    }

    /// Version and catalog blocks never carry a hash: their content is
    /// timestamp-dependent and not deduplicated.
    pub fn metadata(id: BlockId, kind: BlockKind, size: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            hash: None,
            size: Some(size),
            created_at: now,
            staged: false,
            mac: None,
            cloud: Vec::new(),
        }
    }

    /// A block learned about from a peer inventory or a catalog snapshot.
    pub fn placeholder(id: BlockId, now: DateTime<Utc>) -> Self {
        let kind = if id.is_catalog() {
            BlockKind::Catalog
        } else {
            BlockKind::Unclassified
        };
        Self {
            id,
            kind,
            hash: None,
            size: None,
            created_at: now,
            staged: false,
            mac: None,
            cloud: Vec::new(),
        }
    }

    pub fn hash(&self) -> Option<&ContentHash> {
        self.hash.as_ref()
    }

    /// Set the content hash. Returns whether it was newly set; a different
    /// hash on a block that already has one is an integrity violation.
    pub fn assign_hash(&mut self, hash: ContentHash) -> Result<bool, ModelError> {
        match self.hash {
            Some(existing) if existing == hash => Ok(false),
            Some(existing) => Err(ModelError::HashConflict {
                block: self.id.to_string(),
                existing: existing.to_string(),
                offered: hash.to_string(),
            }),
            None => {
                self.hash = Some(hash);
                Ok(true)
            }
        }
    }

    /// Whether this node still holds its own copy (staged or in the cloud).
    pub fn has_safety_copy(&self) -> bool {
        self.staged || !self.cloud.is_empty()
    }

    /// A cloud copy that can be handed to peers as a download pointer.
    pub fn shareable_copy(&self) -> Option<&CloudCopy> {
        self.cloud
            .iter()
            .find(|c| c.url.is_some() && !c.needs_reupload)
    }

    pub fn cloud_copy_mut(&mut self, store: &str) -> Option<&mut CloudCopy> {
        self.cloud.iter_mut().find(|c| c.store == store)
    }
}

/// Backdated timestamp for a location that is believed to exist but has not
/// passed a verification: just outside the validity window, so it is
/// re-verified on the next sweep without counting as a verified replica.
pub fn stale_timestamp(now: DateTime<Utc>, valid_window: Duration) -> DateTime<Utc> {
    now - valid_window - Duration::minutes(1)
}

/// A peer believed to hold a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockLocation {
    pub block_id: BlockId,
    pub peer_id: PeerId,
    pub verified_at: DateTime<Utc>,
    /// A delete instruction was sent after a failed verification; the record
    /// goes away once the peer acknowledges it.
    #[serde(default)]
    pub delete_requested: bool,
}

impl BlockLocation {
    /// Placement acknowledged but not yet verified.
    pub fn provisional(
        block_id: BlockId,
        peer_id: PeerId,
        now: DateTime<Utc>,
        valid_window: Duration,
    ) -> Self {
        Self {
            block_id,
            peer_id,
            verified_at: stale_timestamp(now, valid_window),
            delete_requested: false,
        }
    }

    pub fn verified(block_id: BlockId, peer_id: PeerId, now: DateTime<Utc>) -> Self {
        Self {
            block_id,
            peer_id,
            verified_at: now,
            delete_requested: false,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.verified_at
    }

    pub fn is_verified(&self, now: DateTime<Utc>, valid_window: Duration) -> bool {
        !self.delete_requested && self.age(now) < valid_window
    }

    pub fn mark_verified(&mut self, now: DateTime<Utc>) {
        self.verified_at = now;
        self.delete_requested = false;
    }

    /// Failed verification: push back to invalid age and await the delete ack.
    pub fn demote(&mut self, now: DateTime<Utc>, valid_window: Duration) {
        self.verified_at = self.verified_at.min(stale_timestamp(now, valid_window));
        self.delete_requested = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_ids_sort_by_time() {
        let t0 = Utc::now();
        let older = BlockId::new_catalog(t0);
        let newer = BlockId::new_catalog(t0 + Duration::seconds(5));
        assert!(older.is_catalog());
        assert!(older < newer);
        assert!(!BlockId::new_random().is_catalog());
    }

    #[test]
    fn test_block_id_rejects_path_characters() {
        assert!(BlockId::parse("abc-123_x").is_ok());
        assert!(BlockId::parse("../etc/passwd").is_err());
        assert!(BlockId::parse("").is_err());
        assert!(BlockId::parse(&"a".repeat(200)).is_err());
    }

    #[test]
    fn test_hash_is_immutable_once_set() {
        let mut block = Block::placeholder(BlockId::new_random(), Utc::now());
        let first = ContentHash::of(b"one");

        assert_eq!(block.assign_hash(first), Ok(true));
        assert_eq!(block.assign_hash(first), Ok(false));
        assert!(matches!(
            block.assign_hash(ContentHash::of(b"two")),
            Err(ModelError::HashConflict { .. })
        ));
        assert_eq!(block.hash(), Some(&first));
    }

    #[test]
    fn test_provisional_location_is_due_but_not_verified() {
        let now = Utc::now();
        let window = Duration::days(21);
        let loc = BlockLocation::provisional(BlockId::new_random(), Uuid::new_v4(), now, window);

        assert!(!loc.is_verified(now, window));
        assert!(loc.age(now) > Duration::days(14));
        assert!(loc.age(now) < Duration::days(30));
    }

    #[test]
    fn test_demote_never_moves_forward() {
        let now = Utc::now();
        let window = Duration::days(21);
        let mut loc = BlockLocation::verified(BlockId::new_random(), Uuid::new_v4(), now);
        loc.verified_at = now - Duration::days(29);

        loc.demote(now, window);
        assert_eq!(loc.verified_at, now - Duration::days(29));
        assert!(loc.delete_requested);
        assert!(!loc.is_verified(now, window));
    }

    #[test]
    fn test_placeholder_kind_follows_prefix() {
        let now = Utc::now();
        assert_eq!(
            Block::placeholder(BlockId::new_catalog(now), now).kind,
            BlockKind::Catalog
        );
        assert_eq!(
            Block::placeholder(BlockId::new_random(), now).kind,
            BlockKind::Unclassified
        );
    }
}
