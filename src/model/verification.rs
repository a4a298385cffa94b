//! Proof-of-storage secrets
//!
//! A secret is a random challenge plus the answer a faithful holder must
//! return: `SHA3-512(challenge || stored ciphertext)`. Secrets are computed
//! while this node still has the ciphertext, then spent one per round.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_512};

use super::{BlockId, ModelError};

pub const CHALLENGE_LEN: usize = 32;
pub const DIGEST_LEN: usize = 64;

/// Random challenge bytes. They also serve as the secret's identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChallengeId([u8; CHALLENGE_LEN]);

impl ChallengeId {
    pub fn random() -> Self {
        let mut bytes = [0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHALLENGE_LEN] {
        &self.0
    }
}

impl fmt::Display for ChallengeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// A SHA3-512 proof answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofDigest(#[serde(with = "serde_bytes")] Vec<u8>);

impl ProofDigest {
    pub fn from_vec(bytes: Vec<u8>) -> Result<Self, ModelError> {
        if bytes.len() == DIGEST_LEN {
            Ok(Self(bytes))
        } else {
            Err(ModelError::InvalidDigest(bytes.len()))
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// `SHA3-512(challenge || stored)`, computed by holders and verifiers alike.
pub fn proof_of_storage(challenge: &ChallengeId, stored: &[u8]) -> ProofDigest {
    let mut hasher = Sha3_512::new();
    hasher.update(challenge.as_bytes());
    hasher.update(stored);
    ProofDigest(hasher.finalize().to_vec())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSecret {
    pub challenge: ChallengeId,
    pub expected: ProofDigest,
}

impl VerificationSecret {
    pub fn generate(ciphertext: &[u8]) -> Self {
        let challenge = ChallengeId::random();
        let expected = proof_of_storage(&challenge, ciphertext);
        Self {
            challenge,
            expected,
        }
    }

    pub fn generate_batch(ciphertext: &[u8], count: usize) -> Vec<Self> {
        (0..count).map(|_| Self::generate(ciphertext)).collect()
    }
}

/// The one outstanding challenge for a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveChallenge {
    pub block_id: BlockId,
    pub secret: VerificationSecret,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ActiveChallenge {
    pub fn new(
        block_id: BlockId,
        secret: VerificationSecret,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            block_id,
            secret,
            issued_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn challenge_id(&self) -> ChallengeId {
        self.secret.challenge
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn accepts(&self, answer: &ProofDigest) -> bool {
        self.secret.expected == *answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_matches_holder_answer() {
        let stored = b"ciphertext bytes as a peer stores them".to_vec();
        let secret = VerificationSecret::generate(&stored);

        assert_eq!(proof_of_storage(&secret.challenge, &stored), secret.expected);

        let mut tampered = stored.clone();
        tampered[0] ^= 0x01;
        assert_ne!(proof_of_storage(&secret.challenge, &tampered), secret.expected);
    }

    #[test]
    fn test_empty_ciphertext_still_verifies() {
        let secret = VerificationSecret::generate(&[]);
        assert_eq!(proof_of_storage(&secret.challenge, &[]), secret.expected);
        assert_eq!(secret.expected.as_bytes().len(), DIGEST_LEN);
    }

    #[test]
    fn test_batch_challenges_are_distinct() {
        let batch = VerificationSecret::generate_batch(b"data", 12);
        assert_eq!(batch.len(), 12);
        for (i, a) in batch.iter().enumerate() {
            for b in &batch[i + 1..] {
                assert_ne!(a.challenge, b.challenge);
            }
        }
    }

    #[test]
    fn test_challenge_expiry() {
        let now = Utc::now();
        let active = ActiveChallenge::new(
            BlockId::new_random(),
            VerificationSecret::generate(b"x"),
            now,
            Duration::hours(12),
        );
        assert!(!active.is_expired(now + Duration::hours(11)));
        assert!(active.is_expired(now + Duration::hours(12)));
    }

    #[test]
    fn test_digest_length_checked() {
        assert!(ProofDigest::from_vec(vec![0u8; 64]).is_ok());
        assert_eq!(
            ProofDigest::from_vec(vec![0u8; 32]),
            Err(ModelError::InvalidDigest(32))
        );
    }
}
