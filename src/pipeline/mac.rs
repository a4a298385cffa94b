//! HMAC-SHA256 integrity pair attached to every push.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::CryptoError;
use crate::model::BlockMac;

type HmacSha256 = Hmac<Sha256>;

/// Fresh random secret plus the MAC of `ciphertext` under it.
pub fn new_mac(ciphertext: &[u8]) -> Result<BlockMac, CryptoError> {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    let mac = compute_mac(&secret, ciphertext)?;
    Ok(BlockMac { secret, mac })
}

pub fn compute_mac(secret: &[u8; 32], data: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time check; a mismatch is an integrity violation.
pub fn verify_mac(secret: &[u8; 32], data: &[u8], expected: &[u8; 32]) -> Result<(), CryptoError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(data);
    mac.verify_slice(expected)
        .map_err(|_| CryptoError::Integrity("MAC mismatch".to_string()))
}
