//! Digest helpers shared by the encoder, decoder, and read-path verification.

use sha2::{Digest as _, Sha256};
use tern_types::DigestType;

/// Compute a 32-byte digest of `data` with the given algorithm.
pub fn digest_of(digest_type: DigestType, data: &[u8]) -> [u8; 32] {
    match digest_type {
        DigestType::Blake3 => blake3::hash(data).into(),
        DigestType::Sha256 => Sha256::digest(data).into(),
    }
}
