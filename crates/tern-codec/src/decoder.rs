//! Chunk decoder: erasure-reconstruct, decrypt, decompress, verify.
//!
//! The reverse of the encoder. Any `data_frags` fragments of a chunk
//! suffice; when every data fragment is present the payload is a plain
//! concatenation and the Reed-Solomon recovery is skipped entirely.
//! The decoded plaintext is always checked against the recorded content
//! digest and size before it is handed back.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::Bytes;
use tern_types::{ChunkRecord, CipherType, Compression, FragKind};
use tracing::debug;

use crate::digest::digest_of;
use crate::encoder::GCM_TAG_LEN;
use crate::error::CodecError;

/// One fetched fragment payload handed to the decoder.
#[derive(Debug, Clone)]
pub struct FragPayload {
    /// Data / parity / LRC.
    pub kind: FragKind,
    /// Position within its kind.
    pub index: u32,
    /// The stored fragment bytes.
    pub data: Bytes,
}

/// Decode a chunk's plaintext from a subset of its fragments.
///
/// `chunk` supplies the coder config, sizes, cipher material, and the
/// content digest to verify against; `frags` is any set of at least
/// `data_frags` fragment payloads.
pub fn decode_chunk(chunk: &ChunkRecord, frags: &[FragPayload]) -> Result<Bytes, CodecError> {
    let k = chunk.coder.data_frags as usize;
    let m = chunk.coder.parity_frags as usize;
    if chunk.coder.lrc_frags > 0 {
        return Err(CodecError::Unsupported(
            "this kernel does not decode LRC fragments".to_string(),
        ));
    }
    if frags.len() < k {
        return Err(CodecError::NotEnoughFrags {
            needed: k,
            got: frags.len(),
        });
    }

    // Split into original (data) and recovery (parity) shards by RS index.
    let frag_size = frags[0].data.len();
    let mut originals: Vec<(usize, &[u8])> = Vec::new();
    let mut recovery: Vec<(usize, &[u8])> = Vec::new();
    for frag in frags {
        if frag.data.len() != frag_size {
            return Err(CodecError::BadFragment(format!(
                "fragment {:?}/{} has size {}, expected {frag_size}",
                frag.kind,
                frag.index,
                frag.data.len()
            )));
        }
        let idx = frag.index as usize;
        match frag.kind {
            FragKind::Data if idx < k => originals.push((idx, frag.data.as_ref())),
            FragKind::Parity if idx < m => recovery.push((idx, frag.data.as_ref())),
            FragKind::Lrc => {
                return Err(CodecError::Unsupported(
                    "this kernel does not decode LRC fragments".to_string(),
                ));
            }
            kind => {
                return Err(CodecError::BadFragment(format!(
                    "fragment index {idx} out of range for kind {kind:?}"
                )));
            }
        }
    }
    originals.sort_by_key(|(i, _)| *i);
    originals.dedup_by_key(|(i, _)| *i);
    let payload_len = stored_payload_len(chunk);
    let mut padded = vec![0u8; k * frag_size];

    if originals.len() >= k {
        // Fast path: every data fragment present, no RS recovery needed.
        for (idx, data) in originals.iter().take(k) {
            padded[idx * frag_size..(idx + 1) * frag_size].copy_from_slice(data);
        }
    } else {
        if recovery.is_empty() {
            return Err(CodecError::NotEnoughFrags {
                needed: k,
                got: originals.len(),
            });
        }
        debug!(
            k,
            m,
            originals = originals.len(),
            recovery = recovery.len(),
            "recovering chunk payload from parity"
        );
        let restored =
            reed_solomon_simd::decode(k, m, originals.iter().copied(), recovery.iter().copied())?;
        for (idx, data) in &originals {
            padded[idx * frag_size..(idx + 1) * frag_size].copy_from_slice(data);
        }
        for (idx, data) in &restored {
            padded[idx * frag_size..(idx + 1) * frag_size].copy_from_slice(data);
        }
    }
    padded.truncate(payload_len);

    // Decrypt.
    let compressed = match chunk.coder.cipher {
        Some(CipherType::Aes256Gcm) => {
            let (key, iv) = match (&chunk.cipher_key, &chunk.cipher_iv) {
                (Some(key), Some(iv)) => (key, iv),
                _ => return Err(CodecError::MissingCipherState),
            };
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CodecError::Cipher)?;
            cipher
                .decrypt(Nonce::from_slice(iv), padded.as_slice())
                .map_err(|_| CodecError::Cipher)?
        }
        None => padded,
    };

    // Decompress.
    let plaintext = match chunk.coder.compress {
        Some(Compression::Zstd) => zstd::bulk::decompress(&compressed, chunk.size as usize)?,
        None => compressed,
    };

    // Integrity: the plaintext must match the recorded size and digest.
    if plaintext.len() != chunk.size as usize {
        return Err(CodecError::LengthMismatch {
            expected: chunk.size as usize,
            got: plaintext.len(),
        });
    }
    if digest_of(chunk.coder.digest_type, &plaintext) != chunk.digest {
        return Err(CodecError::DigestMismatch);
    }

    Ok(Bytes::from(plaintext))
}

/// Length of the stored payload before fragmentation padding.
fn stored_payload_len(chunk: &ChunkRecord) -> usize {
    let mut len = chunk.compressed_size as usize;
    if chunk.coder.cipher.is_some() {
        len += GCM_TAG_LEN;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_types::{ChunkCoderConfig, ChunkId, DigestType};

    use crate::encoder::{EncodedChunk, encode_chunk};

    fn coder(k: u8, m: u8, cipher: bool, compress: bool) -> ChunkCoderConfig {
        ChunkCoderConfig {
            compress: compress.then_some(Compression::Zstd),
            cipher: cipher.then_some(CipherType::Aes256Gcm),
            digest_type: DigestType::Blake3,
            data_frags: k,
            parity_frags: m,
            lrc_frags: 0,
        }
    }

    /// Build the ChunkRecord the metadata service would return, minus blocks.
    fn record_of(encoded: &EncodedChunk) -> ChunkRecord {
        ChunkRecord {
            chunk_id: ChunkId::from_data(&encoded.digest),
            digest: encoded.digest,
            size: encoded.size,
            compressed_size: encoded.compressed_size,
            cipher_key: encoded.cipher_key.clone(),
            cipher_iv: encoded.cipher_iv.clone(),
            coder: encoded.coder,
            frags: vec![],
        }
    }

    fn payloads(encoded: &EncodedChunk) -> Vec<FragPayload> {
        encoded
            .frags
            .iter()
            .map(|f| FragPayload {
                kind: f.kind,
                index: f.index,
                data: f.data.clone(),
            })
            .collect()
    }

    fn test_data(size: usize) -> Bytes {
        let mut data = Vec::with_capacity(size);
        let mut state: u32 = 0xDEAD_BEEF;
        for _ in 0..size {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            data.push((state >> 16) as u8);
        }
        Bytes::from(data)
    }

    #[test]
    fn test_roundtrip_all_frags() {
        let data = test_data(10_000);
        let encoded = encode_chunk(data.clone(), &coder(4, 2, false, false)).unwrap();
        let decoded = decode_chunk(&record_of(&encoded), &payloads(&encoded)).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_roundtrip_cipher_and_compression() {
        let data = Bytes::from(vec![0x55u8; 50_000]); // compressible
        let encoded = encode_chunk(data.clone(), &coder(4, 2, true, true)).unwrap();
        assert!(encoded.compressed_size < encoded.size);
        let decoded = decode_chunk(&record_of(&encoded), &payloads(&encoded)).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_roundtrip_data_frags_only() {
        let data = test_data(5000);
        let encoded = encode_chunk(data.clone(), &coder(3, 2, true, false)).unwrap();
        let data_only: Vec<_> = payloads(&encoded)
            .into_iter()
            .filter(|f| f.kind == FragKind::Data)
            .collect();
        let decoded = decode_chunk(&record_of(&encoded), &data_only).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_recovery_from_parity() {
        let data = test_data(5000);
        let encoded = encode_chunk(data.clone(), &coder(3, 2, false, false)).unwrap();
        // Drop data fragment 1, keep a parity fragment in its place.
        let subset: Vec<_> = payloads(&encoded)
            .into_iter()
            .filter(|f| !(f.kind == FragKind::Data && f.index == 1))
            .collect();
        let decoded = decode_chunk(&record_of(&encoded), &subset).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_all_loss_combinations_k2_m2() {
        let data = test_data(2048);
        let encoded = encode_chunk(data.clone(), &coder(2, 2, true, false)).unwrap();
        let record = record_of(&encoded);
        let all = payloads(&encoded);
        // Any 2 of the 4 fragments must reconstruct.
        for a in 0..4 {
            for b in (a + 1)..4 {
                let subset = vec![all[a].clone(), all[b].clone()];
                let decoded = decode_chunk(&record, &subset)
                    .unwrap_or_else(|e| panic!("failed for combo [{a},{b}]: {e}"));
                assert_eq!(decoded, data, "mismatch for combo [{a},{b}]");
            }
        }
    }

    #[test]
    fn test_not_enough_frags_errors() {
        let data = test_data(1000);
        let encoded = encode_chunk(data, &coder(3, 1, false, false)).unwrap();
        let too_few: Vec<_> = payloads(&encoded).into_iter().take(2).collect();
        assert!(matches!(
            decode_chunk(&record_of(&encoded), &too_few),
            Err(CodecError::NotEnoughFrags { needed: 3, got: 2 })
        ));
    }

    #[test]
    fn test_missing_data_without_parity_errors() {
        let data = test_data(1000);
        let encoded = encode_chunk(data, &coder(3, 2, false, false)).unwrap();
        // Only two of the three data fragments, no parity to fill in.
        let partial: Vec<_> = payloads(&encoded)
            .into_iter()
            .filter(|f| f.kind == FragKind::Data && f.index < 2)
            .collect();
        assert!(decode_chunk(&record_of(&encoded), &partial).is_err());
    }

    #[test]
    fn test_tampered_fragment_fails_digest_check() {
        let data = test_data(4096);
        let encoded = encode_chunk(data, &coder(2, 0, false, false)).unwrap();
        let mut frags = payloads(&encoded);
        let mut corrupted = frags[0].data.to_vec();
        corrupted[0] ^= 0xFF;
        frags[0].data = Bytes::from(corrupted);
        assert!(matches!(
            decode_chunk(&record_of(&encoded), &frags),
            Err(CodecError::DigestMismatch)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails_auth() {
        let data = test_data(4096);
        let encoded = encode_chunk(data, &coder(2, 0, true, false)).unwrap();
        let mut frags = payloads(&encoded);
        let mut corrupted = frags[1].data.to_vec();
        corrupted[10] ^= 0x01;
        frags[1].data = Bytes::from(corrupted);
        assert!(matches!(
            decode_chunk(&record_of(&encoded), &frags),
            Err(CodecError::Cipher)
        ));
    }

    #[test]
    fn test_fragment_order_independent() {
        let data = test_data(3000);
        let encoded = encode_chunk(data.clone(), &coder(3, 2, true, true)).unwrap();
        let mut shuffled = payloads(&encoded);
        shuffled.reverse();
        let decoded = decode_chunk(&record_of(&encoded), &shuffled).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_single_byte_roundtrip() {
        let data = Bytes::from_static(b"z");
        let encoded = encode_chunk(data.clone(), &coder(4, 2, true, true)).unwrap();
        let decoded = decode_chunk(&record_of(&encoded), &payloads(&encoded)).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_various_sizes_with_recovery() {
        for size in [1usize, 2, 3, 7, 64, 255, 1000, 4096, 65_537] {
            let data = test_data(size);
            let encoded = encode_chunk(data.clone(), &coder(3, 2, true, false)).unwrap();
            // Drop one data fragment each round.
            let subset: Vec<_> = payloads(&encoded)
                .into_iter()
                .filter(|f| !(f.kind == FragKind::Data && f.index == 0))
                .collect();
            let decoded = decode_chunk(&record_of(&encoded), &subset)
                .unwrap_or_else(|e| panic!("failed for size={size}: {e}"));
            assert_eq!(decoded, data, "mismatch for size={size}");
        }
    }

    #[test]
    fn test_missing_cipher_state_errors() {
        let data = test_data(100);
        let encoded = encode_chunk(data, &coder(2, 1, true, false)).unwrap();
        let mut record = record_of(&encoded);
        record.cipher_key = None;
        assert!(matches!(
            decode_chunk(&record, &payloads(&encoded)),
            Err(CodecError::MissingCipherState)
        ));
    }
}
