//! Chunk encoder: compress, encrypt, erasure-code, digest.
//!
//! A plaintext chunk goes through up to four transforms:
//! content digest → optional zstd compression → optional AES-256-GCM →
//! Reed-Solomon fragmentation with per-fragment digests. The caller hands
//! ownership of the plaintext in and gets fragments out; nothing retains
//! the plaintext past the call.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::Bytes;
use rand::RngCore;
use tern_types::{ChunkCoderConfig, CipherType, Compression, FragKind};
use tracing::debug;

use crate::digest::digest_of;
use crate::error::CodecError;

/// zstd level for chunk payloads. Low level: the win is network and disk
/// bytes, not ratio, and the encoder sits on the upload hot path.
const ZSTD_LEVEL: i32 = 1;

/// AES-GCM authentication tag length appended to the ciphertext.
pub(crate) const GCM_TAG_LEN: usize = 16;

/// One encoded fragment with its payload, ordered by `(kind, index)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrag {
    /// Data / parity / LRC.
    pub kind: FragKind,
    /// Position within its kind.
    pub index: u32,
    /// Digest of `data` per the chunk's digest type.
    pub digest: [u8; 32],
    /// The fragment payload as it will be stored.
    pub data: Bytes,
}

/// The result of encoding one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Content digest of the plaintext — the deduplication key.
    pub digest: [u8; 32],
    /// Plaintext size in bytes.
    pub size: u32,
    /// Payload size after compression (equals `size` when uncompressed).
    pub compressed_size: u32,
    /// Per-chunk cipher key, present when encryption was applied.
    pub cipher_key: Option<Vec<u8>>,
    /// Per-chunk cipher nonce.
    pub cipher_iv: Option<Vec<u8>>,
    /// The effective coder config for this chunk. Differs from the requested
    /// config only in `compress`, which is dropped when not profitable.
    pub coder: ChunkCoderConfig,
    /// Fragments ordered data first, then parity.
    pub frags: Vec<EncodedFrag>,
}

/// Encode a plaintext chunk into fragments.
pub fn encode_chunk(data: Bytes, coder: &ChunkCoderConfig) -> Result<EncodedChunk, CodecError> {
    if data.is_empty() {
        return Err(CodecError::EmptyChunk);
    }
    if coder.lrc_frags > 0 {
        return Err(CodecError::Unsupported(format!(
            "this kernel does not produce LRC fragments (requested {})",
            coder.lrc_frags
        )));
    }
    if coder.data_frags == 0 {
        return Err(CodecError::Unsupported("data_frags must be > 0".to_string()));
    }

    let size = data.len();
    let digest = digest_of(coder.digest_type, &data);
    let mut effective = *coder;

    // Compression is per-chunk: keep it only when it actually shrinks.
    let compressed: Vec<u8> = match coder.compress {
        Some(Compression::Zstd) => {
            let c = zstd::bulk::compress(&data, ZSTD_LEVEL)?;
            if c.len() < size {
                c
            } else {
                effective.compress = None;
                data.to_vec()
            }
        }
        None => data.to_vec(),
    };
    let compressed_size = compressed.len();
    drop(data);

    // Encrypt with a fresh key and nonce per chunk.
    let (payload, cipher_key, cipher_iv) = match coder.cipher {
        Some(CipherType::Aes256Gcm) => {
            let mut key = vec![0u8; 32];
            let mut iv = vec![0u8; 12];
            rand::rng().fill_bytes(&mut key);
            rand::rng().fill_bytes(&mut iv);
            let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CodecError::Cipher)?;
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&iv), compressed.as_slice())
                .map_err(|_| CodecError::Cipher)?;
            (ciphertext, Some(key), Some(iv))
        }
        None => (compressed, None, None),
    };

    // Fragment the payload: k equal data fragments (zero-padded, even-sized
    // as the RS library requires), plus m parity fragments.
    let k = coder.data_frags as usize;
    let m = coder.parity_frags as usize;
    let frag_size = round_up_even(payload.len().div_ceil(k));
    let mut padded = payload;
    padded.resize(k * frag_size, 0);

    let originals: Vec<&[u8]> = padded.chunks_exact(frag_size).collect();
    debug_assert_eq!(originals.len(), k);

    let mut frags = Vec::with_capacity(k + m);
    for (i, original) in originals.iter().enumerate() {
        let data = Bytes::copy_from_slice(original);
        frags.push(EncodedFrag {
            kind: FragKind::Data,
            index: i as u32,
            digest: digest_of(coder.digest_type, &data),
            data,
        });
    }

    if m > 0 {
        let recovery = reed_solomon_simd::encode(k, m, &originals)?;
        for (i, rec) in recovery.iter().enumerate() {
            let data = Bytes::copy_from_slice(rec);
            frags.push(EncodedFrag {
                kind: FragKind::Parity,
                index: i as u32,
                digest: digest_of(coder.digest_type, &data),
                data,
            });
        }
    }

    debug!(
        size,
        compressed_size,
        frag_size,
        k,
        m,
        compressed = effective.compress.is_some(),
        encrypted = cipher_key.is_some(),
        "encoded chunk"
    );

    Ok(EncodedChunk {
        digest,
        size: size as u32,
        compressed_size: compressed_size as u32,
        cipher_key,
        cipher_iv,
        coder: effective,
        frags,
    })
}

/// Round up to the nearest even number.
pub(crate) fn round_up_even(n: usize) -> usize {
    if n.is_multiple_of(2) { n } else { n + 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_coder(k: u8, m: u8) -> ChunkCoderConfig {
        ChunkCoderConfig {
            compress: None,
            cipher: None,
            digest_type: tern_types::DigestType::Blake3,
            data_frags: k,
            parity_frags: m,
            lrc_frags: 0,
        }
    }

    #[test]
    fn test_encode_basic_shape() {
        let data = Bytes::from(vec![0xABu8; 1000]);
        let encoded = encode_chunk(data, &plain_coder(4, 2)).unwrap();
        assert_eq!(encoded.size, 1000);
        assert_eq!(encoded.compressed_size, 1000);
        assert_eq!(encoded.frags.len(), 6);
        let frag_size = encoded.frags[0].data.len();
        for f in &encoded.frags {
            assert_eq!(f.data.len(), frag_size, "all fragments must be equal size");
            assert!(f.data.len().is_multiple_of(2), "fragment size must be even");
        }
    }

    #[test]
    fn test_encode_frag_ordering() {
        let data = Bytes::from(vec![0xCDu8; 500]);
        let encoded = encode_chunk(data, &plain_coder(3, 2)).unwrap();
        let kinds: Vec<_> = encoded.frags.iter().map(|f| (f.kind, f.index)).collect();
        assert_eq!(
            kinds,
            vec![
                (FragKind::Data, 0),
                (FragKind::Data, 1),
                (FragKind::Data, 2),
                (FragKind::Parity, 0),
                (FragKind::Parity, 1),
            ]
        );
    }

    #[test]
    fn test_encode_empty_chunk_errors() {
        assert!(matches!(
            encode_chunk(Bytes::new(), &plain_coder(2, 1)),
            Err(CodecError::EmptyChunk)
        ));
    }

    #[test]
    fn test_encode_lrc_unsupported() {
        let coder = ChunkCoderConfig {
            lrc_frags: 2,
            ..plain_coder(2, 1)
        };
        assert!(matches!(
            encode_chunk(Bytes::from_static(b"data"), &coder),
            Err(CodecError::Unsupported(_))
        ));
    }

    #[test]
    fn test_content_digest_deterministic_across_cipher() {
        // The dedup digest covers the plaintext, so two encodes of the same
        // bytes agree even though cipher keys are random.
        let coder = ChunkCoderConfig {
            cipher: Some(CipherType::Aes256Gcm),
            ..plain_coder(2, 1)
        };
        let e1 = encode_chunk(Bytes::from(vec![7u8; 300]), &coder).unwrap();
        let e2 = encode_chunk(Bytes::from(vec![7u8; 300]), &coder).unwrap();
        assert_eq!(e1.digest, e2.digest);
        assert_ne!(e1.cipher_key, e2.cipher_key, "keys must be per-chunk random");
    }

    #[test]
    fn test_compression_kept_when_profitable() {
        let coder = ChunkCoderConfig {
            compress: Some(Compression::Zstd),
            ..plain_coder(2, 1)
        };
        // Highly compressible input.
        let encoded = encode_chunk(Bytes::from(vec![0u8; 100_000]), &coder).unwrap();
        assert!(encoded.compressed_size < encoded.size);
        assert_eq!(encoded.coder.compress, Some(Compression::Zstd));
    }

    #[test]
    fn test_compression_skipped_when_not_profitable() {
        let coder = ChunkCoderConfig {
            compress: Some(Compression::Zstd),
            ..plain_coder(2, 1)
        };
        // Pseudo-random input does not compress.
        let mut data = Vec::with_capacity(4096);
        let mut state: u32 = 0xDEAD_BEEF;
        for _ in 0..4096 {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            data.push((state >> 16) as u8);
        }
        let encoded = encode_chunk(Bytes::from(data), &coder).unwrap();
        assert_eq!(encoded.compressed_size, encoded.size);
        assert_eq!(
            encoded.coder.compress, None,
            "effective config must drop unprofitable compression"
        );
    }

    #[test]
    fn test_cipher_payload_differs_from_plaintext() {
        let coder = ChunkCoderConfig {
            cipher: Some(CipherType::Aes256Gcm),
            ..plain_coder(1, 0)
        };
        let plain = vec![0x42u8; 64];
        let encoded = encode_chunk(Bytes::from(plain.clone()), &coder).unwrap();
        assert!(encoded.cipher_key.is_some());
        assert_eq!(encoded.cipher_iv.as_ref().unwrap().len(), 12);
        assert_ne!(&encoded.frags[0].data[..64], &plain[..]);
    }

    #[test]
    fn test_encode_single_byte() {
        let encoded = encode_chunk(Bytes::from_static(b"x"), &plain_coder(4, 2)).unwrap();
        assert_eq!(encoded.size, 1);
        assert_eq!(encoded.frags.len(), 6);
    }

    #[test]
    fn test_encode_k1_m0_passthrough() {
        let encoded = encode_chunk(Bytes::from(vec![0xAA; 100]), &plain_coder(1, 0)).unwrap();
        assert_eq!(encoded.frags.len(), 1);
        assert_eq!(&encoded.frags[0].data[..100], &[0xAA; 100][..]);
    }

    #[test]
    fn test_frag_digests_cover_stored_payload() {
        let encoded = encode_chunk(Bytes::from(vec![1u8; 777]), &plain_coder(3, 1)).unwrap();
        for f in &encoded.frags {
            assert_eq!(
                f.digest,
                digest_of(encoded.coder.digest_type, &f.data),
                "fragment digest must match its stored bytes"
            );
        }
    }

    #[test]
    fn test_round_up_even() {
        assert_eq!(round_up_even(1), 2);
        assert_eq!(round_up_even(2), 2);
        assert_eq!(round_up_even(3), 4);
        assert_eq!(round_up_even(4), 4);
    }
}
