//! Shared types and identifiers for tern.
//!
//! This crate defines the core types used across the tern workspace:
//! identifiers ([`ObjId`], [`ChunkId`], [`PartId`], [`BlockId`], [`NodeId`],
//! [`MultipartId`]), the chunk/fragment/block/part data model
//! ([`ChunkRecord`], [`FragRecord`], [`BlockMd`], [`PartRecord`]), object
//! metadata ([`ObjectMd`], [`MdSnapshot`]), and the per-stream configuration
//! ([`ChunkSplitConfig`], [`ChunkCoderConfig`]).

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

define_id!(
    /// Identifier of a stored object, minted by the metadata service.
    ObjId
);

define_id!(
    /// Identifier of a deduplicated chunk, minted by the metadata service.
    ChunkId
);

define_id!(
    /// Identifier of a part placement within an object.
    PartId
);

define_id!(
    /// Identifier of one stored block (a fragment replica on one agent).
    BlockId
);

define_id!(
    /// Identifier of a storage agent.
    NodeId
);

define_id!(
    /// Identifier of one multipart upload within an object.
    MultipartId
);

// ---------------------------------------------------------------------------
// Split / coder configuration
// ---------------------------------------------------------------------------

/// Per-stream parameters for the content-defined splitter.
///
/// **These must never change for data that should deduplicate against
/// existing chunks** — different parameters produce different boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSplitConfig {
    /// Minimum chunk size in bytes. Must be > 0.
    pub min_chunk: u32,
    /// Maximum chunk size in bytes. Must be >= `min_chunk`.
    pub max_chunk: u32,
    /// Number of rolling-hash bits that must match to declare a boundary.
    /// The expected chunk size is `min_chunk + 2^avg_chunk_bits`.
    pub avg_chunk_bits: u32,
    /// Compute a whole-stream MD5 alongside splitting.
    pub calc_md5: bool,
    /// Compute a whole-stream SHA-256 alongside splitting.
    pub calc_sha256: bool,
}

impl Default for ChunkSplitConfig {
    fn default() -> Self {
        Self {
            min_chunk: 262_144,    // 256 KB
            max_chunk: 4_194_304,  // 4 MB
            avg_chunk_bits: 20,    // ~1 MB expected above min
            calc_md5: true,
            calc_sha256: false,
        }
    }
}

/// Digest algorithm for chunk content and fragment payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestType {
    /// BLAKE3, 32 bytes.
    Blake3,
    /// SHA-256, 32 bytes.
    Sha256,
}

/// Compression algorithm applied to a chunk before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    /// Zstandard compression.
    Zstd,
}

/// Cipher applied to the (possibly compressed) chunk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherType {
    /// AES-256-GCM with a per-chunk random key and 96-bit nonce.
    Aes256Gcm,
}

/// Chunk coder configuration: how a chunk is transformed into fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCoderConfig {
    /// Optional compression, skipped per chunk when not profitable.
    pub compress: Option<Compression>,
    /// Optional encryption of the stored payload.
    pub cipher: Option<CipherType>,
    /// Digest algorithm for the chunk content and fragment payloads.
    pub digest_type: DigestType,
    /// Number of data fragments (`k`).
    pub data_frags: u8,
    /// Number of global parity fragments (`m`).
    pub parity_frags: u8,
    /// Number of local-reconstruction fragments (`l`). The data model
    /// carries these; kernels that cannot produce them reject `l > 0`.
    pub lrc_frags: u8,
}

impl Default for ChunkCoderConfig {
    fn default() -> Self {
        Self {
            compress: Some(Compression::Zstd),
            cipher: Some(CipherType::Aes256Gcm),
            digest_type: DigestType::Blake3,
            data_frags: 4,
            parity_frags: 2,
            lrc_frags: 0,
        }
    }
}

impl ChunkCoderConfig {
    /// Total number of fragments produced per chunk.
    pub fn total_frags(&self) -> usize {
        self.data_frags as usize + self.parity_frags as usize + self.lrc_frags as usize
    }
}

// ---------------------------------------------------------------------------
// Chunk / fragment / block / part records
// ---------------------------------------------------------------------------

/// Role of a fragment within a chunk's erasure coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FragKind {
    /// Data fragment, indices `0..k`. Any `k` fragments reconstruct the chunk.
    Data,
    /// Global parity fragment, indices `0..m`.
    Parity,
    /// Local-reconstruction fragment, indices `0..l`.
    Lrc,
}

/// Metadata of one stored block: a replica of one fragment on one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMd {
    /// Block identifier minted at allocation.
    pub block_id: BlockId,
    /// The agent this block lives on.
    pub node_id: NodeId,
    /// Transport address of the agent.
    pub address: String,
    /// Digest algorithm of `digest`.
    pub digest_type: DigestType,
    /// Expected digest of the block payload (the fragment digest).
    pub digest: Option<[u8; 32]>,
}

/// A fragment of a chunk with its ordered replica blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragRecord {
    /// Data / parity / LRC.
    pub kind: FragKind,
    /// Position within its kind (`0..k`, `0..m`, or `0..l`).
    pub index: u32,
    /// Digest of the fragment payload as stored.
    pub digest: Option<[u8; 32]>,
    /// Replica blocks, tried in order on read.
    pub blocks: Vec<BlockMd>,
}

/// A deduplicated chunk: one contiguous content-defined range of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Chunk identifier minted at allocation.
    pub chunk_id: ChunkId,
    /// Content digest of the plaintext (dedup key).
    pub digest: [u8; 32],
    /// Plaintext size in bytes.
    pub size: u32,
    /// Payload size after compression (equals `size` when uncompressed).
    pub compressed_size: u32,
    /// Per-chunk cipher key (present when `coder.cipher` is set).
    pub cipher_key: Option<Vec<u8>>,
    /// Per-chunk cipher nonce.
    pub cipher_iv: Option<Vec<u8>>,
    /// The effective coder configuration used for this chunk.
    pub coder: ChunkCoderConfig,
    /// Fragments ordered by `(kind, index)`.
    pub frags: Vec<FragRecord>,
}

/// Placement of one chunk into an object range.
///
/// Within one object, parts are contiguous and ordered by `start`, and
/// `end - start` equals the referenced chunk's size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    /// Owning object.
    pub obj_id: ObjId,
    /// Owning multipart upload, when part of one.
    pub multipart_id: Option<MultipartId>,
    /// Ordinal of this part within its upload.
    pub seq: u32,
    /// Absolute start offset within the object.
    pub start: u64,
    /// Absolute end offset within the object (exclusive).
    pub end: u64,
    /// The chunk placed at this range.
    pub chunk_id: ChunkId,
}

/// A part joined with its chunk record, as returned by `read_object_mappings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    /// The placement record.
    pub part: PartRecord,
    /// The chunk it references.
    pub chunk: ChunkRecord,
    /// Offset into the chunk's plaintext where this part's data begins.
    pub chunk_offset: u64,
}

// ---------------------------------------------------------------------------
// Object metadata
// ---------------------------------------------------------------------------

/// Object metadata as held by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMd {
    /// Object identifier.
    pub obj_id: ObjId,
    /// Bucket name.
    pub bucket: String,
    /// Object key within the bucket.
    pub key: String,
    /// Total size in bytes.
    pub size: u64,
    /// Content type (e.g. `video/mp4`), used by the read path's prefetch.
    pub content_type: String,
    /// Entity tag, the hex whole-stream MD5.
    pub etag: String,
    /// Unix timestamp (seconds) when the upload completed.
    pub create_time: u64,
    /// Whole-stream MD5, when computed at upload.
    pub md5: Option<[u8; 16]>,
    /// Whole-stream SHA-256, when computed at upload.
    pub sha256: Option<[u8; 32]>,
    /// Number of parts recorded at completion.
    pub num_parts: u32,
}

impl ObjectMd {
    /// Snapshot of the fields that change when an object is overwritten.
    pub fn snapshot(&self) -> MdSnapshot {
        MdSnapshot {
            obj_id: self.obj_id,
            etag: self.etag.clone(),
            size: self.size,
            create_time: self.create_time,
        }
    }
}

/// Validation token for cached object ranges.
///
/// A cached range is served only while the authoritative metadata still
/// matches this snapshot; any mismatch means the object was overwritten or
/// versioned, and the entry must be invalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdSnapshot {
    /// Object identifier.
    pub obj_id: ObjId,
    /// Entity tag at snapshot time.
    pub etag: String,
    /// Size at snapshot time.
    pub size: u64,
    /// Creation time at snapshot time.
    pub create_time: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obj_id_from_data_deterministic() {
        let id1 = ObjId::from_data(b"object");
        let id2 = ObjId::from_data(b"object");
        assert_eq!(id1, id2, "same data must produce same ObjId");
    }

    #[test]
    fn test_ids_differ_for_different_data() {
        assert_ne!(ChunkId::from_data(b"a"), ChunkId::from_data(b"b"));
        assert_ne!(BlockId::from_data(b"a"), BlockId::from_data(b"b"));
    }

    #[test]
    fn test_id_display_outputs_hex() {
        let id = NodeId::from([0xABu8; 32]);
        let hex = id.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c == 'a' || c == 'b'));
    }

    #[test]
    fn test_id_debug_format() {
        let id = ChunkId::from([0u8; 32]);
        let debug = format!("{id:?}");
        assert!(debug.starts_with("ChunkId("));
        assert!(debug.ends_with(')'));
    }

    #[test]
    fn test_id_hash_and_ordering() {
        use std::collections::HashSet;
        let low = BlockId::from([0u8; 32]);
        let high = BlockId::from([0xFFu8; 32]);
        assert!(low < high);
        let mut set = HashSet::new();
        set.insert(low);
        set.insert(high);
        set.insert(low);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_split_config_default() {
        let config = ChunkSplitConfig::default();
        assert_eq!(config.min_chunk, 262_144);
        assert_eq!(config.max_chunk, 4_194_304);
        assert_eq!(config.avg_chunk_bits, 20);
        assert!(config.calc_md5);
        assert!(!config.calc_sha256);
    }

    #[test]
    fn test_coder_config_total_frags() {
        let coder = ChunkCoderConfig {
            data_frags: 4,
            parity_frags: 2,
            lrc_frags: 1,
            ..Default::default()
        };
        assert_eq!(coder.total_frags(), 7);
    }

    #[test]
    fn test_frag_kind_ordering() {
        // Fragments sort data first, then parity, then LRC.
        assert!(FragKind::Data < FragKind::Parity);
        assert!(FragKind::Parity < FragKind::Lrc);
    }

    #[test]
    fn test_snapshot_captures_identity_fields() {
        let md = sample_md();
        let snap = md.snapshot();
        assert_eq!(snap.obj_id, md.obj_id);
        assert_eq!(snap.etag, md.etag);
        assert_eq!(snap.size, md.size);
        assert_eq!(snap.create_time, md.create_time);
    }

    fn sample_md() -> ObjectMd {
        ObjectMd {
            obj_id: ObjId::from_data(b"obj"),
            bucket: "b".to_string(),
            key: "k".to_string(),
            size: 1234,
            content_type: "application/octet-stream".to_string(),
            etag: "deadbeef".to_string(),
            create_time: 1_700_000_000,
            md5: Some([1u8; 16]),
            sha256: None,
            num_parts: 2,
        }
    }

    fn sample_chunk() -> ChunkRecord {
        ChunkRecord {
            chunk_id: ChunkId::from_data(b"chunk-0"),
            digest: [7u8; 32],
            size: 1024,
            compressed_size: 600,
            cipher_key: Some(vec![0u8; 32]),
            cipher_iv: Some(vec![0u8; 12]),
            coder: ChunkCoderConfig::default(),
            frags: vec![FragRecord {
                kind: FragKind::Data,
                index: 0,
                digest: Some([9u8; 32]),
                blocks: vec![BlockMd {
                    block_id: BlockId::from_data(b"block-0"),
                    node_id: NodeId::from_data(b"node-0"),
                    address: "mem://node-0".to_string(),
                    digest_type: DigestType::Blake3,
                    digest: Some([9u8; 32]),
                }],
            }],
        }
    }

    // --- Postcard round-trip tests ---

    #[test]
    fn test_id_roundtrip_postcard() {
        let id = ObjId::from_data(b"roundtrip");
        let encoded = postcard::to_allocvec(&id).unwrap();
        let decoded: ObjId = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn test_chunk_record_roundtrip_postcard() {
        let chunk = sample_chunk();
        let encoded = postcard::to_allocvec(&chunk).unwrap();
        let decoded: ChunkRecord = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(chunk, decoded);
    }

    #[test]
    fn test_part_info_roundtrip_postcard() {
        let info = PartInfo {
            part: PartRecord {
                obj_id: ObjId::from_data(b"obj"),
                multipart_id: Some(MultipartId::from_data(b"mp")),
                seq: 3,
                start: 2048,
                end: 3072,
                chunk_id: ChunkId::from_data(b"chunk-0"),
            },
            chunk: sample_chunk(),
            chunk_offset: 0,
        };
        let encoded = postcard::to_allocvec(&info).unwrap();
        let decoded: PartInfo = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(info, decoded);
    }

    #[test]
    fn test_object_md_roundtrip_postcard() {
        let md = sample_md();
        let encoded = postcard::to_allocvec(&md).unwrap();
        let decoded: ObjectMd = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(md, decoded);
    }

    #[test]
    fn test_configs_roundtrip_postcard() {
        let split = ChunkSplitConfig::default();
        let coder = ChunkCoderConfig::default();
        let s: ChunkSplitConfig =
            postcard::from_bytes(&postcard::to_allocvec(&split).unwrap()).unwrap();
        let c: ChunkCoderConfig =
            postcard::from_bytes(&postcard::to_allocvec(&coder).unwrap()).unwrap();
        assert_eq!(split, s);
        assert_eq!(coder, c);
    }
}
