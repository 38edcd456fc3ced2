//! The downward RPC surface: metadata service and block agents.
//!
//! The I/O engine reaches both external collaborators through these traits.
//! Replies are treated as opaque apart from the documented fields; real
//! deployments put a network transport behind them, tests and
//! single-process use plug in the [`crate::memory`] implementations.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tern_types::{
    BlockId, BlockMd, ChunkCoderConfig, ChunkId, ChunkSplitConfig, FragKind, MultipartId, ObjId,
    ObjectMd, PartInfo, PartRecord,
};

use crate::error::MapError;

// ---------------------------------------------------------------------------
// Upload lifecycle
// ---------------------------------------------------------------------------

/// Request to open an object upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUploadRequest {
    /// Target bucket.
    pub bucket: String,
    /// Object key within the bucket.
    pub key: String,
    /// Declared size, when the caller knows it up front.
    pub size: Option<u64>,
    /// Content type recorded on the object.
    pub content_type: String,
}

/// Reply to [`CreateUploadRequest`]: the identity and per-stream coding
/// parameters the service selected for this upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUploadReply {
    /// The new object's identifier.
    pub obj_id: ObjId,
    /// Storage tier selected by the service. Informational.
    pub tier_id: Option<String>,
    /// Splitter parameters for this stream.
    pub split: ChunkSplitConfig,
    /// Chunk coder parameters for this stream.
    pub coder: ChunkCoderConfig,
    /// Whether the service deduplicates chunks for this upload.
    pub check_dups: bool,
}

/// Request to open one multipart upload under an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMultipartRequest {
    /// The owning object.
    pub obj_id: ObjId,
    /// Part number within the object; ordering key at completion.
    pub num: u32,
}

/// Reply to [`CreateMultipartRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMultipartReply {
    /// The new multipart's identifier.
    pub multipart_id: MultipartId,
    /// Splitter parameters for this stream.
    pub split: ChunkSplitConfig,
    /// Chunk coder parameters for this stream.
    pub coder: ChunkCoderConfig,
    /// Whether the service deduplicates chunks for this upload.
    pub check_dups: bool,
}

/// Request to commit an object upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteUploadRequest {
    /// The object to complete.
    pub obj_id: ObjId,
    /// Final object size.
    pub size: u64,
    /// Number of parts uploaded.
    pub num_parts: u32,
    /// Whole-stream MD5 from the splitter.
    pub md5: Option<[u8; 16]>,
    /// Whole-stream SHA-256 from the splitter.
    pub sha256: Option<[u8; 32]>,
    /// Entity tag (hex MD5).
    pub etag: String,
}

/// Request to commit one multipart upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteMultipartRequest {
    /// The owning object.
    pub obj_id: ObjId,
    /// The multipart to complete.
    pub multipart_id: MultipartId,
    /// Bytes uploaded in this multipart.
    pub size: u64,
    /// Parts uploaded in this multipart.
    pub num_parts: u32,
    /// MD5 of this multipart's bytes.
    pub md5: Option<[u8; 16]>,
}

/// Committed multipart metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartMd {
    /// The multipart's identifier.
    pub multipart_id: MultipartId,
    /// The owning object.
    pub obj_id: ObjId,
    /// Part number within the object.
    pub num: u32,
    /// Bytes uploaded.
    pub size: u64,
    /// Parts uploaded.
    pub num_parts: u32,
}

// ---------------------------------------------------------------------------
// Allocation and finalization
// ---------------------------------------------------------------------------

/// Fragment metadata submitted at allocation time (no payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkFragInfo {
    /// Data / parity / LRC.
    pub kind: FragKind,
    /// Position within its kind.
    pub index: u32,
    /// Digest of the fragment payload.
    pub digest: Option<[u8; 32]>,
}

/// Chunk metadata submitted at allocation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Content digest of the plaintext — the dedup key.
    pub digest: [u8; 32],
    /// Plaintext size.
    pub size: u32,
    /// Payload size after compression.
    pub compressed_size: u32,
    /// Per-chunk cipher key.
    pub cipher_key: Option<Vec<u8>>,
    /// Per-chunk cipher nonce.
    pub cipher_iv: Option<Vec<u8>>,
    /// Effective coder config for this chunk.
    pub coder: ChunkCoderConfig,
    /// Fragment digests, ordered `(kind, index)`.
    pub frags: Vec<ChunkFragInfo>,
}

/// Part placement submitted at allocation time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartStub {
    /// Ordinal within the upload.
    pub seq: u32,
    /// Start offset (multipart uploads submit offsets relative to zero).
    pub start: u64,
    /// End offset, exclusive.
    pub end: u64,
}

/// Request for dedup decisions and block allocations for a batch of chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateRequest {
    /// The owning object.
    pub obj_id: ObjId,
    /// The owning multipart, when uploading one.
    pub multipart_id: Option<MultipartId>,
    /// Whether duplicate chunks should be detected instead of written.
    pub check_dups: bool,
    /// Chunk metadata, one per part.
    pub chunks: Vec<ChunkInfo>,
    /// Part placements, parallel to `chunks`.
    pub parts: Vec<PartStub>,
}

/// The service's decision for one chunk of an allocation batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChunkAllocation {
    /// The chunk already exists; reference it, write nothing.
    Dup {
        /// The existing chunk.
        chunk_id: ChunkId,
    },
    /// Write the chunk's fragments to the allocated blocks.
    Write {
        /// The newly minted chunk.
        chunk_id: ChunkId,
        /// Durability floor: replicas each fragment must reach.
        min_replicas: u32,
        /// Allocated replica blocks, outer index parallel to the submitted
        /// fragment list.
        frag_blocks: Vec<Vec<BlockMd>>,
    },
}

/// Reply to [`AllocateRequest`], parallel to the submitted chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateReply {
    /// One decision per submitted chunk.
    pub allocations: Vec<ChunkAllocation>,
}

/// Per-chunk write results reported at finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizedChunk {
    /// The chunk that was written.
    pub chunk_id: ChunkId,
    /// Blocks that were written successfully.
    pub written_blocks: Vec<BlockId>,
}

/// Request to commit a batch: part placements plus surviving blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeRequest {
    /// The owning object.
    pub obj_id: ObjId,
    /// The owning multipart, when uploading one.
    pub multipart_id: Option<MultipartId>,
    /// Final part placements.
    pub parts: Vec<PartRecord>,
    /// Written chunks with their surviving blocks.
    pub chunks: Vec<FinalizedChunk>,
}

// ---------------------------------------------------------------------------
// Error reporting
// ---------------------------------------------------------------------------

/// Which I/O direction a block failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorAction {
    /// Reading a block.
    Read,
    /// Writing a block.
    Write,
}

/// Asynchronous report of a single failed block operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Direction of the failed operation.
    pub action: ErrorAction,
    /// The object being served.
    pub obj_id: ObjId,
    /// The block that failed.
    pub block: BlockMd,
    /// RPC error code, when the transport produced one.
    pub rpc_code: Option<String>,
    /// Human-readable failure description.
    pub message: String,
}

/// Out-of-band endpoint health report (e.g. stream-admission stress).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointReport {
    /// Problem class, e.g. `"stream_semaphore_stress"`.
    pub problem: String,
    /// Free-form detail.
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Client of the metadata service.
///
/// The service owns all bookkeeping and allocation decisions; the engine
/// only executes what these calls return.
#[async_trait]
pub trait MetaClient: Send + Sync {
    /// Open an object upload.
    async fn create_object_upload(
        &self,
        req: CreateUploadRequest,
    ) -> Result<CreateUploadReply, MapError>;

    /// Open one multipart upload under an existing object.
    async fn create_multipart(
        &self,
        req: CreateMultipartRequest,
    ) -> Result<CreateMultipartReply, MapError>;

    /// Commit an object upload. Stitches multipart offsets when present.
    async fn complete_object_upload(
        &self,
        req: CompleteUploadRequest,
    ) -> Result<ObjectMd, MapError>;

    /// Commit one multipart upload.
    async fn complete_multipart(
        &self,
        req: CompleteMultipartRequest,
    ) -> Result<MultipartMd, MapError>;

    /// Best-effort abort of an unfinished upload.
    async fn abort_object_upload(&self, obj_id: ObjId) -> Result<(), MapError>;

    /// Submit chunk digests for dedup decisions and block allocations.
    async fn allocate_object_parts(&self, req: AllocateRequest) -> Result<AllocateReply, MapError>;

    /// Commit part placements and report which blocks were written.
    async fn finalize_object_parts(&self, req: FinalizeRequest) -> Result<(), MapError>;

    /// Read the parts (with chunk records) intersecting `[start, end)`.
    async fn read_object_mappings(
        &self,
        obj_id: ObjId,
        start: u64,
        end: u64,
    ) -> Result<Vec<PartInfo>, MapError>;

    /// Read object metadata. Light call, used for cache validation.
    async fn read_object_md(&self, obj_id: ObjId) -> Result<ObjectMd, MapError>;

    /// Report a failed block operation. Failures of the report itself are
    /// swallowed by callers.
    async fn report_error_on_object(&self, report: ErrorReport) -> Result<(), MapError>;

    /// Report endpoint-level distress (admission timeouts).
    async fn report_endpoint_problems(&self, report: EndpointReport) -> Result<(), MapError>;
}

/// Client of the block-store agents.
#[async_trait]
pub trait BlockClient: Send + Sync {
    /// Read one block from the agent at `block.address`.
    async fn read_block(&self, block: &BlockMd, timeout: Duration) -> Result<Bytes, MapError>;

    /// Write one block to the agent at `block.address`.
    async fn write_block(
        &self,
        block: &BlockMd,
        data: Bytes,
        timeout: Duration,
    ) -> Result<(), MapError>;
}
