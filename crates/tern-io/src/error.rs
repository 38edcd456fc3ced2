//! Error types for the I/O engine.

use std::time::Duration;

use tern_types::{BlockId, ChunkId, NodeId};

/// Errors that can occur in the upload pipeline and read path.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// The stream byte semaphore could not be acquired in time.
    #[error("stream admission timed out after {0:?}")]
    StreamItemTimeout(Duration),

    /// Metadata-service or block-store failure, propagated unchanged.
    #[error("map error: {0}")]
    Map(#[from] tern_map::MapError),

    /// Encode/decode kernel failure.
    #[error("codec error: {0}")]
    Codec(#[from] tern_codec::CodecError),

    /// Reading the upload source failed.
    #[error("source read error: {0}")]
    Source(#[from] std::io::Error),

    /// Not enough readable fragments to reconstruct a chunk.
    #[error("cannot reconstruct chunk {chunk_id}: {found} of {needed} fragments readable")]
    Reconstruction {
        /// The chunk that could not be decoded.
        chunk_id: ChunkId,
        /// Fragments required (`data_frags`).
        needed: usize,
        /// Fragments actually readable.
        found: usize,
    },

    /// Verification mode found a block whose payload does not match its
    /// recorded digest.
    #[error("tampering detected on block {block_id} (agent {node_id})")]
    Tampering {
        /// The corrupted block.
        block_id: BlockId,
        /// The agent serving it.
        node_id: NodeId,
    },

    /// Verification mode found an inconsistency beyond a single block.
    #[error("verification failed: {0}")]
    Verification(String),

    /// The assembled range does not cover exactly the requested window.
    #[error("range assembly failed for [{start}, {end}): {reason}")]
    RangeAssembly {
        /// Requested start offset.
        start: u64,
        /// Requested end offset.
        end: u64,
        /// What went wrong.
        reason: String,
    },

    /// The read stream was closed by the caller.
    #[error("read stream closed")]
    Closed,

    /// A pipeline stage ended without delivering its result.
    #[error("pipeline stage terminated unexpectedly: {0}")]
    Pipeline(String),
}
