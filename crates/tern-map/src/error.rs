//! Error types for metadata and block-store interactions.

use tern_types::{BlockId, FragKind, MultipartId, ObjId};

/// Errors from the metadata service, block agents, or the map client.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// The object does not exist or is not complete.
    #[error("object not found: {0}")]
    ObjectNotFound(ObjId),

    /// The multipart upload does not exist.
    #[error("multipart not found: {0}")]
    MultipartNotFound(MultipartId),

    /// The block could not be read or written on its agent.
    #[error("block unavailable: {0}")]
    BlockUnavailable(BlockId),

    /// A metadata-service RPC failed. Propagated unchanged to callers.
    #[error("rpc failed: {0}")]
    Rpc(String),

    /// The service reply violated the protocol contract.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A fragment finished with fewer replicas than the service requires.
    #[error(
        "durability floor missed for chunk {chunk}: fragment {kind:?}/{index} \
         has {written} of {required} replicas"
    )]
    DurabilityFloor {
        /// Index of the chunk within its batch.
        chunk: usize,
        /// Fragment kind.
        kind: FragKind,
        /// Fragment index within its kind.
        index: u32,
        /// Replicas written successfully.
        written: usize,
        /// Replicas required by the allocation.
        required: usize,
    },

    /// Record serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}
