//! Bounded worker pool for CPU-bound chunk coding.
//!
//! Encode and decode are pure CPU work (zstd, AES, Reed-Solomon) and must
//! not run on the async scheduler threads. [`CoderPool`] gates the number
//! of in-flight kernel invocations with a semaphore and runs each on
//! `spawn_blocking`, so the pipeline's backpressure extends into the
//! blocking thread pool.

use std::sync::Arc;

use bytes::Bytes;
use tern_types::{ChunkCoderConfig, ChunkRecord};
use tokio::sync::Semaphore;

use crate::decoder::{FragPayload, decode_chunk};
use crate::encoder::{EncodedChunk, encode_chunk};
use crate::error::CodecError;

/// Semaphore-bounded pool of kernel invocations.
#[derive(Clone)]
pub struct CoderPool {
    permits: Arc<Semaphore>,
}

impl CoderPool {
    /// Create a pool allowing `concurrency` kernel calls in flight.
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Encode a chunk on a worker thread. Takes ownership of the plaintext;
    /// it is dropped inside the kernel once fragments exist.
    pub async fn encode(
        &self,
        data: Bytes,
        coder: ChunkCoderConfig,
    ) -> Result<EncodedChunk, CodecError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CodecError::Worker("coder pool closed".to_string()))?;
        tokio::task::spawn_blocking(move || encode_chunk(data, &coder))
            .await
            .map_err(|e| CodecError::Worker(e.to_string()))?
    }

    /// Decode a chunk on a worker thread.
    pub async fn decode(
        &self,
        chunk: ChunkRecord,
        frags: Vec<FragPayload>,
    ) -> Result<Bytes, CodecError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CodecError::Worker("coder pool closed".to_string()))?;
        tokio::task::spawn_blocking(move || decode_chunk(&chunk, &frags))
            .await
            .map_err(|e| CodecError::Worker(e.to_string()))?
    }
}
