//! The per-batch map client: ALLOCATE → WRITE → FINALIZE.
//!
//! One [`MapClient`] instance serves one upload; each coalesced batch runs
//! the full state machine once. Allocation submits content and fragment
//! digests and gets back either a dedup decision (nothing to write) or a
//! block allocation per fragment replica. Writes fan out in parallel and
//! tolerate individual replica failures down to the service's durability
//! floor; finalization reports exactly which blocks made it.
//!
//! The client holds no mutable state, so concurrent batches and reentrant
//! calls from the read path are safe by construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tern_codec::EncodedChunk;
use tern_types::{BlockId, BlockMd, MultipartId, ObjId, PartRecord};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::MapError;
use crate::rpc::{
    AllocateRequest, BlockClient, ChunkAllocation, ChunkFragInfo, ChunkInfo, ErrorAction,
    ErrorReport, FinalizeRequest, FinalizedChunk, MetaClient, PartStub,
};

/// One encoded chunk positioned within its upload stream.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    /// Ordinal of the part this chunk becomes.
    pub seq: u32,
    /// Start offset within the stream.
    pub start: u64,
    /// End offset within the stream, exclusive.
    pub end: u64,
    /// The encoded chunk.
    pub encoded: EncodedChunk,
}

/// Result of committing one batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// The committed part placements, in stream order.
    pub parts: Vec<PartRecord>,
    /// How many chunks deduplicated against existing data.
    pub dup_chunks: usize,
    /// How many blocks were written successfully.
    pub written_blocks: usize,
}

/// Per-upload batch committer.
pub struct MapClient {
    meta: Arc<dyn MetaClient>,
    blocks: Arc<dyn BlockClient>,
    obj_id: ObjId,
    multipart_id: Option<MultipartId>,
    check_dups: bool,
    write_timeout: Duration,
}

impl MapClient {
    /// Create a map client for one upload.
    pub fn new(
        meta: Arc<dyn MetaClient>,
        blocks: Arc<dyn BlockClient>,
        obj_id: ObjId,
        multipart_id: Option<MultipartId>,
        check_dups: bool,
        write_timeout: Duration,
    ) -> Self {
        Self {
            meta,
            blocks,
            obj_id,
            multipart_id,
            check_dups,
            write_timeout,
        }
    }

    /// Run one batch through ALLOCATE → WRITE → FINALIZE.
    pub async fn upload_batch(&self, batch: &[ChunkUpload]) -> Result<BatchOutcome, MapError> {
        if batch.is_empty() {
            return Ok(BatchOutcome {
                parts: Vec::new(),
                dup_chunks: 0,
                written_blocks: 0,
            });
        }

        // ALLOCATE
        let request = AllocateRequest {
            obj_id: self.obj_id,
            multipart_id: self.multipart_id,
            check_dups: self.check_dups,
            chunks: batch.iter().map(|c| chunk_info(&c.encoded)).collect(),
            parts: batch
                .iter()
                .map(|c| PartStub {
                    seq: c.seq,
                    start: c.start,
                    end: c.end,
                })
                .collect(),
        };
        let reply = self.meta.allocate_object_parts(request).await?;
        if reply.allocations.len() != batch.len() {
            return Err(MapError::Protocol(format!(
                "allocation count {} does not match batch size {}",
                reply.allocations.len(),
                batch.len()
            )));
        }

        // WRITE — fan out every (fragment, replica) pair, collect successes.
        let mut writes: JoinSet<(usize, usize, BlockMd, Result<(), MapError>)> = JoinSet::new();
        for (ci, (upload, alloc)) in batch.iter().zip(&reply.allocations).enumerate() {
            let ChunkAllocation::Write { frag_blocks, .. } = alloc else {
                continue;
            };
            if frag_blocks.len() != upload.encoded.frags.len() {
                return Err(MapError::Protocol(format!(
                    "allocation for chunk {ci} covers {} fragments, encoded {}",
                    frag_blocks.len(),
                    upload.encoded.frags.len()
                )));
            }
            for (fi, (frag, replicas)) in
                upload.encoded.frags.iter().zip(frag_blocks).enumerate()
            {
                for block in replicas {
                    let blocks = Arc::clone(&self.blocks);
                    let block = block.clone();
                    let data = frag.data.clone();
                    let timeout = self.write_timeout;
                    writes.spawn(async move {
                        let res = blocks.write_block(&block, data, timeout).await;
                        (ci, fi, block, res)
                    });
                }
            }
        }

        let mut written: HashMap<(usize, usize), Vec<BlockId>> = HashMap::new();
        let mut failed_blocks = 0usize;
        while let Some(joined) = writes.join_next().await {
            let (ci, fi, block, res) = joined.map_err(|e| MapError::Rpc(e.to_string()))?;
            match res {
                Ok(()) => written.entry((ci, fi)).or_default().push(block.block_id),
                Err(e) => {
                    failed_blocks += 1;
                    warn!(chunk = ci, frag = fi, block_id = %block.block_id, %e, "block write failed");
                    report_block_error(
                        Arc::clone(&self.meta),
                        ErrorReport {
                            action: ErrorAction::Write,
                            obj_id: self.obj_id,
                            block,
                            rpc_code: None,
                            message: e.to_string(),
                        },
                    );
                }
            }
        }

        // Enforce the durability floor per fragment.
        let mut dup_chunks = 0usize;
        let mut written_blocks = 0usize;
        for (ci, (upload, alloc)) in batch.iter().zip(&reply.allocations).enumerate() {
            match alloc {
                ChunkAllocation::Dup { .. } => dup_chunks += 1,
                ChunkAllocation::Write { min_replicas, .. } => {
                    for (fi, frag) in upload.encoded.frags.iter().enumerate() {
                        let ok = written.get(&(ci, fi)).map_or(0, Vec::len);
                        written_blocks += ok;
                        if ok < *min_replicas as usize {
                            return Err(MapError::DurabilityFloor {
                                chunk: ci,
                                kind: frag.kind,
                                index: frag.index,
                                written: ok,
                                required: *min_replicas as usize,
                            });
                        }
                    }
                }
            }
        }

        // FINALIZE — commit parts and report surviving blocks.
        let parts: Vec<PartRecord> = batch
            .iter()
            .zip(&reply.allocations)
            .map(|(upload, alloc)| {
                let chunk_id = match alloc {
                    ChunkAllocation::Dup { chunk_id } => *chunk_id,
                    ChunkAllocation::Write { chunk_id, .. } => *chunk_id,
                };
                PartRecord {
                    obj_id: self.obj_id,
                    multipart_id: self.multipart_id,
                    seq: upload.seq,
                    start: upload.start,
                    end: upload.end,
                    chunk_id,
                }
            })
            .collect();

        let chunks: Vec<FinalizedChunk> = reply
            .allocations
            .iter()
            .enumerate()
            .filter_map(|(ci, alloc)| match alloc {
                ChunkAllocation::Dup { .. } => None,
                ChunkAllocation::Write { chunk_id, .. } => Some(FinalizedChunk {
                    chunk_id: *chunk_id,
                    written_blocks: (0..batch[ci].encoded.frags.len())
                        .flat_map(|fi| written.get(&(ci, fi)).cloned().unwrap_or_default())
                        .collect(),
                }),
            })
            .collect();

        self.meta
            .finalize_object_parts(FinalizeRequest {
                obj_id: self.obj_id,
                multipart_id: self.multipart_id,
                parts: parts.clone(),
                chunks,
            })
            .await?;

        debug!(
            obj_id = %self.obj_id,
            batch = batch.len(),
            dup_chunks,
            written_blocks,
            failed_blocks,
            "batch finalized"
        );

        Ok(BatchOutcome {
            parts,
            dup_chunks,
            written_blocks,
        })
    }
}

/// Build the allocation-time view of an encoded chunk.
fn chunk_info(encoded: &EncodedChunk) -> ChunkInfo {
    ChunkInfo {
        digest: encoded.digest,
        size: encoded.size,
        compressed_size: encoded.compressed_size,
        cipher_key: encoded.cipher_key.clone(),
        cipher_iv: encoded.cipher_iv.clone(),
        coder: encoded.coder,
        frags: encoded
            .frags
            .iter()
            .map(|f| ChunkFragInfo {
                kind: f.kind,
                index: f.index,
                digest: Some(f.digest),
            })
            .collect(),
    }
}

/// Fire-and-forget block error report. Report failures must never mask the
/// original I/O error, so they are logged and dropped.
pub fn report_block_error(meta: Arc<dyn MetaClient>, report: ErrorReport) {
    tokio::spawn(async move {
        if let Err(e) = meta.report_error_on_object(report).await {
            debug!(%e, "block error report failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tern_codec::encode_chunk;
    use tern_types::{ChunkCoderConfig, DigestType};

    use crate::memory::{InMemoryBlocks, InMemoryMeta};
    use crate::rpc::CreateUploadRequest;

    fn coder(k: u8, m: u8) -> ChunkCoderConfig {
        ChunkCoderConfig {
            compress: None,
            cipher: None,
            digest_type: DigestType::Blake3,
            data_frags: k,
            parity_frags: m,
            lrc_frags: 0,
        }
    }

    fn chunk_upload(seq: u32, start: u64, data: &[u8], coder: &ChunkCoderConfig) -> ChunkUpload {
        let encoded = encode_chunk(Bytes::copy_from_slice(data), coder).unwrap();
        ChunkUpload {
            seq,
            start,
            end: start + data.len() as u64,
            encoded,
        }
    }

    async fn open(meta: &Arc<InMemoryMeta>) -> ObjId {
        meta.create_object_upload(CreateUploadRequest {
            bucket: "b".to_string(),
            key: "k".to_string(),
            size: None,
            content_type: "application/octet-stream".to_string(),
        })
        .await
        .unwrap()
        .obj_id
    }

    fn client(
        meta: &Arc<InMemoryMeta>,
        blocks: &Arc<InMemoryBlocks>,
        obj_id: ObjId,
    ) -> MapClient {
        MapClient::new(
            Arc::clone(meta) as Arc<dyn MetaClient>,
            Arc::clone(blocks) as Arc<dyn BlockClient>,
            obj_id,
            None,
            true,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_batch_writes_all_blocks() {
        let meta = Arc::new(InMemoryMeta::new(3).with_coder(coder(2, 1)));
        let blocks = Arc::new(InMemoryBlocks::new());
        let obj_id = open(&meta).await;

        let batch = vec![
            chunk_upload(0, 0, &[1u8; 1000], &coder(2, 1)),
            chunk_upload(1, 1000, &[2u8; 500], &coder(2, 1)),
        ];
        let outcome = client(&meta, &blocks, obj_id)
            .upload_batch(&batch)
            .await
            .unwrap();

        assert_eq!(outcome.parts.len(), 2);
        assert_eq!(outcome.dup_chunks, 0);
        // 2 chunks x 3 fragments x 1 replica.
        assert_eq!(outcome.written_blocks, 6);
        assert_eq!(blocks.block_count(), 6);
        assert_eq!(outcome.parts[0].start, 0);
        assert_eq!(outcome.parts[0].end, 1000);
        assert_eq!(outcome.parts[1].start, 1000);
        assert_eq!(outcome.parts[1].end, 1500);
    }

    #[tokio::test]
    async fn test_duplicate_chunks_are_never_written() {
        let meta = Arc::new(InMemoryMeta::new(2).with_coder(coder(2, 1)));
        let blocks = Arc::new(InMemoryBlocks::new());

        // First upload commits the chunk.
        let first = open(&meta).await;
        let batch = vec![chunk_upload(0, 0, &[9u8; 2000], &coder(2, 1))];
        client(&meta, &blocks, first).upload_batch(&batch).await.unwrap();
        meta.complete_object_upload(crate::rpc::CompleteUploadRequest {
            obj_id: first,
            size: 2000,
            num_parts: 1,
            md5: None,
            sha256: None,
            etag: "e1".to_string(),
        })
        .await
        .unwrap();
        let blocks_before = blocks.block_count();

        // Second upload of identical content deduplicates, no new blocks.
        let second = open(&meta).await;
        let outcome = client(&meta, &blocks, second)
            .upload_batch(&batch)
            .await
            .unwrap();
        assert_eq!(outcome.dup_chunks, 1);
        assert_eq!(outcome.written_blocks, 0);
        assert_eq!(blocks.block_count(), blocks_before, "dup must not write");
    }

    #[tokio::test]
    async fn test_replica_failure_below_floor_tolerated() {
        // Two replicas, floor of one: losing an agent still commits.
        let meta = Arc::new(InMemoryMeta::new(2).with_coder(coder(2, 1)).with_replicas(2, 1));
        let blocks = Arc::new(InMemoryBlocks::new());
        blocks.fail_node(meta.agents()[1]);

        let obj_id = open(&meta).await;
        let batch = vec![chunk_upload(0, 0, &[3u8; 1000], &coder(2, 1))];
        let outcome = client(&meta, &blocks, obj_id)
            .upload_batch(&batch)
            .await
            .unwrap();

        // 3 fragments x 2 replicas, half of them on the dead agent.
        assert_eq!(outcome.written_blocks, 3);

        // Each failed replica produced an error report.
        tokio::task::yield_now().await;
        let reports = meta.error_reports();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.action == ErrorAction::Write));
    }

    #[tokio::test]
    async fn test_durability_floor_miss_fails_batch() {
        let meta = Arc::new(InMemoryMeta::new(1).with_coder(coder(2, 1)));
        let blocks = Arc::new(InMemoryBlocks::new());
        blocks.fail_node(meta.agents()[0]);

        let obj_id = open(&meta).await;
        let batch = vec![chunk_upload(0, 0, &[4u8; 1000], &coder(2, 1))];
        let err = client(&meta, &blocks, obj_id)
            .upload_batch(&batch)
            .await
            .unwrap_err();
        assert!(
            matches!(err, MapError::DurabilityFloor { written: 0, required: 1, .. }),
            "expected durability floor error, got: {err}"
        );
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let meta = Arc::new(InMemoryMeta::new(1));
        let blocks = Arc::new(InMemoryBlocks::new());
        let obj_id = open(&meta).await;
        let outcome = client(&meta, &blocks, obj_id).upload_batch(&[]).await.unwrap();
        assert!(outcome.parts.is_empty());
        assert_eq!(blocks.block_count(), 0);
    }
}
