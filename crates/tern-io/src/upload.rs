//! The streaming upload pipeline.
//!
//! Bounded channels wire five stages together; backpressure is inherent
//! because every stage blocks on its downstream queue:
//!
//! ```text
//! source ──1 MB buffers──▶ splitter ──100 chunks──▶ encoder (20 workers)
//!        ──20 in flight──▶ coalescer (20 items / 10 ms) ──1 batch──▶ uploader
//! ```
//!
//! The splitter owns the only copy of raw stream bytes; once a chunk is
//! encoded its plaintext is gone and only fragments travel further. The
//! uploader runs one mapping batch at a time, which serializes batch
//! completion in stream order. Any stage error tears the pipeline down
//! through channel closure, and the most-upstream error is re-raised.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tern_codec::{CodecError, CoderPool, EncodedChunk};
use tern_map::{ChunkUpload, MapClient};
use tern_split::{Splitter, StreamDigests};
use tern_types::{ChunkCoderConfig, ChunkSplitConfig, MultipartId, ObjId};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::chunked::ChunkedDecoder;
use crate::coalesce::coalesce;
use crate::engine::EngineInner;
use crate::error::IoError;
use crate::read::ObjectReadStream;

/// Source reader buffer size.
const SOURCE_BUFFER: usize = 1024 * 1024;

/// Splitter output watermark, in chunks.
const SPLIT_QUEUE: usize = 100;

/// Encoder output watermark, in chunks.
const ENCODE_QUEUE: usize = 20;

/// Where an upload's bytes come from.
pub enum UploadSource {
    /// A caller-supplied byte stream.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    /// Another object, by id.
    Copy(CopySource),
}

/// Source description for copy uploads.
#[derive(Debug, Clone)]
pub struct CopySource {
    /// The object to copy from.
    pub obj_id: ObjId,
    /// Bucket the source lives in.
    pub bucket: String,
    /// Optional byte sub-range; `None` copies the whole object.
    pub range: Option<(u64, u64)>,
}

/// Parameters for [`crate::ObjectIo::upload_object`].
pub struct UploadParams {
    /// Target bucket.
    pub bucket: String,
    /// Object key within the bucket.
    pub key: String,
    /// Declared size, when known. Sizes the admission lock.
    pub size: Option<u64>,
    /// Content type recorded on the object.
    pub content_type: String,
    /// Whether the source still wears its HTTP chunked-transfer envelope,
    /// to be stripped before splitting.
    pub chunked_encoding: bool,
    /// The bytes.
    pub source: UploadSource,
}

/// Parameters for [`crate::ObjectIo::upload_multipart`].
pub struct MultipartParams {
    /// The object this multipart belongs to.
    pub obj_id: ObjId,
    /// Part number; ordering key at object completion.
    pub num: u32,
    /// Declared size, when known.
    pub size: Option<u64>,
    /// The bytes.
    pub source: Box<dyn AsyncRead + Send + Unpin>,
}

/// Bytes feeding a pipeline: a raw reader, one still wearing its chunked
/// transfer envelope, or another object's read stream (the copy path for
/// foreign buckets / sub-ranges).
pub(crate) enum ByteSource {
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    Chunked {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        decoder: ChunkedDecoder,
        queue: std::collections::VecDeque<Bytes>,
    },
    Object(ObjectReadStream),
}

impl ByteSource {
    pub(crate) fn chunked(reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        ByteSource::Chunked {
            reader,
            decoder: ChunkedDecoder::new(),
            queue: std::collections::VecDeque::new(),
        }
    }

    async fn next_buf(&mut self) -> Result<Option<Bytes>, IoError> {
        match self {
            ByteSource::Reader(reader) => read_some(reader).await,
            ByteSource::Chunked {
                reader,
                decoder,
                queue,
            } => {
                loop {
                    if let Some(buf) = queue.pop_front() {
                        return Ok(Some(buf));
                    }
                    match read_some(reader).await? {
                        Some(raw) => queue.extend(decoder.push(&raw)?),
                        None => {
                            if !decoder.finished() {
                                return Err(IoError::Source(std::io::Error::new(
                                    std::io::ErrorKind::UnexpectedEof,
                                    "chunked transfer envelope truncated",
                                )));
                            }
                            return Ok(None);
                        }
                    }
                }
            }
            ByteSource::Object(stream) => match stream.next().await {
                Some(Ok(buf)) => Ok(Some(buf)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            },
        }
    }
}

async fn read_some(
    reader: &mut Box<dyn AsyncRead + Send + Unpin>,
) -> Result<Option<Bytes>, IoError> {
    let mut buf = BytesMut::zeroed(SOURCE_BUFFER);
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some(buf.freeze()))
}

/// What a finished pipeline reports up to the completion RPC.
#[derive(Debug, Clone)]
pub(crate) struct UploadOutcome {
    pub size: u64,
    pub num_parts: u32,
    pub digests: StreamDigests,
}

/// One split chunk awaiting encoding.
struct ChunkBuf {
    seq: u32,
    start: u64,
    data: Bytes,
}

/// What the splitter stage reports when it drains its source.
struct SplitReport {
    size: u64,
    digests: StreamDigests,
}

/// Run one upload pipeline to completion.
pub(crate) async fn run_pipeline(
    inner: &Arc<EngineInner>,
    obj_id: ObjId,
    multipart_id: Option<MultipartId>,
    split: ChunkSplitConfig,
    coder: ChunkCoderConfig,
    check_dups: bool,
    source: ByteSource,
) -> Result<UploadOutcome, IoError> {
    let (chunk_tx, chunk_rx) = mpsc::channel::<ChunkBuf>(SPLIT_QUEUE);
    let (pending_tx, pending_rx) =
        mpsc::channel::<(u32, u64, usize, oneshot::Receiver<Result<EncodedChunk, CodecError>>)>(
            ENCODE_QUEUE,
        );
    let (encoded_tx, encoded_rx) = mpsc::channel::<ChunkUpload>(ENCODE_QUEUE);
    // Watermark 1: batches complete strictly in stream order.
    let (batch_tx, batch_rx) = mpsc::channel::<Vec<ChunkUpload>>(1);

    let split_handle = tokio::spawn(split_stage(source, split, chunk_tx));
    let encode_handle = tokio::spawn(encode_stage(
        inner.pool.clone(),
        coder,
        chunk_rx,
        pending_tx,
    ));
    let resolve_handle = tokio::spawn(resolve_stage(pending_rx, encoded_tx));
    let coalesce_handle = tokio::spawn(coalesce(
        encoded_rx,
        batch_tx,
        inner.config.coalesce_max_length,
        inner.config.coalesce_max_wait(),
    ));

    // Uploader: one map-client invocation per batch, serialized.
    let map_client = MapClient::new(
        Arc::clone(&inner.meta),
        Arc::clone(&inner.blocks),
        obj_id,
        multipart_id,
        check_dups,
        inner.config.write_block_timeout(),
    );
    let mut batch_rx = batch_rx;
    let mut num_parts = 0u32;
    let mut dup_chunks = 0usize;
    let upload_result: Result<(), IoError> = async {
        while let Some(batch) = batch_rx.recv().await {
            let outcome = map_client.upload_batch(&batch).await?;
            num_parts += outcome.parts.len() as u32;
            dup_chunks += outcome.dup_chunks;
            debug!(%obj_id, parts = num_parts, "batch committed");
        }
        Ok(())
    }
    .await;
    drop(batch_rx);

    // Join the stages. Channel closure has already unwound them; surface
    // the most-upstream genuine error.
    let split_result = split_handle
        .await
        .map_err(|e| IoError::Pipeline(e.to_string()))?;
    let resolve_result = resolve_handle
        .await
        .map_err(|e| IoError::Pipeline(e.to_string()))?;
    let _ = encode_handle.await;
    let _ = coalesce_handle.await;

    upload_result?;
    resolve_result?;
    let report = split_result?
        .ok_or_else(|| IoError::Pipeline("splitter cancelled without error".to_string()))?;

    info!(
        %obj_id,
        size = report.size,
        parts = num_parts,
        dup_chunks,
        "upload pipeline complete"
    );

    Ok(UploadOutcome {
        size: report.size,
        num_parts,
        digests: report.digests,
    })
}

/// Stage 1: drain the source through the splitter, emitting whole chunks.
///
/// Returns `Ok(None)` when a downstream stage closed early (some other
/// stage holds the real error).
async fn split_stage(
    mut source: ByteSource,
    config: ChunkSplitConfig,
    chunk_tx: mpsc::Sender<ChunkBuf>,
) -> Result<Option<SplitReport>, IoError> {
    let mut splitter = Splitter::new(&config);
    let mut pending = BytesMut::new();
    let mut seq = 0u32;
    let mut offset = 0u64;

    while let Some(buf) = source.next_buf().await? {
        pending.extend_from_slice(&buf);
        for len in splitter.push(&buf) {
            let data = pending.split_to(len).freeze();
            let chunk = ChunkBuf {
                seq,
                start: offset,
                data,
            };
            seq += 1;
            offset += len as u64;
            if chunk_tx.send(chunk).await.is_err() {
                return Ok(None);
            }
        }
    }

    // The residue is the final chunk; no trailing boundary is emitted.
    debug_assert_eq!(pending.len(), splitter.pending());
    if !pending.is_empty() {
        let len = pending.len();
        let chunk = ChunkBuf {
            seq,
            start: offset,
            data: pending.split_to(len).freeze(),
        };
        offset += len as u64;
        if chunk_tx.send(chunk).await.is_err() {
            return Ok(None);
        }
    }

    Ok(Some(SplitReport {
        size: offset,
        digests: splitter.finish(),
    }))
}

/// Stage 2: dispatch chunks to the coder pool, forwarding completion
/// handles in order so parallel encodes cannot reorder the stream.
async fn encode_stage(
    pool: CoderPool,
    coder: ChunkCoderConfig,
    mut chunk_rx: mpsc::Receiver<ChunkBuf>,
    pending_tx: mpsc::Sender<(u32, u64, usize, oneshot::Receiver<Result<EncodedChunk, CodecError>>)>,
) {
    while let Some(chunk) = chunk_rx.recv().await {
        let (done_tx, done_rx) = oneshot::channel();
        let pool = pool.clone();
        let len = chunk.data.len();
        let (seq, start, data) = (chunk.seq, chunk.start, chunk.data);
        tokio::spawn(async move {
            let result = pool.encode(data, coder).await;
            let _ = done_tx.send(result);
        });
        if pending_tx.send((seq, start, len, done_rx)).await.is_err() {
            return;
        }
    }
}

/// Stage 3: await encodes in stream order and hand them to the coalescer.
async fn resolve_stage(
    mut pending_rx: mpsc::Receiver<(
        u32,
        u64,
        usize,
        oneshot::Receiver<Result<EncodedChunk, CodecError>>,
    )>,
    encoded_tx: mpsc::Sender<ChunkUpload>,
) -> Result<(), IoError> {
    while let Some((seq, start, len, done_rx)) = pending_rx.recv().await {
        let encoded = match done_rx.await {
            Ok(Ok(encoded)) => encoded,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(IoError::Pipeline("encode task dropped".to_string())),
        };
        let upload = ChunkUpload {
            seq,
            start,
            end: start + len as u64,
            encoded,
        };
        if encoded_tx.send(upload).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}
