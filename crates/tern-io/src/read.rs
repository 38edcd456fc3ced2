//! The read path: mapping lookup, fragment fetch, decode, range assembly.
//!
//! A read request flows bottom-up through four layers:
//!
//! 1. [`ObjectReadStream`] — the caller-facing pull stream. Each pull
//!    reserves its byte footprint on the stream gate, fetches one
//!    request-sized window through the range cache, and queues the
//!    returned buffers in ascending offset order.
//! 2. `read_object_with_cache` — splits the window into aligned
//!    sub-ranges and resolves each through the range cache with bounded
//!    parallelism and single-flight loads.
//! 3. `read_range_uncached` — on a cache miss, reads the mappings for the
//!    aligned window, reconstructs every touched part, and assembles the
//!    exact byte range.
//! 4. Fragment fetch — per chunk: data fragments first (no erasure
//!    recovery needed when all are readable), otherwise every fragment
//!    plus a Reed-Solomon decode. Replica blocks are tried in order under
//!    the global and per-agent read semaphores.
//!
//! Verification mode reads every replica of every fragment, recomputes
//! digests client-side (raising [`IoError::Tampering`] on mismatch),
//! asserts replica equality, and cross-checks a recovery-heavy decode
//! against the data-fragment decode.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tern_codec::FragPayload;
use tern_map::rpc::{ErrorAction, ErrorReport};
use tern_map::{MapError, report_block_error};
use tern_types::{BlockMd, ChunkRecord, FragKind, MdSnapshot, ObjId, ObjectMd};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::{RangeEntry, RangeKey};
use crate::engine::EngineInner;
use crate::error::IoError;

/// Objects below this size never trigger the video tail prefetch.
const VIDEO_PREFETCH_MIN_SIZE: u64 = 1024 * 1024;

/// Bytes speculatively fetched from the object tail for video streams.
const VIDEO_PREFETCH_TAIL: u64 = 1024;

/// Delay before the speculative tail fetch starts.
const VIDEO_PREFETCH_DELAY: Duration = Duration::from_millis(10);

/// Parameters for [`crate::ObjectIo::read_object_stream`].
#[derive(Debug, Clone)]
pub struct ReadParams {
    /// The object to read.
    pub obj_id: ObjId,
    /// First byte offset.
    pub start: u64,
    /// End offset (exclusive); object end when `None`.
    pub end: Option<u64>,
    /// Bytes per pull; engine default when `None`.
    pub request_size: Option<usize>,
}

impl ReadParams {
    /// Read the whole object.
    pub fn whole(obj_id: ObjId) -> Self {
        Self {
            obj_id,
            start: 0,
            end: None,
            request_size: None,
        }
    }

    /// Read `[start, end)`.
    pub fn range(obj_id: ObjId, start: u64, end: u64) -> Self {
        Self {
            obj_id,
            start,
            end: Some(end),
            request_size: None,
        }
    }
}

/// Caller-facing pull stream over an object range.
///
/// `next` yields buffers in ascending offset order and `None` at end of
/// range. An error is yielded exactly once; afterwards the stream is
/// terminated. [`close`](Self::close) drops any queued buffers and ends
/// the stream on the following pull.
pub struct ObjectReadStream {
    inner: Arc<EngineInner>,
    md: ObjectMd,
    start: u64,
    pos: u64,
    end: u64,
    request_size: usize,
    queue: VecDeque<Bytes>,
    closed: bool,
    errored: bool,
    started: bool,
}

impl ObjectReadStream {
    /// Metadata of the object being read.
    pub fn object_md(&self) -> &ObjectMd {
        &self.md
    }

    /// Close the stream: pending buffers are dropped immediately and the
    /// next pull returns `None`.
    pub fn close(&mut self) {
        self.closed = true;
        self.queue.clear();
    }

    /// Pull the next buffer.
    pub async fn next(&mut self) -> Option<Result<Bytes, IoError>> {
        loop {
            if self.closed {
                self.queue.clear();
                return None;
            }
            if let Some(buf) = self.queue.pop_front() {
                return Some(Ok(buf));
            }
            if self.errored || self.pos >= self.end {
                return None;
            }

            if !self.started {
                self.started = true;
                maybe_spawn_tail_prefetch(&self.inner, &self.md, self.start);
            }

            let requested_end = self.end.min(self.pos + self.request_size as u64);
            let permit = match self.inner.stream_gate.acquire(requested_end - self.pos).await {
                Ok(permit) => permit,
                Err(e) => {
                    if matches!(e, IoError::StreamItemTimeout(_)) {
                        crate::engine::report_stream_stress(&self.inner);
                    }
                    self.errored = true;
                    return Some(Err(e));
                }
            };

            let result =
                read_object_with_cache(&self.inner, self.md.obj_id, self.pos, requested_end).await;
            drop(permit);

            match result {
                Ok(bufs) => {
                    self.pos = requested_end;
                    self.queue.extend(bufs.into_iter().filter(|b| !b.is_empty()));
                    // Loop: either yield the first buffer or pull further.
                }
                Err(e) => {
                    self.errored = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Open a read stream: resolve metadata and clamp the range.
pub(crate) async fn open_stream(
    inner: Arc<EngineInner>,
    params: ReadParams,
) -> Result<ObjectReadStream, IoError> {
    let md = inner.meta.read_object_md(params.obj_id).await?;
    let start = params.start.min(md.size);
    let end = params.end.unwrap_or(md.size).min(md.size).max(start);
    let request_size = params
        .request_size
        .unwrap_or(inner.config.read_request_size)
        .max(1);
    debug!(obj_id = %params.obj_id, start, end, "opening read stream");
    Ok(ObjectReadStream {
        inner,
        md,
        start,
        pos: start,
        end,
        request_size,
        queue: VecDeque::new(),
        closed: false,
        errored: false,
        started: false,
    })
}

/// Speculatively warm the cache with the object tail for video content,
/// where players immediately seek to the trailing index atoms. Skipped
/// under admission pressure; failures are logged and swallowed.
fn maybe_spawn_tail_prefetch(inner: &Arc<EngineInner>, md: &ObjectMd, start: u64) {
    if start != 0
        || md.size <= VIDEO_PREFETCH_MIN_SIZE
        || !md.content_type.starts_with("video")
        || inner.stream_gate.waiting() >= inner.config.video_prefetch_load_cap
    {
        return;
    }
    let inner = Arc::clone(inner);
    let obj_id = md.obj_id;
    let size = md.size;
    tokio::spawn(async move {
        tokio::time::sleep(VIDEO_PREFETCH_DELAY).await;
        let tail_start = size.saturating_sub(VIDEO_PREFETCH_TAIL);
        if let Err(e) = read_object_with_cache(&inner, obj_id, tail_start, size).await {
            debug!(%obj_id, %e, "video tail prefetch failed");
        }
    });
}

/// Read `[start, end)` through the range cache: split into aligned
/// sub-ranges, resolve up to `read_range_concurrency` of them in parallel,
/// and return the intersecting slices in ascending order.
pub(crate) async fn read_object_with_cache(
    inner: &Arc<EngineInner>,
    obj_id: ObjId,
    start: u64,
    end: u64,
) -> Result<Vec<Bytes>, IoError> {
    if start >= end {
        return Ok(Vec::new());
    }

    let align = inner.config.object_range_align;
    let first = (start / align) * align;
    let aligned: Vec<u64> = (0..)
        .map(|i| first + i * align)
        .take_while(|&a| a < end)
        .collect();

    let mut entries: Vec<Option<RangeEntry>> = vec![None; aligned.len()];
    for batch in aligned
        .iter()
        .enumerate()
        .collect::<Vec<_>>()
        .chunks(inner.config.read_range_concurrency.max(1))
    {
        let mut set: JoinSet<(usize, Result<RangeEntry, IoError>)> = JoinSet::new();
        for &(i, &aligned_start) in batch {
            let inner = Arc::clone(inner);
            set.spawn(async move {
                let result = get_aligned_range(&inner, obj_id, aligned_start).await;
                (i, result)
            });
        }
        while let Some(joined) = set.join_next().await {
            let (i, result) = joined.map_err(|e| IoError::Pipeline(e.to_string()))?;
            entries[i] = Some(result?);
        }
    }

    let mut out = Vec::new();
    for (i, &aligned_start) in aligned.iter().enumerate() {
        let entry = entries[i]
            .take()
            .ok_or_else(|| IoError::Pipeline("aligned range fetch vanished".to_string()))?;
        let Some(buf) = entry.buf else {
            continue; // past EOF
        };
        let buf_end = aligned_start + buf.len() as u64;
        let s = start.max(aligned_start);
        let e = end.min(buf_end);
        if s < e {
            out.push(buf.slice((s - aligned_start) as usize..(e - aligned_start) as usize));
        }
    }
    Ok(out)
}

/// Resolve one aligned range through the cache: validate on hit, load
/// single-flight on miss.
async fn get_aligned_range(
    inner: &Arc<EngineInner>,
    obj_id: ObjId,
    aligned_start: u64,
) -> Result<RangeEntry, IoError> {
    let key: RangeKey = (obj_id, aligned_start);

    if let Some(entry) = inner.cache.lookup(&key) {
        if validate_snapshot(inner, &entry.snapshot).await? {
            return Ok(entry);
        }
        debug!(%obj_id, aligned_start, "cached range snapshot stale, invalidating");
        inner.cache.invalidate(&key);
    }

    let gate = inner.cache.gate(key);
    let guard = gate.lock().await;

    let result = async {
        // A predecessor holding the gate may have loaded the entry already.
        if let Some(entry) = inner.cache.lookup(&key) {
            if validate_snapshot(inner, &entry.snapshot).await? {
                return Ok(entry);
            }
            inner.cache.invalidate(&key);
        }

        let md = inner.meta.read_object_md(obj_id).await?;
        let align = inner.config.object_range_align;
        let buf = if aligned_start >= md.size {
            None
        } else {
            let load_end = (aligned_start + align).min(md.size);
            Some(read_range_uncached(inner, obj_id, aligned_start, load_end).await?)
        };
        let entry = RangeEntry {
            snapshot: md.snapshot(),
            buf,
        };
        inner.cache.insert(key, entry.clone());
        Ok(entry)
    }
    .await;

    drop(guard);
    inner.cache.release_gate(&key);
    result
}

/// Check a cached snapshot against the authoritative metadata. A vanished
/// object counts as a mismatch; transport errors propagate.
async fn validate_snapshot(
    inner: &Arc<EngineInner>,
    snapshot: &MdSnapshot,
) -> Result<bool, IoError> {
    match inner.meta.read_object_md(snapshot.obj_id).await {
        Ok(md) => Ok(md.snapshot() == *snapshot),
        Err(MapError::ObjectNotFound(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Read `[start, end)` without the cache: fetch mappings, reconstruct every
/// touched part in parallel, and assemble the exact window.
pub(crate) async fn read_range_uncached(
    inner: &Arc<EngineInner>,
    obj_id: ObjId,
    start: u64,
    end: u64,
) -> Result<Bytes, IoError> {
    let mut parts = inner.meta.read_object_mappings(obj_id, start, end).await?;
    parts.sort_by_key(|p| p.part.start);

    let mut set: JoinSet<(usize, Result<Bytes, IoError>)> = JoinSet::new();
    for (i, part) in parts.iter().enumerate() {
        let inner = Arc::clone(inner);
        let chunk = part.chunk.clone();
        set.spawn(async move {
            let result = read_chunk(&inner, obj_id, chunk).await;
            (i, result)
        });
    }

    let mut chunk_data: Vec<Option<Bytes>> = vec![None; parts.len()];
    while let Some(joined) = set.join_next().await {
        let (i, result) = joined.map_err(|e| IoError::Pipeline(e.to_string()))?;
        chunk_data[i] = Some(result?);
    }

    // Assemble: concatenate the intersecting slice of each part, verifying
    // contiguous coverage of the requested window.
    let mut out = BytesMut::with_capacity((end - start) as usize);
    let mut cursor = start;
    for (part, data) in parts.iter().zip(chunk_data) {
        let data = data.ok_or_else(|| IoError::Pipeline("part read vanished".to_string()))?;
        let isect_start = part.part.start.max(start);
        let isect_end = part.part.end.min(end);
        if isect_start >= isect_end {
            continue;
        }
        if isect_start != cursor {
            return Err(IoError::RangeAssembly {
                start,
                end,
                reason: format!("unmapped bytes [{cursor}, {isect_start})"),
            });
        }
        let from = (isect_start - part.part.start + part.chunk_offset) as usize;
        let to = from + (isect_end - isect_start) as usize;
        if to > data.len() {
            return Err(IoError::RangeAssembly {
                start,
                end,
                reason: format!(
                    "part [{}, {}) needs chunk bytes [{from}, {to}) but chunk {} has {}",
                    part.part.start,
                    part.part.end,
                    part.chunk.chunk_id,
                    data.len()
                ),
            });
        }
        out.extend_from_slice(&data[from..to]);
        cursor = isect_end;
    }

    if cursor != end || out.len() as u64 != end - start {
        return Err(IoError::RangeAssembly {
            start,
            end,
            reason: format!(
                "assembled {} bytes up to offset {cursor}, expected {}",
                out.len(),
                end - start
            ),
        });
    }
    Ok(out.freeze())
}

/// Reconstruct one chunk's plaintext from its fragments.
async fn read_chunk(
    inner: &Arc<EngineInner>,
    obj_id: ObjId,
    chunk: ChunkRecord,
) -> Result<Bytes, IoError> {
    if inner.verification.load(Ordering::Relaxed) {
        return verify_chunk(inner, obj_id, chunk).await;
    }

    let k = chunk.coder.data_frags as usize;

    // First pass: data fragments only — no erasure recovery needed when
    // every one of them is readable.
    let mut set: JoinSet<Result<FragPayload, IoError>> = JoinSet::new();
    for frag in chunk.frags.iter().filter(|f| f.kind == FragKind::Data) {
        let inner = Arc::clone(inner);
        let frag = frag.clone();
        set.spawn(async move { fetch_frag(&inner, obj_id, frag).await });
    }

    let mut payloads = Vec::with_capacity(k);
    let mut all_data_readable = true;
    while let Some(joined) = set.join_next().await {
        match joined.map_err(|e| IoError::Pipeline(e.to_string()))? {
            Ok(payload) => payloads.push(payload),
            Err(e) => {
                warn!(chunk_id = %chunk.chunk_id, %e, "data fragment unreadable, retrying with parity");
                all_data_readable = false;
            }
        }
    }

    if !all_data_readable || payloads.len() < k {
        // Second pass: every fragment, then erasure-decode from any k.
        let mut set: JoinSet<Result<FragPayload, IoError>> = JoinSet::new();
        for frag in &chunk.frags {
            let inner = Arc::clone(inner);
            let frag = frag.clone();
            set.spawn(async move { fetch_frag(&inner, obj_id, frag).await });
        }
        payloads.clear();
        while let Some(joined) = set.join_next().await {
            match joined.map_err(|e| IoError::Pipeline(e.to_string()))? {
                Ok(payload) => payloads.push(payload),
                Err(e) => debug!(chunk_id = %chunk.chunk_id, %e, "fragment unreadable"),
            }
        }
        if payloads.len() < k {
            return Err(IoError::Reconstruction {
                chunk_id: chunk.chunk_id,
                needed: k,
                found: payloads.len(),
            });
        }
    }

    Ok(inner.pool.decode(chunk, payloads).await?)
}

/// Verification-mode chunk read: every replica of every fragment is read
/// and digest-checked, replicas must agree byte-for-byte, and a
/// recovery-heavy decode must match the data-fragment decode.
async fn verify_chunk(
    inner: &Arc<EngineInner>,
    obj_id: ObjId,
    chunk: ChunkRecord,
) -> Result<Bytes, IoError> {
    let k = chunk.coder.data_frags as usize;
    let mut payloads: Vec<FragPayload> = Vec::with_capacity(chunk.frags.len());

    for frag in &chunk.frags {
        let mut replicas = Vec::with_capacity(frag.blocks.len());
        for block in &frag.blocks {
            replicas.push(read_block_guarded(inner, block, true).await?);
        }
        let Some(first) = replicas.first() else {
            return Err(IoError::Reconstruction {
                chunk_id: chunk.chunk_id,
                needed: k,
                found: 0,
            });
        };
        if replicas.iter().any(|r| r != first) {
            return Err(IoError::Verification(format!(
                "replicas of fragment {:?}/{} on chunk {} diverge",
                frag.kind, frag.index, chunk.chunk_id
            )));
        }
        payloads.push(FragPayload {
            kind: frag.kind,
            index: frag.index,
            data: first.clone(),
        });
    }

    let data_set: Vec<FragPayload> = payloads
        .iter()
        .filter(|p| p.kind == FragKind::Data)
        .cloned()
        .collect();
    let primary = inner.pool.decode(chunk.clone(), data_set).await?;

    // Cross-check through the recovery path. With `parity + lrc >= k` the
    // set is parity-only (truncated to k, so every data fragment is
    // reconstructed); thinner codings cannot decode from parity alone and
    // fall back to a mixed set, which only exercises partial recovery.
    let mut recovery_set: Vec<FragPayload> = payloads
        .iter()
        .filter(|p| p.kind != FragKind::Data)
        .cloned()
        .collect();
    if recovery_set.len() >= k {
        recovery_set.truncate(k);
    } else {
        debug!(
            chunk_id = %chunk.chunk_id,
            parity = recovery_set.len(),
            needed = k,
            "not enough parity for a parity-only cross-check, mixing in data fragments"
        );
        for payload in payloads.iter().filter(|p| p.kind == FragKind::Data) {
            if recovery_set.len() >= k {
                break;
            }
            recovery_set.push(payload.clone());
        }
    }
    let recovered = inner.pool.decode(chunk.clone(), recovery_set).await?;
    if recovered != primary {
        return Err(IoError::Verification(format!(
            "recovery decode diverges from data decode on chunk {}",
            chunk.chunk_id
        )));
    }

    Ok(primary)
}

/// Fetch one fragment, trying its replica blocks in order. Each failed
/// replica is reported asynchronously; the error never masks a later
/// replica's success.
async fn fetch_frag(
    inner: &Arc<EngineInner>,
    obj_id: ObjId,
    frag: tern_types::FragRecord,
) -> Result<FragPayload, IoError> {
    for block in &frag.blocks {
        match read_block_guarded(inner, block, false).await {
            Ok(data) => {
                return Ok(FragPayload {
                    kind: frag.kind,
                    index: frag.index,
                    data,
                });
            }
            Err(e) => {
                warn!(
                    block_id = %block.block_id,
                    node_id = %block.node_id,
                    %e,
                    "block read failed, advancing to next replica"
                );
                report_block_error(
                    Arc::clone(&inner.meta),
                    ErrorReport {
                        action: ErrorAction::Read,
                        obj_id,
                        block: block.clone(),
                        rpc_code: None,
                        message: e.to_string(),
                    },
                );
            }
        }
    }
    Err(IoError::Map(MapError::Rpc(format!(
        "no readable replica for fragment {:?}/{}",
        frag.kind, frag.index
    ))))
}

/// Read one block under the global and per-agent semaphores with the
/// configured timeout, verifying the payload digest. In verification mode
/// a digest mismatch is tampering; otherwise the replica just counts as
/// unreadable and the caller falls back.
async fn read_block_guarded(
    inner: &Arc<EngineInner>,
    block: &BlockMd,
    verify: bool,
) -> Result<Bytes, IoError> {
    let injection = inner.config.error_injection_on_read;
    if injection > 0.0 && rand::random::<f64>() < injection {
        return Err(IoError::Map(MapError::Rpc(format!(
            "injected read failure for block {}",
            block.block_id
        ))));
    }

    let _global = Arc::clone(&inner.read_global)
        .acquire_owned()
        .await
        .map_err(|_| IoError::Pipeline("read semaphore closed".to_string()))?;
    let _agent = inner
        .read_agents
        .get(block.node_id)
        .acquire_owned()
        .await
        .map_err(|_| IoError::Pipeline("agent semaphore closed".to_string()))?;

    let timeout = inner.config.read_block_timeout();
    let data = tokio::time::timeout(timeout, inner.blocks.read_block(block, timeout))
        .await
        .map_err(|_| IoError::Map(MapError::Rpc(format!(
            "block read timed out after {timeout:?}: {}",
            block.block_id
        ))))??;

    if let Some(expected) = &block.digest {
        let actual = tern_codec::digest_of(block.digest_type, &data);
        if actual != *expected {
            if verify {
                return Err(IoError::Tampering {
                    block_id: block.block_id,
                    node_id: block.node_id,
                });
            }
            warn!(
                block_id = %block.block_id,
                node_id = %block.node_id,
                "block digest mismatch, treating replica as unreadable"
            );
            return Err(IoError::Map(MapError::BlockUnavailable(block.block_id)));
        }
    }

    Ok(data)
}
