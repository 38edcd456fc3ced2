//! [`ObjectIo`] — the engine instance owning all I/O subsystems.
//!
//! One engine holds the coder pool, the stream admission gate, the read
//! semaphores, and the range cache. All of them are instance-scoped:
//! separate engines (e.g. in tests) share nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use tern_codec::CoderPool;
use tern_map::rpc::{
    BlockClient, CompleteMultipartRequest, CompleteUploadRequest, CreateMultipartRequest,
    CreateUploadRequest, EndpointReport, FinalizeRequest, MetaClient, MultipartMd,
};
use tern_types::{ObjId, ObjectMd, PartRecord};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::RangeCache;
use crate::config::IoConfig;
use crate::error::IoError;
use crate::read::{ObjectReadStream, ReadParams, open_stream};
use crate::semaphore::{ByteGate, BytePermit, KeyedSemaphores};
use crate::upload::{
    ByteSource, CopySource, MultipartParams, UploadOutcome, UploadParams, UploadSource,
    run_pipeline,
};

/// Shared state behind one engine instance.
pub(crate) struct EngineInner {
    pub(crate) config: IoConfig,
    pub(crate) meta: Arc<dyn MetaClient>,
    pub(crate) blocks: Arc<dyn BlockClient>,
    pub(crate) pool: CoderPool,
    pub(crate) stream_gate: ByteGate,
    pub(crate) read_global: Arc<Semaphore>,
    pub(crate) read_agents: KeyedSemaphores,
    pub(crate) cache: RangeCache,
    pub(crate) verification: AtomicBool,
}

/// The client-side object I/O engine.
///
/// Turns caller byte streams into content-defined, erasure-coded,
/// deduplicated chunks persisted across storage agents — and back.
/// Cheap to clone; clones share the same governors and cache.
#[derive(Clone)]
pub struct ObjectIo {
    inner: Arc<EngineInner>,
}

impl ObjectIo {
    /// Create an engine against a metadata service and block store.
    pub fn new(config: IoConfig, meta: Arc<dyn MetaClient>, blocks: Arc<dyn BlockClient>) -> Self {
        config.validate();
        let inner = EngineInner {
            pool: CoderPool::new(config.coder_concurrency),
            stream_gate: ByteGate::new(config.semaphore_cap, config.stream_semaphore_timeout()),
            read_global: Arc::new(Semaphore::new(config.read_concurrency_global.max(1))),
            read_agents: KeyedSemaphores::new(config.read_concurrency_agent),
            cache: RangeCache::new(config.range_cache_max_bytes),
            verification: AtomicBool::new(false),
            config,
            meta,
            blocks,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Enable verification mode: reads check every replica and digest.
    pub fn set_verification_mode(&self) {
        self.inner.verification.store(true, Ordering::Relaxed);
    }

    /// Disable verification mode.
    pub fn clear_verification_mode(&self) {
        self.inner.verification.store(false, Ordering::Relaxed);
    }

    /// Bytes currently available on the stream admission gate. Diagnostic.
    pub fn admission_available(&self) -> u64 {
        self.inner.stream_gate.available()
    }

    /// Entries currently held by the range cache. Diagnostic.
    pub fn cached_ranges(&self) -> usize {
        self.inner.cache.len()
    }

    // ------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------

    /// Upload one object and return its committed metadata.
    ///
    /// Streams the source through the split → encode → coalesce → map
    /// pipeline. A same-bucket, rangeless copy source bypasses the
    /// pipeline entirely and re-finalizes the source's chunk map. On any
    /// failure after creation the upload is aborted (best-effort) and the
    /// original error re-raised.
    pub async fn upload_object(&self, params: UploadParams) -> Result<ObjectMd, IoError> {
        let inner = &self.inner;

        if let UploadSource::Copy(copy) = &params.source
            && copy.bucket == params.bucket
            && copy.range.is_none()
        {
            let copy = copy.clone();
            return self.copy_object(params, copy).await;
        }

        let declared = params.size;
        let reply = inner
            .meta
            .create_object_upload(CreateUploadRequest {
                bucket: params.bucket,
                key: params.key,
                size: params.size,
                content_type: params.content_type,
            })
            .await?;
        info!(obj_id = %reply.obj_id, tier = ?reply.tier_id, "object upload created");

        let staged: Result<ObjectMd, IoError> = async {
            let _permit = self.admit(declared).await?;
            let source = self
                .resolve_source(params.source, params.chunked_encoding)
                .await?;
            let outcome = run_pipeline(
                inner,
                reply.obj_id,
                None,
                reply.split,
                reply.coder,
                reply.check_dups,
                source,
            )
            .await?;
            self.complete_object(reply.obj_id, &outcome).await
        }
        .await;

        match staged {
            Ok(md) => Ok(md),
            Err(e) => {
                // Best-effort abort; the original error always surfaces.
                if let Err(abort_err) = inner.meta.abort_object_upload(reply.obj_id).await {
                    debug!(obj_id = %reply.obj_id, %abort_err, "abort failed");
                }
                Err(e)
            }
        }
    }

    /// Upload one multipart stream under an existing object.
    ///
    /// The pipeline runs with offsets relative to zero; the metadata
    /// service rewrites them into absolute object offsets when the object
    /// completes. On any failure after creation the owning object upload
    /// is aborted (best-effort) and the original error re-raised.
    pub async fn upload_multipart(&self, params: MultipartParams) -> Result<MultipartMd, IoError> {
        let inner = &self.inner;
        let obj_id = params.obj_id;
        let reply = inner
            .meta
            .create_multipart(CreateMultipartRequest {
                obj_id,
                num: params.num,
            })
            .await?;

        let staged: Result<MultipartMd, IoError> = async {
            let _permit = self.admit(params.size).await?;
            let outcome = run_pipeline(
                inner,
                obj_id,
                Some(reply.multipart_id),
                reply.split,
                reply.coder,
                reply.check_dups,
                ByteSource::Reader(params.source),
            )
            .await?;
            Ok(inner
                .meta
                .complete_multipart(CompleteMultipartRequest {
                    obj_id,
                    multipart_id: reply.multipart_id,
                    size: outcome.size,
                    num_parts: outcome.num_parts,
                    md5: outcome.digests.md5,
                })
                .await?)
        }
        .await;

        match staged {
            Ok(md) => Ok(md),
            Err(e) => {
                // Best-effort abort of the owning upload; the original
                // error always surfaces.
                if let Err(abort_err) = inner.meta.abort_object_upload(obj_id).await {
                    debug!(%obj_id, %abort_err, "abort failed");
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Open a pull stream over an object range.
    pub async fn read_object_stream(
        &self,
        params: ReadParams,
    ) -> Result<ObjectReadStream, IoError> {
        open_stream(Arc::clone(&self.inner), params).await
    }

    /// Read a whole object into one buffer. Intended for tests and small
    /// objects; large reads should use [`read_object_stream`](Self::read_object_stream).
    pub async fn read_entire_object(&self, obj_id: ObjId) -> Result<Bytes, IoError> {
        let mut stream = self.read_object_stream(ReadParams::whole(obj_id)).await?;
        let mut out = BytesMut::new();
        while let Some(buf) = stream.next().await {
            out.extend_from_slice(&buf?);
        }
        Ok(out.freeze())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Acquire the stream admission lock sized from the declared size,
    /// reporting endpoint stress on timeout.
    async fn admit(&self, declared_size: Option<u64>) -> Result<BytePermit, IoError> {
        let bytes = self.inner.config.admission_bytes(declared_size);
        match self.inner.stream_gate.acquire(bytes).await {
            Ok(permit) => Ok(permit),
            Err(e) => {
                if matches!(e, IoError::StreamItemTimeout(_)) {
                    report_stream_stress(&self.inner);
                }
                Err(e)
            }
        }
    }

    /// Turn an upload source into pipeline input. Chunked-transfer sources
    /// get their envelope stripped; copy sources that could not take the
    /// zero-byte path are streamed through a read stream.
    async fn resolve_source(
        &self,
        source: UploadSource,
        chunked_encoding: bool,
    ) -> Result<ByteSource, IoError> {
        match source {
            UploadSource::Stream(reader) if chunked_encoding => Ok(ByteSource::chunked(reader)),
            UploadSource::Stream(reader) => Ok(ByteSource::Reader(reader)),
            UploadSource::Copy(copy) => {
                let (start, end) = match copy.range {
                    Some((start, end)) => (start, Some(end)),
                    None => (0, None),
                };
                let stream = self
                    .read_object_stream(ReadParams {
                        obj_id: copy.obj_id,
                        start,
                        end,
                        request_size: None,
                    })
                    .await?;
                Ok(ByteSource::Object(stream))
            }
        }
    }

    async fn complete_object(
        &self,
        obj_id: ObjId,
        outcome: &UploadOutcome,
    ) -> Result<ObjectMd, IoError> {
        let etag = outcome.digests.md5.map(hex).unwrap_or_default();
        Ok(self
            .inner
            .meta
            .complete_object_upload(CompleteUploadRequest {
                obj_id,
                size: outcome.size,
                num_parts: outcome.num_parts,
                md5: outcome.digests.md5,
                sha256: outcome.digests.sha256,
                etag,
            })
            .await?)
    }

    /// Zero-byte copy: re-finalize the source's chunk map under a new
    /// object id. No chunk data moves.
    async fn copy_object(
        &self,
        params: UploadParams,
        copy: CopySource,
    ) -> Result<ObjectMd, IoError> {
        let inner = &self.inner;
        let src_md = inner.meta.read_object_md(copy.obj_id).await?;
        let reply = inner
            .meta
            .create_object_upload(CreateUploadRequest {
                bucket: params.bucket,
                key: params.key,
                size: Some(src_md.size),
                content_type: params.content_type,
            })
            .await?;
        info!(src = %copy.obj_id, dst = %reply.obj_id, "zero-byte copy");

        let staged: Result<ObjectMd, IoError> = async {
            let mappings = inner
                .meta
                .read_object_mappings(copy.obj_id, 0, src_md.size)
                .await?;
            let parts: Vec<PartRecord> = mappings
                .iter()
                .map(|info| PartRecord {
                    obj_id: reply.obj_id,
                    multipart_id: None,
                    seq: info.part.seq,
                    start: info.part.start,
                    end: info.part.end,
                    chunk_id: info.part.chunk_id,
                })
                .collect();
            let num_parts = parts.len() as u32;
            inner
                .meta
                .finalize_object_parts(FinalizeRequest {
                    obj_id: reply.obj_id,
                    multipart_id: None,
                    parts,
                    chunks: Vec::new(),
                })
                .await?;
            Ok(inner
                .meta
                .complete_object_upload(CompleteUploadRequest {
                    obj_id: reply.obj_id,
                    size: src_md.size,
                    num_parts,
                    md5: src_md.md5,
                    sha256: src_md.sha256,
                    etag: src_md.etag.clone(),
                })
                .await?)
        }
        .await;

        match staged {
            Ok(md) => Ok(md),
            Err(e) => {
                if let Err(abort_err) = inner.meta.abort_object_upload(reply.obj_id).await {
                    debug!(obj_id = %reply.obj_id, %abort_err, "abort failed");
                }
                Err(e)
            }
        }
    }
}

/// Send an endpoint stress report, at most once per hour per gate.
/// Reporting failures never surface.
pub(crate) fn report_stream_stress(inner: &Arc<EngineInner>) {
    if !inner.stream_gate.should_report_stress() {
        return;
    }
    let meta = Arc::clone(&inner.meta);
    let report = EndpointReport {
        problem: "stream_semaphore_stress".to_string(),
        detail: format!(
            "waiting={} available={} cap={}",
            inner.stream_gate.waiting(),
            inner.stream_gate.available(),
            inner.stream_gate.cap()
        ),
    };
    tokio::spawn(async move {
        if let Err(e) = meta.report_endpoint_problems(report).await {
            warn!(%e, "endpoint stress report failed");
        }
    });
}

/// Lowercase hex of an MD5 digest.
fn hex(digest: [u8; 16]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(32);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
