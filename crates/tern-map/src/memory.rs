//! In-memory implementations of [`MetaClient`] and [`BlockClient`].
//!
//! [`InMemoryMeta`] is a single-process metadata service: it mints ids,
//! allocates blocks round-robin across a configured agent set, detects
//! duplicate chunks by content digest, and stitches multipart offsets at
//! completion. Records are stored postcard-encoded, the way the real
//! service persists them. [`InMemoryBlocks`] is the matching block store
//! with failure and tampering hooks for exercising the read path's replica
//! fallback and verification mode.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tern_types::{
    BlockId, BlockMd, ChunkCoderConfig, ChunkId, ChunkRecord, ChunkSplitConfig, FragRecord,
    MultipartId, NodeId, ObjId, ObjectMd, PartInfo, PartRecord,
};
use tracing::debug;

use crate::error::MapError;
use crate::rpc::{
    AllocateReply, AllocateRequest, BlockClient, ChunkAllocation, CompleteMultipartRequest,
    CompleteUploadRequest, CreateMultipartRequest, CreateMultipartReply, CreateUploadReply,
    CreateUploadRequest, EndpointReport, ErrorReport, FinalizeRequest, MetaClient, MultipartMd,
};

type Result<T> = std::result::Result<T, MapError>;

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| MapError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(|e| MapError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Metadata service
// ---------------------------------------------------------------------------

struct ObjectState {
    /// Postcard-encoded [`ObjectMd`].
    md: Vec<u8>,
    parts: Vec<PartRecord>,
    complete: bool,
}

struct MultipartState {
    obj_id: ObjId,
    num: u32,
    parts: Vec<PartRecord>,
    size: u64,
    num_parts: u32,
    complete: bool,
}

#[derive(Default)]
struct MetaState {
    objects: HashMap<ObjId, ObjectState>,
    /// ChunkId → postcard-encoded [`ChunkRecord`].
    chunks: HashMap<ChunkId, Vec<u8>>,
    /// Content digest → finalized chunk, the dedup index.
    dedup: HashMap<[u8; 32], ChunkId>,
    multiparts: HashMap<MultipartId, MultipartState>,
    next_id: u64,
    rr_cursor: usize,
    aborts: Vec<ObjId>,
    error_reports: Vec<ErrorReport>,
    endpoint_reports: Vec<EndpointReport>,
    mapping_reads: u64,
    md_reads: u64,
    fail_finalize: bool,
    fail_allocate: bool,
}

/// In-memory metadata service.
pub struct InMemoryMeta {
    agents: Vec<NodeId>,
    split: ChunkSplitConfig,
    coder: ChunkCoderConfig,
    replicas: usize,
    min_replicas: u32,
    check_dups: bool,
    state: Mutex<MetaState>,
}

impl InMemoryMeta {
    /// Create a service with `num_agents` block agents.
    pub fn new(num_agents: usize) -> Self {
        let agents = (0..num_agents.max(1))
            .map(|i| NodeId::from_data(format!("agent-{i}").as_bytes()))
            .collect();
        Self {
            agents,
            split: ChunkSplitConfig::default(),
            coder: ChunkCoderConfig::default(),
            replicas: 1,
            min_replicas: 1,
            check_dups: true,
            state: Mutex::new(MetaState::default()),
        }
    }

    /// Set the splitter parameters handed to uploads.
    pub fn with_split(mut self, split: ChunkSplitConfig) -> Self {
        self.split = split;
        self
    }

    /// Set the coder parameters handed to uploads.
    pub fn with_coder(mut self, coder: ChunkCoderConfig) -> Self {
        self.coder = coder;
        self
    }

    /// Set replicas allocated per fragment (and the durability floor).
    pub fn with_replicas(mut self, replicas: usize, min_replicas: u32) -> Self {
        self.replicas = replicas.max(1);
        self.min_replicas = min_replicas;
        self
    }

    /// Enable or disable duplicate detection.
    pub fn with_check_dups(mut self, check_dups: bool) -> Self {
        self.check_dups = check_dups;
        self
    }

    /// The configured agent set.
    pub fn agents(&self) -> &[NodeId] {
        &self.agents
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetaState> {
        self.state.lock().expect("meta state lock poisoned")
    }

    fn mint(state: &mut MetaState, domain: &str) -> [u8; 32] {
        state.next_id += 1;
        blake3::hash(format!("{domain}-{}", state.next_id).as_bytes()).into()
    }

    // --- test/diagnostic hooks -------------------------------------------

    /// Simulate an overwrite: bump the object's etag and creation time so
    /// cached range snapshots stop validating.
    pub fn touch_object(&self, obj_id: ObjId) -> Result<()> {
        let mut state = self.lock();
        let obj = state
            .objects
            .get_mut(&obj_id)
            .ok_or(MapError::ObjectNotFound(obj_id))?;
        let mut md: ObjectMd = decode(&obj.md)?;
        md.etag = format!("{}*", md.etag);
        md.create_time += 1;
        obj.md = encode(&md)?;
        Ok(())
    }

    /// Whether an abort was received for the object.
    pub fn was_aborted(&self, obj_id: ObjId) -> bool {
        self.lock().aborts.contains(&obj_id)
    }

    /// All aborted object ids, in arrival order.
    pub fn aborts(&self) -> Vec<ObjId> {
        self.lock().aborts.clone()
    }

    /// Block error reports received so far.
    pub fn error_reports(&self) -> Vec<ErrorReport> {
        self.lock().error_reports.clone()
    }

    /// Endpoint problem reports received so far.
    pub fn endpoint_reports(&self) -> Vec<EndpointReport> {
        self.lock().endpoint_reports.clone()
    }

    /// Number of `read_object_mappings` calls served.
    pub fn mapping_read_count(&self) -> u64 {
        self.lock().mapping_reads
    }

    /// Number of `read_object_md` calls served.
    pub fn md_read_count(&self) -> u64 {
        self.lock().md_reads
    }

    /// Make the next finalize calls fail, for abort-path tests.
    pub fn set_fail_finalize(&self, fail: bool) {
        self.lock().fail_finalize = fail;
    }

    /// Make the next allocate calls fail.
    pub fn set_fail_allocate(&self, fail: bool) {
        self.lock().fail_allocate = fail;
    }
}

#[async_trait]
impl MetaClient for InMemoryMeta {
    async fn create_object_upload(&self, req: CreateUploadRequest) -> Result<CreateUploadReply> {
        let mut state = self.lock();
        let obj_id = ObjId::from(Self::mint(&mut state, "obj"));
        let md = ObjectMd {
            obj_id,
            bucket: req.bucket,
            key: req.key,
            size: req.size.unwrap_or(0),
            content_type: req.content_type,
            etag: String::new(),
            create_time: 0,
            md5: None,
            sha256: None,
            num_parts: 0,
        };
        state.objects.insert(
            obj_id,
            ObjectState {
                md: encode(&md)?,
                parts: Vec::new(),
                complete: false,
            },
        );
        debug!(%obj_id, "created object upload");
        Ok(CreateUploadReply {
            obj_id,
            tier_id: Some("default".to_string()),
            split: self.split,
            coder: self.coder,
            check_dups: self.check_dups,
        })
    }

    async fn create_multipart(&self, req: CreateMultipartRequest) -> Result<CreateMultipartReply> {
        let mut state = self.lock();
        if !state.objects.contains_key(&req.obj_id) {
            return Err(MapError::ObjectNotFound(req.obj_id));
        }
        let multipart_id = MultipartId::from(Self::mint(&mut state, "multipart"));
        state.multiparts.insert(
            multipart_id,
            MultipartState {
                obj_id: req.obj_id,
                num: req.num,
                parts: Vec::new(),
                size: 0,
                num_parts: 0,
                complete: false,
            },
        );
        Ok(CreateMultipartReply {
            multipart_id,
            split: self.split,
            coder: self.coder,
            check_dups: self.check_dups,
        })
    }

    async fn complete_object_upload(&self, req: CompleteUploadRequest) -> Result<ObjectMd> {
        let mut state = self.lock();

        // Collect completed multiparts of this object, ordered by part number,
        // and rewrite their relative offsets into absolute object offsets.
        let mut multipart_ids: Vec<MultipartId> = state
            .multiparts
            .iter()
            .filter(|(_, mp)| mp.obj_id == req.obj_id && mp.complete)
            .map(|(id, _)| *id)
            .collect();
        multipart_ids.sort_by_key(|id| state.multiparts[id].num);

        let mut stitched: Vec<PartRecord> = Vec::new();
        let mut offset = 0u64;
        for id in &multipart_ids {
            let mp = &state.multiparts[id];
            let mut parts = mp.parts.clone();
            parts.sort_by_key(|p| p.start);
            for mut part in parts {
                part.start += offset;
                part.end += offset;
                stitched.push(part);
            }
            offset += mp.size;
        }

        let obj = state
            .objects
            .get_mut(&req.obj_id)
            .ok_or(MapError::ObjectNotFound(req.obj_id))?;
        if !stitched.is_empty() {
            obj.parts = stitched;
        } else {
            obj.parts.sort_by_key(|p| p.start);
        }

        let mut md: ObjectMd = decode(&obj.md)?;
        md.size = req.size;
        md.num_parts = req.num_parts;
        md.md5 = req.md5;
        md.sha256 = req.sha256;
        md.etag = req.etag;
        md.create_time = now_secs();
        obj.md = encode(&md)?;
        obj.complete = true;

        debug!(obj_id = %req.obj_id, size = md.size, parts = md.num_parts, "object completed");
        Ok(md)
    }

    async fn complete_multipart(&self, req: CompleteMultipartRequest) -> Result<MultipartMd> {
        let mut state = self.lock();
        let mp = state
            .multiparts
            .get_mut(&req.multipart_id)
            .ok_or(MapError::MultipartNotFound(req.multipart_id))?;
        if mp.obj_id != req.obj_id {
            return Err(MapError::Protocol(
                "multipart does not belong to this object".to_string(),
            ));
        }
        mp.size = req.size;
        mp.num_parts = req.num_parts;
        mp.complete = true;
        Ok(MultipartMd {
            multipart_id: req.multipart_id,
            obj_id: req.obj_id,
            num: mp.num,
            size: mp.size,
            num_parts: mp.num_parts,
        })
    }

    async fn abort_object_upload(&self, obj_id: ObjId) -> Result<()> {
        let mut state = self.lock();
        state.aborts.push(obj_id);
        let incomplete = state.objects.get(&obj_id).is_some_and(|o| !o.complete);
        if incomplete {
            state.objects.remove(&obj_id);
        }
        Ok(())
    }

    async fn allocate_object_parts(&self, req: AllocateRequest) -> Result<AllocateReply> {
        let mut state = self.lock();
        if state.fail_allocate {
            return Err(MapError::Rpc("allocation unavailable".to_string()));
        }
        if req.chunks.len() != req.parts.len() {
            return Err(MapError::Protocol(
                "chunks and parts must be parallel".to_string(),
            ));
        }

        let mut allocations = Vec::with_capacity(req.chunks.len());
        // Duplicates within one request resolve against each other too.
        let mut in_request: HashMap<[u8; 32], ChunkId> = HashMap::new();
        for chunk in &req.chunks {
            if req.check_dups && self.check_dups {
                if let Some(&chunk_id) = state.dedup.get(&chunk.digest) {
                    allocations.push(ChunkAllocation::Dup { chunk_id });
                    continue;
                }
                if let Some(&chunk_id) = in_request.get(&chunk.digest) {
                    allocations.push(ChunkAllocation::Dup { chunk_id });
                    continue;
                }
            }

            let chunk_id = ChunkId::from(Self::mint(&mut state, "chunk"));
            let mut frag_records = Vec::with_capacity(chunk.frags.len());
            let mut frag_blocks = Vec::with_capacity(chunk.frags.len());
            for frag in &chunk.frags {
                let mut replicas = Vec::with_capacity(self.replicas);
                for _ in 0..self.replicas {
                    let node_id = self.agents[state.rr_cursor % self.agents.len()];
                    state.rr_cursor += 1;
                    replicas.push(BlockMd {
                        block_id: BlockId::from(Self::mint(&mut state, "block")),
                        node_id,
                        address: format!("mem://{node_id}"),
                        digest_type: chunk.coder.digest_type,
                        digest: frag.digest,
                    });
                }
                frag_records.push(FragRecord {
                    kind: frag.kind,
                    index: frag.index,
                    digest: frag.digest,
                    blocks: replicas.clone(),
                });
                frag_blocks.push(replicas);
            }

            let record = ChunkRecord {
                chunk_id,
                digest: chunk.digest,
                size: chunk.size,
                compressed_size: chunk.compressed_size,
                cipher_key: chunk.cipher_key.clone(),
                cipher_iv: chunk.cipher_iv.clone(),
                coder: chunk.coder,
                frags: frag_records,
            };
            state.chunks.insert(chunk_id, encode(&record)?);
            in_request.insert(chunk.digest, chunk_id);
            allocations.push(ChunkAllocation::Write {
                chunk_id,
                min_replicas: self.min_replicas,
                frag_blocks,
            });
        }

        Ok(AllocateReply { allocations })
    }

    async fn finalize_object_parts(&self, req: FinalizeRequest) -> Result<()> {
        let mut state = self.lock();
        if state.fail_finalize {
            return Err(MapError::Rpc("finalize unavailable".to_string()));
        }

        // Keep only the blocks the uploader reports as written, and admit
        // the now-durable chunks into the dedup index.
        for finalized in &req.chunks {
            let Some(bytes) = state.chunks.get(&finalized.chunk_id) else {
                return Err(MapError::Protocol(format!(
                    "finalize references unknown chunk {}",
                    finalized.chunk_id
                )));
            };
            let mut record: ChunkRecord = decode(bytes)?;
            let written: HashSet<BlockId> = finalized.written_blocks.iter().copied().collect();
            for frag in &mut record.frags {
                frag.blocks.retain(|b| written.contains(&b.block_id));
            }
            let digest = record.digest;
            state.chunks.insert(finalized.chunk_id, encode(&record)?);
            state.dedup.insert(digest, finalized.chunk_id);
        }

        match req.multipart_id {
            Some(multipart_id) => {
                let mp = state
                    .multiparts
                    .get_mut(&multipart_id)
                    .ok_or(MapError::MultipartNotFound(multipart_id))?;
                mp.parts.extend(req.parts);
            }
            None => {
                let obj = state
                    .objects
                    .get_mut(&req.obj_id)
                    .ok_or(MapError::ObjectNotFound(req.obj_id))?;
                obj.parts.extend(req.parts);
            }
        }
        Ok(())
    }

    async fn read_object_mappings(
        &self,
        obj_id: ObjId,
        start: u64,
        end: u64,
    ) -> Result<Vec<PartInfo>> {
        let mut state = self.lock();
        state.mapping_reads += 1;
        let obj = state
            .objects
            .get(&obj_id)
            .filter(|o| o.complete)
            .ok_or(MapError::ObjectNotFound(obj_id))?;

        let mut infos = Vec::new();
        for part in &obj.parts {
            if part.start < end && part.end > start {
                let bytes = state
                    .chunks
                    .get(&part.chunk_id)
                    .ok_or_else(|| MapError::Protocol(format!("missing chunk {}", part.chunk_id)))?;
                infos.push(PartInfo {
                    part: part.clone(),
                    chunk: decode(bytes)?,
                    chunk_offset: 0,
                });
            }
        }
        Ok(infos)
    }

    async fn read_object_md(&self, obj_id: ObjId) -> Result<ObjectMd> {
        let mut state = self.lock();
        state.md_reads += 1;
        let obj = state
            .objects
            .get(&obj_id)
            .filter(|o| o.complete)
            .ok_or(MapError::ObjectNotFound(obj_id))?;
        decode(&obj.md)
    }

    async fn report_error_on_object(&self, report: ErrorReport) -> Result<()> {
        self.lock().error_reports.push(report);
        Ok(())
    }

    async fn report_endpoint_problems(&self, report: EndpointReport) -> Result<()> {
        self.lock().endpoint_reports.push(report);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Block store
// ---------------------------------------------------------------------------

/// In-memory block store with failure and tampering hooks.
#[derive(Default)]
pub struct InMemoryBlocks {
    blocks: RwLock<HashMap<BlockId, Bytes>>,
    fail_reads: RwLock<HashSet<BlockId>>,
    fail_writes: RwLock<HashSet<BlockId>>,
    fail_nodes: RwLock<HashSet<NodeId>>,
    /// Artificial latency applied to reads, for timeout tests.
    read_delay: RwLock<Option<Duration>>,
}

impl InMemoryBlocks {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks stored.
    pub fn block_count(&self) -> usize {
        self.blocks.read().expect("blocks lock poisoned").len()
    }

    /// Flip one byte of a stored block.
    pub fn tamper_block(&self, id: BlockId) {
        let mut blocks = self.blocks.write().expect("blocks lock poisoned");
        if let Some(data) = blocks.get(&id) {
            let mut corrupted = data.to_vec();
            corrupted[0] ^= 0xFF;
            blocks.insert(id, Bytes::from(corrupted));
        }
    }

    /// Make reads of this block fail.
    pub fn fail_read(&self, id: BlockId) {
        self.fail_reads
            .write()
            .expect("fail_reads lock poisoned")
            .insert(id);
    }

    /// Make writes of this block fail.
    pub fn fail_write(&self, id: BlockId) {
        self.fail_writes
            .write()
            .expect("fail_writes lock poisoned")
            .insert(id);
    }

    /// Make every operation against this agent fail.
    pub fn fail_node(&self, node: NodeId) {
        self.fail_nodes
            .write()
            .expect("fail_nodes lock poisoned")
            .insert(node);
    }

    /// Delay every read by `delay`, for block-timeout tests.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.write().expect("read_delay lock poisoned") = delay;
    }
}

#[async_trait]
impl BlockClient for InMemoryBlocks {
    async fn read_block(&self, block: &BlockMd, _timeout: Duration) -> Result<Bytes> {
        let delay = *self.read_delay.read().expect("read_delay lock poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_nodes
            .read()
            .expect("fail_nodes lock poisoned")
            .contains(&block.node_id)
            || self
                .fail_reads
                .read()
                .expect("fail_reads lock poisoned")
                .contains(&block.block_id)
        {
            return Err(MapError::BlockUnavailable(block.block_id));
        }
        self.blocks
            .read()
            .expect("blocks lock poisoned")
            .get(&block.block_id)
            .cloned()
            .ok_or(MapError::BlockUnavailable(block.block_id))
    }

    async fn write_block(&self, block: &BlockMd, data: Bytes, _timeout: Duration) -> Result<()> {
        if self
            .fail_nodes
            .read()
            .expect("fail_nodes lock poisoned")
            .contains(&block.node_id)
            || self
                .fail_writes
                .read()
                .expect("fail_writes lock poisoned")
                .contains(&block.block_id)
        {
            return Err(MapError::BlockUnavailable(block.block_id));
        }
        self.blocks
            .write()
            .expect("blocks lock poisoned")
            .insert(block.block_id, data);
        Ok(())
    }
}
