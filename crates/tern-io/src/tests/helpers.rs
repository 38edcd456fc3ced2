//! Shared test utilities for tern-io tests.

use std::sync::Arc;

use tern_map::{InMemoryBlocks, InMemoryMeta};
use tern_types::{
    ChunkCoderConfig, ChunkSplitConfig, CipherType, Compression, DigestType, ObjId, ObjectMd,
};

use crate::{IoConfig, ObjectIo, UploadParams, UploadSource};

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0xDEAD_BEEF;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

/// Small chunks so tests exercise multi-chunk objects cheaply.
pub fn small_split() -> ChunkSplitConfig {
    ChunkSplitConfig {
        min_chunk: 1024,
        max_chunk: 16_384,
        avg_chunk_bits: 11,
        calc_md5: true,
        calc_sha256: true,
    }
}

pub fn coder(k: u8, m: u8) -> ChunkCoderConfig {
    ChunkCoderConfig {
        compress: Some(Compression::Zstd),
        cipher: Some(CipherType::Aes256Gcm),
        digest_type: DigestType::Blake3,
        data_frags: k,
        parity_frags: m,
        lrc_frags: 0,
    }
}

/// Engine config sized for tests: small alignment, short coalesce waits.
pub fn small_config() -> IoConfig {
    IoConfig {
        object_range_align: 65_536, // 64 KB
        read_range_concurrency: 4,
        semaphore_cap: 8 * 1024 * 1024,
        stream_semaphore_size_cap: 4 * 1024 * 1024,
        stream_minimal_size_lock: 4096,
        range_cache_max_bytes: 8 * 1024 * 1024,
        coalesce_max_wait_ms: 5,
        read_request_size: 128 * 1024,
        ..IoConfig::default()
    }
}

/// One isolated engine with its in-memory services.
pub struct TestEnv {
    pub engine: ObjectIo,
    pub meta: Arc<InMemoryMeta>,
    pub blocks: Arc<InMemoryBlocks>,
}

/// Engine over 3 agents, k=2/m=1, single replica.
pub fn test_env() -> TestEnv {
    env_with(
        small_config(),
        InMemoryMeta::new(3).with_split(small_split()).with_coder(coder(2, 1)),
    )
}

pub fn env_with(config: IoConfig, meta: InMemoryMeta) -> TestEnv {
    let meta = Arc::new(meta);
    let blocks = Arc::new(InMemoryBlocks::new());
    let engine = ObjectIo::new(
        config,
        Arc::clone(&meta) as Arc<dyn tern_map::MetaClient>,
        Arc::clone(&blocks) as Arc<dyn tern_map::BlockClient>,
    );
    TestEnv {
        engine,
        meta,
        blocks,
    }
}

/// Upload `data` under `bucket/key` with a declared size.
pub async fn upload_bytes(env: &TestEnv, bucket: &str, key: &str, data: &[u8]) -> ObjectMd {
    env.engine
        .upload_object(upload_params(bucket, key, data))
        .await
        .unwrap()
}

pub fn upload_params(bucket: &str, key: &str, data: &[u8]) -> UploadParams {
    UploadParams {
        bucket: bucket.to_string(),
        key: key.to_string(),
        size: Some(data.len() as u64),
        content_type: "application/octet-stream".to_string(),
        chunked_encoding: false,
        source: UploadSource::Stream(Box::new(std::io::Cursor::new(data.to_vec()))),
    }
}

/// Read the whole object back as a vec.
pub async fn read_all(env: &TestEnv, obj_id: ObjId) -> Vec<u8> {
    env.engine.read_entire_object(obj_id).await.unwrap().to_vec()
}
