//! Engine configuration.
//!
//! All knobs are instance-scoped: two engines in one process get independent
//! semaphores and caches, which is what lets tests run isolated engines
//! side by side.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for one [`ObjectIo`](crate::ObjectIo) instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Alignment of cached object ranges in bytes. Must be a power of two.
    pub object_range_align: u64,
    /// Parallel aligned sub-range fetches per user read request.
    pub read_range_concurrency: usize,
    /// Process-wide cap on concurrent block reads.
    pub read_concurrency_global: usize,
    /// Per-agent cap on concurrent block reads.
    pub read_concurrency_agent: usize,
    /// Byte cap of the stream admission semaphore.
    pub semaphore_cap: u64,
    /// Stream admission timeout in milliseconds.
    pub stream_semaphore_timeout_ms: u64,
    /// Upper bound on the bytes one stream reserves at admission.
    pub stream_semaphore_size_cap: u64,
    /// Bytes reserved when the stream size is unknown.
    pub stream_minimal_size_lock: u64,
    /// Per-block read timeout in milliseconds.
    pub read_block_timeout_ms: u64,
    /// Maximum bytes held by the range cache.
    pub range_cache_max_bytes: u64,
    /// Admission-queue depth below which the video tail prefetch may run.
    pub video_prefetch_load_cap: usize,
    /// Probability in `[0, 1]` of injecting a failure per block read.
    /// Testing only; zero in production.
    pub error_injection_on_read: f64,
    /// Concurrent encode/decode kernel invocations per engine.
    pub coder_concurrency: usize,
    /// Chunks per coalesced mapping batch.
    pub coalesce_max_length: usize,
    /// Milliseconds a partial batch may wait before flushing.
    pub coalesce_max_wait_ms: u64,
    /// Bytes requested per read-stream pull.
    pub read_request_size: usize,
    /// Block write timeout in milliseconds.
    pub write_block_timeout_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            object_range_align: 8 * 1024 * 1024,      // 8 MB
            read_range_concurrency: 8,
            read_concurrency_global: 256,
            read_concurrency_agent: 32,
            semaphore_cap: 256 * 1024 * 1024,         // 256 MB
            stream_semaphore_timeout_ms: 120_000,     // 2 minutes
            stream_semaphore_size_cap: 64 * 1024 * 1024, // 64 MB
            stream_minimal_size_lock: 1024 * 1024,    // 1 MB
            read_block_timeout_ms: 10_000,
            range_cache_max_bytes: 256 * 1024 * 1024, // 256 MB
            video_prefetch_load_cap: 10,
            error_injection_on_read: 0.0,
            coder_concurrency: 20,
            coalesce_max_length: 20,
            coalesce_max_wait_ms: 10,
            read_request_size: 4 * 1024 * 1024,       // 4 MB
            write_block_timeout_ms: 20_000,
        }
    }
}

impl IoConfig {
    /// Stream admission timeout.
    pub fn stream_semaphore_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_semaphore_timeout_ms)
    }

    /// Per-block read timeout.
    pub fn read_block_timeout(&self) -> Duration {
        Duration::from_millis(self.read_block_timeout_ms)
    }

    /// Per-block write timeout.
    pub fn write_block_timeout(&self) -> Duration {
        Duration::from_millis(self.write_block_timeout_ms)
    }

    /// Coalescer flush deadline.
    pub fn coalesce_max_wait(&self) -> Duration {
        Duration::from_millis(self.coalesce_max_wait_ms)
    }

    /// Bytes a stream reserves at admission, given its declared size.
    ///
    /// Unknown sizes take the minimal lock; declared sizes are clamped into
    /// `[stream_minimal_size_lock, stream_semaphore_size_cap]`.
    pub fn admission_bytes(&self, declared_size: Option<u64>) -> u64 {
        let hi = self.stream_semaphore_size_cap.min(self.semaphore_cap).max(1);
        let lo = self.stream_minimal_size_lock.clamp(1, hi);
        declared_size.unwrap_or(lo).clamp(lo, hi)
    }

    /// Validate invariants that cannot be expressed in the type.
    pub fn validate(&self) {
        assert!(
            self.object_range_align.is_power_of_two(),
            "object_range_align must be a power of two"
        );
        assert!(
            (0.0..=1.0).contains(&self.error_injection_on_read),
            "error_injection_on_read must be a probability"
        );
        assert!(self.semaphore_cap > 0, "semaphore_cap must be > 0");
    }
}
