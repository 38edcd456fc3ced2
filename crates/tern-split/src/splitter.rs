//! Single-pass content-defined stream splitter.
//!
//! A [`Splitter`] consumes a byte stream in arbitrary pushes and emits chunk
//! boundaries wherever the rolling fingerprint of the trailing window
//! matches the configured bit pattern, subject to the `min_chunk` /
//! `max_chunk` bounds. Boundaries depend only on content, so an insertion
//! or deletion shifts boundaries locally — everything outside a
//! `max_chunk`-sized neighbourhood of the edit keeps splitting identically,
//! which is what makes deduplication work across object versions.
//!
//! The splitter also folds every raw byte into whole-stream MD5 / SHA-256
//! contexts when enabled, so callers get stream digests from the same pass.

use sha2::{Digest, Sha256};
use tern_types::ChunkSplitConfig;

use crate::rabin::{self, WINDOW_LEN};

/// Finalized whole-stream digests, returned by [`Splitter::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDigests {
    /// MD5 over every byte pushed, when enabled.
    pub md5: Option<[u8; 16]>,
    /// SHA-256 over every byte pushed, when enabled.
    pub sha256: Option<[u8; 32]>,
}

/// Content-defined chunk splitter with rolling-hash boundary detection.
///
/// Boundary rule: a boundary is declared at position `p` within the current
/// chunk when `p >= min_chunk` and either the fingerprint's low
/// `avg_chunk_bits` bits are all ones, or `p == max_chunk`. On a boundary
/// the window and fingerprint reset, so boundaries are independent of each
/// other and of how the input was fragmented across [`push`] calls.
///
/// `finish` does **not** emit a trailing boundary: the residual bytes form
/// the final chunk, observed by the caller via [`pending`].
///
/// [`push`]: Splitter::push
/// [`pending`]: Splitter::pending
pub struct Splitter {
    min_chunk: usize,
    max_chunk: usize,
    avg_mask: u64,
    window: [u8; WINDOW_LEN],
    window_pos: usize,
    chunk_pos: usize,
    hash: u64,
    md5: Option<md5::Context>,
    sha256: Option<Sha256>,
}

impl Splitter {
    /// Create a splitter for one stream.
    ///
    /// # Panics
    ///
    /// Panics if `min_chunk == 0`, `min_chunk > max_chunk`, or
    /// `avg_chunk_bits` is not below the fingerprint degree (39).
    pub fn new(config: &ChunkSplitConfig) -> Self {
        assert!(config.min_chunk > 0, "min_chunk must be > 0");
        assert!(
            config.min_chunk <= config.max_chunk,
            "min_chunk {} must not exceed max_chunk {}",
            config.min_chunk,
            config.max_chunk
        );
        assert!(
            config.avg_chunk_bits < rabin::DEGREE,
            "avg_chunk_bits {} must be below the fingerprint degree {}",
            config.avg_chunk_bits,
            rabin::DEGREE
        );

        Self {
            min_chunk: config.min_chunk as usize,
            max_chunk: config.max_chunk as usize,
            avg_mask: (1u64 << config.avg_chunk_bits) - 1,
            window: [0u8; WINDOW_LEN],
            window_pos: 0,
            chunk_pos: 0,
            hash: 0,
            md5: config.calc_md5.then(md5::Context::new),
            sha256: config.calc_sha256.then(Sha256::new),
        }
    }

    /// Consume a buffer and return the lengths of the chunks completed
    /// inside it, in stream order.
    ///
    /// An empty buffer is a no-op. The stream digests cover every byte
    /// regardless of boundaries.
    pub fn push(&mut self, data: &[u8]) -> Vec<usize> {
        if let Some(ctx) = &mut self.md5 {
            ctx.consume(data);
        }
        if let Some(ctx) = &mut self.sha256 {
            ctx.update(data);
        }

        let mut points = Vec::new();
        let mut rest = data;
        while let Some(len) = self.next_boundary(&mut rest) {
            points.push(len);
        }
        points
    }

    /// Bytes accumulated since the last boundary. Non-zero after the final
    /// push means the residue is the stream's last chunk.
    pub fn pending(&self) -> usize {
        self.chunk_pos
    }

    /// Finalize the whole-stream digests. No trailing boundary is emitted.
    pub fn finish(self) -> StreamDigests {
        StreamDigests {
            md5: self.md5.map(|ctx| ctx.compute().0),
            sha256: self.sha256.map(|ctx| ctx.finalize().into()),
        }
    }

    /// Scan for the next boundary, consuming bytes from `data`.
    ///
    /// Returns the completed chunk length and resets the per-chunk state
    /// when a boundary is found; returns `None` with `data` exhausted
    /// otherwise.
    fn next_boundary(&mut self, data: &mut &[u8]) -> Option<usize> {
        // The scan is tight on CPU, so the frequently-accessed state is
        // copied into locals for the duration of the loop.
        let tables = rabin::tables();
        let bytes = *data;

        let mut window_pos = self.window_pos;
        let mut chunk_pos = self.chunk_pos;
        let mut hash = self.hash;
        let avg_mask = self.avg_mask;

        let total = chunk_pos + bytes.len();
        let min = total.min(self.min_chunk);
        let max = total.min(self.max_chunk);

        let mut idx = 0usize;

        // Bytes below the minimum can never form a boundary, so they skip
        // the fingerprint entirely.
        if chunk_pos < min {
            idx += min - chunk_pos;
            chunk_pos = min;
        }

        let mut boundary = false;
        while chunk_pos < max {
            let b = bytes[idx];
            hash = tables.update(hash, b, self.window[window_pos]);
            self.window[window_pos] = b;
            window_pos += 1;
            chunk_pos += 1;
            idx += 1;
            if window_pos == WINDOW_LEN {
                window_pos = 0;
            }
            if hash & avg_mask == avg_mask {
                boundary = true;
                break;
            }
        }

        if boundary || chunk_pos >= self.max_chunk {
            self.window = [0u8; WINDOW_LEN];
            self.window_pos = 0;
            self.hash = 0;
            self.chunk_pos = 0;
            *data = &bytes[idx..];
            Some(chunk_pos)
        } else {
            self.window_pos = window_pos;
            self.chunk_pos = chunk_pos;
            self.hash = hash;
            *data = &[];
            None
        }
    }
}
