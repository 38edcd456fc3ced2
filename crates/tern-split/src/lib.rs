//! Content-defined chunking for the tern upload pipeline.
//!
//! This crate provides:
//! - [`Splitter`] — a single-pass rolling-hash stream splitter that emits
//!   content-defined chunk boundaries and computes whole-stream MD5/SHA-256.
//! - The fixed Rabin fingerprint configuration (degree-39 polynomial,
//!   16-byte window) shared by every splitter instance.
//!
//! Boundaries survive insertions and deletions in the input, which is what
//! lets the metadata service deduplicate chunks across object versions.

mod rabin;
mod splitter;

pub use splitter::{Splitter, StreamDigests};
