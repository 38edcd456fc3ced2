//! The chunk encode/decode kernel for tern.
//!
//! Consumed by the I/O engine through a narrow contract:
//!
//! - [`encode_chunk`] — plaintext in, ordered fragments out (content digest,
//!   optional zstd compression, optional AES-256-GCM, Reed-Solomon
//!   data + parity, per-fragment digests).
//! - [`decode_chunk`] — any `data_frags` fragments in, verified plaintext
//!   out, skipping Reed-Solomon recovery when every data fragment is present.
//! - [`CoderPool`] — semaphore-bounded `spawn_blocking` dispatch, so the
//!   CPU-heavy kernel never runs on the async scheduler.
//!
//! Local-reconstruction fragments are part of the data model but not of
//! this kernel; configurations requesting them are rejected.

mod decoder;
mod digest;
mod encoder;
mod error;
mod pool;

pub use decoder::{FragPayload, decode_chunk};
pub use digest::digest_of;
pub use encoder::{EncodedChunk, EncodedFrag, encode_chunk};
pub use error::CodecError;
pub use pool::CoderPool;
