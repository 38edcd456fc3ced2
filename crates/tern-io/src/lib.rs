//! The tern object I/O engine.
//!
//! Client-side data plane of a distributed object store: byte streams in,
//! content-defined, erasure-coded, deduplicated, integrity-protected
//! chunks out across many storage agents — and the reverse, with bounded
//! memory and concurrency throughout.
//!
//! The engine owns no policy. Allocation, placement, dedup decisions, and
//! durability all live in the metadata service reached through
//! [`tern_map::MetaClient`]; block agents are reached through
//! [`tern_map::BlockClient`]. See [`ObjectIo`] for the API surface:
//!
//! - [`ObjectIo::upload_object`] / [`ObjectIo::upload_multipart`]
//! - [`ObjectIo::read_object_stream`] / [`ObjectIo::read_entire_object`]
//! - [`ObjectIo::set_verification_mode`] for replica/digest auditing reads

mod cache;
mod chunked;
mod coalesce;
mod config;
mod engine;
mod error;
mod read;
mod semaphore;
mod upload;

pub use config::IoConfig;
pub use engine::ObjectIo;
pub use error::IoError;
pub use read::{ObjectReadStream, ReadParams};
pub use upload::{CopySource, MultipartParams, UploadParams, UploadSource};

#[cfg(test)]
mod tests;
