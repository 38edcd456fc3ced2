//! Metadata-service and block-store clients for tern.
//!
//! The I/O engine never makes allocation or placement decisions itself; it
//! talks to the metadata service and block agents through the [`MetaClient`]
//! and [`BlockClient`] traits and executes what they return. This crate
//! provides:
//!
//! - The trait definitions and their request/reply types ([`rpc`]).
//! - [`MapClient`] — the per-batch ALLOCATE → WRITE → FINALIZE state machine
//!   driving one coalesced batch of encoded chunks to durability.
//! - [`InMemoryMeta`] / [`InMemoryBlocks`] — single-process implementations
//!   used by tests and embedded deployments.

mod client;
mod error;
pub mod memory;
pub mod rpc;

pub use client::{BatchOutcome, ChunkUpload, MapClient, report_block_error};
pub use error::MapError;
pub use memory::{InMemoryBlocks, InMemoryMeta};
pub use rpc::{BlockClient, MetaClient};
