//! # Bale Core
//!
//! Shared leaf types for the bale content-addressed artifact store.
//!
//! This crate provides:
//! - [`ContentHash`]: the fixed-width digest used as node identity and address
//! - LEB128 varint and length-prefixed wire helpers
//! - The collaborator [`BlobStore`] seam (blob + named-ref primitives)
//! - [`NodeLocator`] / [`RootPointer`]: where a persisted node lives
//!
//! ## Design Principles
//!
//! 1. **Opaque collaborators**: the backing store is a trait; this layer never
//!    assumes a transport, a path layout, or an auth model.
//! 2. **Async at the I/O seam only**: hashing and codecs are synchronous.
//! 3. **Fail fast on corruption**: decode helpers validate counts against the
//!    remaining buffer so corrupt data errors instead of allocating.

pub mod error;
pub mod hash;
pub mod storage;
pub mod varint;

pub use error::{Error, Result};
pub use hash::{ContentHash, HASH_SIZE};
pub use storage::{BlobId, BlobStore, MemoryBlobStore, NodeLocator, RootPointer};
