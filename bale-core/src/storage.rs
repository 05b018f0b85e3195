//! Collaborator storage interface.
//!
//! The engine persists everything through a minimal blob/ref seam that apps
//! implement against their actual backend (filesystem, S3, a service). Two
//! primitives:
//!
//! - immutable blobs, written once and addressed by an opaque [`BlobId`]
//!   chosen by the backend;
//! - named mutable refs, small byte values advanced to publish a new root.
//!
//! `write_blob` and `write_ref` receive the ids of the blobs the new value
//! references so backends that track liveness (garbage collection, replication
//! fencing) can record the edges; backends that don't care may ignore them.
//!
//! [`MemoryBlobStore`] is the in-memory implementation used throughout the
//! test suites.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::varint;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque identifier of a stored blob, assigned by the backend.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(Arc<str>);

impl BlobId {
    /// Wrap a backend-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into()))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

impl From<&str> for BlobId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Location of a persisted node: the bundle blob that exports it and the
/// node's index in that bundle's export table.
///
/// `export_count` is the source bundle's total export count; it travels with
/// the locator so import tables can be written without re-reading the source
/// bundle.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NodeLocator {
    /// Blob containing the bundle that exports this node.
    pub blob: BlobId,
    /// Index into the bundle's export table.
    pub export_index: u32,
    /// Total number of exports in the source bundle.
    pub export_count: u32,
}

impl NodeLocator {
    /// Encode as `[varint blob-id len][blob-id][varint index][varint count]`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        varint::encode_bytes(self.blob.as_str().as_bytes(), buf);
        varint::encode_varint(self.export_index as u64, buf);
        varint::encode_varint(self.export_count as u64, buf);
    }

    /// Decode from `buf` starting at `*pos`.
    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let id = varint::decode_bytes(buf, pos)?;
        let id = std::str::from_utf8(id)
            .map_err(|e| Error::decode(format!("blob id is not valid UTF-8: {e}")))?;
        let export_index = varint::decode_varint(buf, pos)? as u32;
        let export_count = varint::decode_varint(buf, pos)? as u32;
        Ok(Self {
            blob: BlobId::new(id),
            export_index,
            export_count,
        })
    }
}

/// Blob and ref primitives implemented by the embedding application.
///
/// All methods are transport-level: errors are propagated unchanged to the
/// engine's callers, and the engine performs no implicit retry.
#[async_trait]
pub trait BlobStore: Debug + Send + Sync {
    /// Read a blob's full contents.
    ///
    /// Returns [`Error::NotFound`] if the blob does not exist.
    async fn read_blob(&self, id: &BlobId) -> Result<Vec<u8>>;

    /// Write a new immutable blob, returning its backend-assigned id.
    ///
    /// `imports` lists the blobs the new blob references.
    async fn write_blob(&self, data: &[u8], imports: &[BlobId]) -> Result<BlobId>;

    /// Read the value of a named mutable ref.
    ///
    /// Returns [`Error::NotFound`] if the ref does not exist.
    async fn read_ref(&self, name: &str) -> Result<Vec<u8>>;

    /// Set the value of a named mutable ref.
    ///
    /// `imports` lists the blobs the new value references.
    async fn write_ref(&self, name: &str, value: &[u8], imports: &[BlobId]) -> Result<()>;

    /// Check whether a named ref exists.
    async fn has_ref(&self, name: &str) -> Result<bool>;

    /// Delete a named ref. Deleting a missing ref succeeds.
    async fn delete_ref(&self, name: &str) -> Result<()>;
}

/// Encoded value of a root ref: the root node's hash plus its locator.
///
/// This is what `commit` writes through [`BlobStore::write_ref`] and what
/// `load_root` parses back.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RootPointer {
    /// Content hash of the root node.
    pub hash: ContentHash,
    /// Where the root node is exported.
    pub locator: NodeLocator,
    /// Logical length of the tree the root addresses, snapshotted at commit.
    pub length: u64,
}

impl RootPointer {
    /// Serialize to the ref-value wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(self.hash.as_bytes());
        self.locator.encode(&mut buf);
        varint::encode_varint(self.length, &mut buf);
        buf
    }

    /// Parse from a ref value.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        use crate::hash::HASH_SIZE;
        if bytes.len() < HASH_SIZE {
            return Err(Error::decode("root pointer too short"));
        }
        let hash = ContentHash::try_from_slice(&bytes[..HASH_SIZE])?;
        let mut pos = HASH_SIZE;
        let locator = NodeLocator::decode(bytes, &mut pos)?;
        let length = varint::decode_varint(bytes, &mut pos)?;
        Ok(Self { hash, locator, length })
    }
}

// ============================================================================
// MemoryBlobStore
// ============================================================================

/// In-memory blob store for tests.
///
/// Stores blobs and refs in `HashMap`s behind `parking_lot::RwLock` so it can
/// be shared across tasks. Counts collaborator reads so concurrency tests can
/// assert single-flight behavior directly.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<BlobId, Arc<Vec<u8>>>>>,
    refs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    next_id: Arc<AtomicU64>,
    read_count: Arc<AtomicU64>,
}

impl MemoryBlobStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `read_blob` calls made so far.
    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Number of blobs written.
    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }
}

impl Debug for MemoryBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlobStore")
            .field("blob_count", &self.blobs.read().len())
            .field("ref_count", &self.refs.read().len())
            .field("read_count", &self.read_count())
            .finish()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read_blob(&self, id: &BlobId) -> Result<Vec<u8>> {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        let blobs = self.blobs.read();
        blobs
            .get(id)
            .map(|b| b.as_ref().clone())
            .ok_or_else(|| Error::not_found(format!("blob {id}")))
    }

    async fn write_blob(&self, data: &[u8], _imports: &[BlobId]) -> Result<BlobId> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = BlobId::new(format!("blob-{n:08}"));
        self.blobs.write().insert(id.clone(), Arc::new(data.to_vec()));
        Ok(id)
    }

    async fn read_ref(&self, name: &str) -> Result<Vec<u8>> {
        self.refs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("ref {name}")))
    }

    async fn write_ref(&self, name: &str, value: &[u8], _imports: &[BlobId]) -> Result<()> {
        self.refs.write().insert(name.to_string(), value.to_vec());
        Ok(())
    }

    async fn has_ref(&self, name: &str) -> Result<bool> {
        Ok(self.refs.read().contains_key(name))
    }

    async fn delete_ref(&self, name: &str) -> Result<()> {
        // Idempotent: deleting a missing ref is fine
        self.refs.write().remove(name);
        Ok(())
    }
}
