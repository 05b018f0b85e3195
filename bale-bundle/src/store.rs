//! Bundle store read path.
//!
//! The store turns `(hash, locator)` pairs back into decoded nodes:
//!
//! 1. `read_bundle` fetches blob bytes through a size-bounded cache with
//!    single-flight coalescing, holding a process-wide semaphore permit
//!    around the collaborator read.
//! 2. `mount_bundle` parses a bundle's header once, locating every export
//!    inside the packet stream and wiring the combined reference table to
//!    shared [`NodeRef`] handles. Mounting is coalesced per bundle; a
//!    failed or cancelled mount leaves the bundle unmounted for retry.
//! 3. `decode_packet` decompresses one packet, cached by
//!    `(blob, packet index)` — decompression is pure, so the cache only
//!    ever evicts by size, never invalidates.
//!
//! The store implements [`NodeResolver`], so detached references resolve
//! through these layers transparently during tree traversal.

use crate::cache::SingleFlightCache;
use crate::format::{decode_bundle, BundleHeader};
use crate::packer;
use crate::stats::{StoreStats, StoreStatsSnapshot};
use async_trait::async_trait;
use bale_core::{
    BlobId, BlobStore, ContentHash, Error, NodeLocator, Result, RootPointer,
};
use bale_tree::{Node, NodeRef, NodeResolver};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Store tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Rotate a write batch before its raw size would exceed this.
    pub max_blob_size: usize,
    /// Nodes at least this large compress as their own packet; smaller
    /// nodes batch into shared blocks flushed at this size.
    pub min_packet_size: usize,
    /// Zstd compression level for packets.
    pub compression_level: i32,
    /// Weight bound (bytes) of the raw blob cache.
    pub blob_cache_bytes: u64,
    /// Weight bound (bytes) of the decoded packet cache.
    pub packet_cache_bytes: u64,
    /// Entry bound of the mounted-bundle cache.
    pub mount_cache_entries: u64,
    /// Cap on concurrent collaborator reads across all callers.
    pub max_concurrent_reads: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_blob_size: 10 * 1024 * 1024,
            min_packet_size: 64 * 1024,
            compression_level: 3,
            blob_cache_bytes: 64 * 1024 * 1024,
            packet_cache_bytes: 32 * 1024 * 1024,
            mount_cache_entries: 1024,
            max_concurrent_reads: 16,
        }
    }
}

impl StoreOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_blob_size == 0 || self.min_packet_size == 0 {
            return Err(Error::usage("store size limits must be non-zero"));
        }
        if self.max_concurrent_reads == 0 {
            return Err(Error::usage("max_concurrent_reads must be non-zero"));
        }
        Ok(())
    }
}

// ============================================================================
// MountedBundle
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub(crate) struct ExportPosition {
    pub packet: u32,
    pub offset: usize,
}

/// A bundle whose header has been parsed and exports located.
#[derive(Debug)]
pub struct MountedBundle {
    pub(crate) blob: BlobId,
    pub(crate) header: BundleHeader,
    /// Encoded byte range of each packet within the blob.
    pub(crate) packet_ranges: Vec<Range<usize>>,
    /// Location of each export inside its decoded packet.
    pub(crate) positions: Vec<ExportPosition>,
    /// Combined reference table: imported entries, then exports. Shared
    /// handles, so every node decoded from this bundle aliases the same
    /// references.
    pub(crate) ref_table: Vec<NodeRef>,
}

impl MountedBundle {
    pub(crate) fn parse(blob: BlobId, bytes: &[u8]) -> Result<Self> {
        let (header, payload) = decode_bundle(bytes)?;

        let mut packet_ranges = Vec::with_capacity(header.packets.len());
        let mut cursor = payload.start;
        for packet in &header.packets {
            let end = cursor + packet.encoded_len as usize;
            packet_ranges.push(cursor..end);
            cursor = end;
        }

        let mut positions = Vec::with_capacity(header.exports.len());
        let mut packet = 0usize;
        let mut offset = 0usize;
        for (i, export) in header.exports.iter().enumerate() {
            while packet < header.packets.len()
                && offset == header.packets[packet].decoded_len as usize
            {
                packet += 1;
                offset = 0;
            }
            let Some(info) = header.packets.get(packet) else {
                return Err(Error::decode(format!("export {i} lies beyond the packet stream")));
            };
            if offset + export.length as usize > info.decoded_len as usize {
                return Err(Error::decode(format!("export {i} spans a packet boundary")));
            }
            positions.push(ExportPosition {
                packet: packet as u32,
                offset,
            });
            offset += export.length as usize;
        }

        let export_count = header.exports.len() as u32;
        let mut ref_table =
            Vec::with_capacity(header.import_entry_count() + header.exports.len());
        for import in &header.imports {
            for entry in &import.entries {
                let locator = NodeLocator {
                    blob: import.blob.clone(),
                    export_index: entry.local_index,
                    export_count: import.export_count,
                };
                ref_table.push(NodeRef::detached(entry.hash, locator, None));
            }
        }
        for (i, export) in header.exports.iter().enumerate() {
            let locator = NodeLocator {
                blob: blob.clone(),
                export_index: i as u32,
                export_count,
            };
            // Export lengths on the wire are encoded sizes, not logical
            // lengths, so table references carry no length.
            ref_table.push(NodeRef::detached(export.hash, locator, None));
        }

        Ok(Self {
            blob,
            header,
            packet_ranges,
            positions,
            ref_table,
        })
    }

    /// Number of nodes this bundle exports.
    pub fn export_count(&self) -> usize {
        self.header.exports.len()
    }
}

// ============================================================================
// BundleStore
// ============================================================================

/// Caching, deduplicating store over a collaborator [`BlobStore`].
#[derive(Debug)]
pub struct BundleStore {
    backend: Arc<dyn BlobStore>,
    opts: StoreOptions,
    blobs: SingleFlightCache<BlobId, Arc<Vec<u8>>>,
    mounts: SingleFlightCache<BlobId, Arc<MountedBundle>>,
    packets: SingleFlightCache<(BlobId, u32), Arc<Vec<u8>>>,
    read_permits: Semaphore,
    stats: Arc<StoreStats>,
}

fn byte_weight<K>(_: &K, v: &Arc<Vec<u8>>) -> u32 {
    v.len().min(u32::MAX as usize) as u32
}

impl BundleStore {
    pub fn new(backend: Arc<dyn BlobStore>, opts: StoreOptions) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            blobs: SingleFlightCache::weighted("blobs", opts.blob_cache_bytes, byte_weight),
            mounts: SingleFlightCache::counted("mounts", opts.mount_cache_entries),
            packets: SingleFlightCache::weighted("packets", opts.packet_cache_bytes, byte_weight),
            read_permits: Semaphore::new(opts.max_concurrent_reads),
            stats: Arc::new(StoreStats::default()),
            backend,
            opts,
        })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.opts
    }

    /// Current statistics counters.
    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_handle(&self) -> &StoreStats {
        &self.stats
    }

    pub(crate) fn backend(&self) -> &Arc<dyn BlobStore> {
        &self.backend
    }

    /// Read a blob through the cache. Concurrent cold reads for one id are
    /// coalesced into a single collaborator fetch, bounded by the read
    /// semaphore.
    pub async fn read_bundle(&self, id: &BlobId) -> Result<Arc<Vec<u8>>> {
        if let Some(bytes) = self.blobs.get(id) {
            self.stats.record_blob_cache_hit();
            return Ok(bytes);
        }
        self.blobs
            .get_or_fetch(id.clone(), || async {
                let _permit = self
                    .read_permits
                    .acquire()
                    .await
                    .map_err(|_| Error::storage("read semaphore closed"))?;
                self.stats.record_blob_fetch();
                let bytes = self.backend.read_blob(id).await?;
                Ok(Arc::new(bytes))
            })
            .await
    }

    /// Parse a bundle's header and locate its exports, once per bundle.
    pub async fn mount_bundle(&self, id: &BlobId) -> Result<Arc<MountedBundle>> {
        if let Some(mounted) = self.mounts.get(id) {
            return Ok(mounted);
        }
        self.mounts
            .get_or_fetch(id.clone(), || async {
                let bytes = self.read_bundle(id).await?;
                let mounted = MountedBundle::parse(id.clone(), &bytes)?;
                self.stats.record_mount();
                tracing::debug!(
                    blob = %id,
                    exports = mounted.header.exports.len(),
                    imports = mounted.header.imports.len(),
                    packets = mounted.header.packets.len(),
                    "mounted bundle"
                );
                Ok(Arc::new(mounted))
            })
            .await
    }

    async fn decode_packet(&self, mounted: &MountedBundle, packet: u32) -> Result<Arc<Vec<u8>>> {
        let key = (mounted.blob.clone(), packet);
        if let Some(decoded) = self.packets.get(&key) {
            return Ok(decoded);
        }
        self.packets
            .get_or_fetch(key, || async {
                let bytes = self.read_bundle(&mounted.blob).await?;
                let range = mounted
                    .packet_ranges
                    .get(packet as usize)
                    .ok_or_else(|| Error::decode(format!("packet {packet} out of range")))?
                    .clone();
                let decoded_len = mounted.header.packets[packet as usize].decoded_len as usize;
                self.stats.record_packet_decode();
                let decoded = packer::decompress_packet(&bytes[range], decoded_len)?;
                Ok(Arc::new(decoded))
            })
            .await
    }

    /// Fetch and decode one node, verifying its content hash.
    pub async fn read_node(&self, hash: &ContentHash, locator: &NodeLocator) -> Result<Arc<Node>> {
        let mounted = self.mount_bundle(&locator.blob).await?;
        let index = locator.export_index as usize;
        let export = mounted.header.exports.get(index).ok_or_else(|| {
            Error::decode(format!(
                "export index {index} out of range in bundle {}",
                locator.blob
            ))
        })?;
        if export.hash != *hash {
            return Err(Error::decode(format!(
                "bundle {} export {index} holds {}, expected {hash}",
                locator.blob, export.hash
            )));
        }

        let position = mounted.positions[index];
        let packet = self.decode_packet(&mounted, position.packet).await?;
        let bytes = &packet[position.offset..position.offset + export.length as usize];
        if !hash.verify(bytes) {
            return Err(Error::decode(format!("node {hash} failed hash verification")));
        }

        let refs: Vec<NodeRef> = export
            .refs
            .iter()
            .map(|&idx| mounted.ref_table[idx as usize].clone())
            .collect();
        Ok(Arc::new(Node::decode(bytes, refs)?))
    }

    /// Read a named root pointer back as a resolvable reference.
    pub async fn load_root(&self, name: &str) -> Result<NodeRef> {
        let bytes = self.backend.read_ref(name).await?;
        let pointer = RootPointer::decode(&bytes)?;
        Ok(NodeRef::detached(
            pointer.hash,
            pointer.locator,
            Some(pointer.length),
        ))
    }

    /// Whether a named root exists.
    pub async fn has_root(&self, name: &str) -> Result<bool> {
        self.backend.has_ref(name).await
    }

    /// Delete a named root pointer.
    pub async fn delete_root(&self, name: &str) -> Result<()> {
        self.backend.delete_ref(name).await
    }
}

#[async_trait]
impl NodeResolver for BundleStore {
    async fn resolve_node(&self, hash: &ContentHash, locator: &NodeLocator) -> Result<Arc<Node>> {
        self.read_node(hash, locator).await
    }
}
