//! Lock-free store statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters maintained by the store and its writers.
///
/// All counters are monotonic and updated with relaxed ordering; they are
/// diagnostics, not synchronization.
#[derive(Debug, Default)]
pub struct StoreStats {
    blob_cache_hits: AtomicU64,
    blob_fetches: AtomicU64,
    mounts: AtomicU64,
    packet_decodes: AtomicU64,
    bundles_written: AtomicU64,
    nodes_written: AtomicU64,
    raw_bytes_written: AtomicU64,
    compressed_bytes_written: AtomicU64,
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStatsSnapshot {
    pub blob_cache_hits: u64,
    pub blob_fetches: u64,
    pub mounts: u64,
    pub packet_decodes: u64,
    pub bundles_written: u64,
    pub nodes_written: u64,
    pub raw_bytes_written: u64,
    pub compressed_bytes_written: u64,
}

impl StoreStats {
    pub(crate) fn record_blob_cache_hit(&self) {
        self.blob_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_blob_fetch(&self) {
        self.blob_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_mount(&self) {
        self.mounts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_packet_decode(&self) {
        self.packet_decodes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bundle_write(&self, nodes: u64, raw_bytes: u64, compressed_bytes: u64) {
        self.bundles_written.fetch_add(1, Ordering::Relaxed);
        self.nodes_written.fetch_add(nodes, Ordering::Relaxed);
        self.raw_bytes_written.fetch_add(raw_bytes, Ordering::Relaxed);
        self.compressed_bytes_written
            .fetch_add(compressed_bytes, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            blob_cache_hits: self.blob_cache_hits.load(Ordering::Relaxed),
            blob_fetches: self.blob_fetches.load(Ordering::Relaxed),
            mounts: self.mounts.load(Ordering::Relaxed),
            packet_decodes: self.packet_decodes.load(Ordering::Relaxed),
            bundles_written: self.bundles_written.load(Ordering::Relaxed),
            nodes_written: self.nodes_written.load(Ordering::Relaxed),
            raw_bytes_written: self.raw_bytes_written.load(Ordering::Relaxed),
            compressed_bytes_written: self.compressed_bytes_written.load(Ordering::Relaxed),
        }
    }
}
