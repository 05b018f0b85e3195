//! Content-defined chunk boundary detection.
//!
//! A rolling hash (buzhash) is maintained over the last `window_size` units
//! appended. After each unit the detector tests `hash < threshold`. The test
//! only runs once `min_size` bytes have accumulated, so the threshold is
//! calibrated over the remaining span: roughly
//! `2^32 / (target_size - min_size)`, giving each byte past the minimum a
//! `1 / (target_size - min_size)` chance of ending the chunk. That puts the
//! expected chunk size at `target_size`, hard-bounded to
//! `[min_size, max_size]`.
//!
//! The same detector is reused to split interior nodes, except the unit is a
//! fixed-width child hash instead of a byte: the test runs once per hash and
//! the threshold is scaled by the hash width to keep the expected sealed size
//! at `target_size`. Because the decision depends only on the trailing
//! window, a purely local edit re-derives identical boundaries on both sides
//! of the edit.

use bale_core::{Error, Result, HASH_SIZE};
use serde::{Deserialize, Serialize};

/// Splitting parameters for content-defined chunking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingOptions {
    /// Minimum chunk size in bytes; no boundary is reported before this many
    /// bytes have accumulated (a terminal chunk may still be shorter).
    pub min_size: usize,
    /// Expected chunk size in bytes.
    pub target_size: usize,
    /// Hard maximum chunk size in bytes; a boundary is forced here.
    pub max_size: usize,
    /// Rolling hash window, in units (bytes for leaves, child hashes for
    /// interior nodes).
    pub window_size: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            min_size: 32 * 1024,
            target_size: 64 * 1024,
            max_size: 256 * 1024,
            window_size: 64,
        }
    }
}

impl ChunkingOptions {
    /// Validate the parameter relationships.
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 || self.window_size == 0 {
            return Err(Error::usage("chunking sizes must be non-zero"));
        }
        // An interior node's first child hash must never seal it on its own,
        // and the hash-stride detector suppresses boundaries below min_size.
        if self.min_size <= HASH_SIZE {
            return Err(Error::usage(format!(
                "min_size must exceed the hash width of {HASH_SIZE} bytes"
            )));
        }
        if self.min_size > self.target_size || self.target_size > self.max_size {
            return Err(Error::usage(format!(
                "chunking sizes must satisfy min <= target <= max, got {} / {} / {}",
                self.min_size, self.target_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Byte-to-hash substitution table for the buzhash. Generated from a fixed
/// mixing function so boundaries are identical across builds and platforms.
const BUZ_TABLE: [u32; 256] = buz_table();

const fn buz_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (splitmix64(i as u64) >> 32) as u32;
        i += 1;
    }
    table
}

const fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Rolling-hash boundary detector over a sliding window.
///
/// One detector instance tracks one open chunk; [`BoundaryDetector::reset`]
/// starts the next chunk. `stride` is the unit width: 1 for leaf bytes,
/// [`bale_core::HASH_SIZE`] for interior child hashes.
#[derive(Debug, Clone)]
pub struct BoundaryDetector {
    min_size: usize,
    max_size: usize,
    threshold: u32,
    stride: usize,
    window: Vec<u8>,
    window_pos: usize,
    filled: usize,
    hash: u32,
    len: usize,
}

impl BoundaryDetector {
    /// Create a detector for the given options and unit width.
    pub fn new(opts: &ChunkingOptions, stride: usize) -> Self {
        // Tests only start after min_size, so calibrate the per-byte boundary
        // probability over the remaining span up to target_size.
        let span = opts.target_size.saturating_sub(opts.min_size).max(1);
        let base = (u32::MAX as u64 / span as u64) as u32;
        // The boundary test runs once per unit rather than once per byte, so
        // the per-test probability scales by the unit width.
        let threshold = base.saturating_mul(stride as u32);
        Self {
            min_size: opts.min_size,
            max_size: opts.max_size,
            threshold,
            stride,
            window: vec![0; opts.window_size * stride],
            window_pos: 0,
            filled: 0,
            hash: 0,
            len: 0,
        }
    }

    /// Bytes accumulated since the last reset.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no bytes have been accumulated since the last reset.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start a new chunk.
    pub fn reset(&mut self) {
        self.window_pos = 0;
        self.filled = 0;
        self.hash = 0;
        self.len = 0;
    }

    #[inline]
    fn roll(&mut self, byte: u8) {
        let w = self.window.len();
        let shift = (w % 32) as u32;
        self.hash = self.hash.rotate_left(1);
        if self.filled == w {
            let out = self.window[self.window_pos];
            self.hash ^= BUZ_TABLE[out as usize].rotate_left(shift);
        } else {
            self.filled += 1;
        }
        self.window[self.window_pos] = byte;
        self.window_pos = (self.window_pos + 1) % w;
        self.hash ^= BUZ_TABLE[byte as usize];
    }

    /// Feed one unit (`stride` bytes). Returns true if a chunk boundary falls
    /// immediately after it.
    pub fn push(&mut self, unit: &[u8]) -> bool {
        debug_assert_eq!(unit.len(), self.stride);
        for &b in unit {
            self.roll(b);
        }
        self.len += unit.len();
        if self.len >= self.max_size {
            return true;
        }
        if self.len < self.min_size {
            return false;
        }
        self.hash < self.threshold
    }

    /// Feed bytes one at a time (stride 1) until a boundary is found or the
    /// input is exhausted. Returns the number of bytes consumed and whether
    /// they ended on a boundary.
    pub fn scan(&mut self, data: &[u8]) -> (usize, bool) {
        debug_assert_eq!(self.stride, 1);
        for (i, &b) in data.iter().enumerate() {
            if self.push(&[b]) {
                return (i + 1, true);
            }
        }
        (data.len(), false)
    }
}
