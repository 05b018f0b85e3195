//! # Bale Bundle
//!
//! The bundle container and its caching read/write engine.
//!
//! A *bundle* is one persisted blob packing many tree nodes: a header
//! describing imports (nodes referenced in other bundles), exports (nodes
//! defined here), and packets (independently compressed blocks), followed
//! by the compressed payload ([`format`]).
//!
//! - [`BundleWriter`] is the write path: content-hash dedup, post-order
//!   queueing, batch rotation bounded by `max_blob_size`, strictly
//!   sequenced durable writes, and root-pointer publication.
//! - [`BundleStore`] is the read path: single-flight blob/mount/packet
//!   caches, bounded collaborator-read concurrency, and the
//!   [`bale_tree::NodeResolver`] implementation trees resolve through.
//!
//! ## Example
//!
//! ```no_run
//! use bale_bundle::{BundleStore, BundleWriter, StoreOptions};
//! use bale_core::MemoryBlobStore;
//! use bale_tree::{copy_tree_to, ChunkTree};
//! use std::sync::Arc;
//!
//! # async fn demo() -> bale_core::Result<()> {
//! let backend = Arc::new(MemoryBlobStore::new());
//! let store = Arc::new(BundleStore::new(backend, StoreOptions::default())?);
//! let writer = BundleWriter::new(Arc::clone(&store));
//!
//! let mut tree = ChunkTree::with_defaults();
//! tree.append(b"artifact bytes")?;
//! let root = tree.finalize()?;
//! writer.commit("heads/main", &root).await?;
//!
//! let loaded = store.load_root("heads/main").await?;
//! let mut out = Vec::new();
//! copy_tree_to(&loaded, &*store, &mut out).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod format;
pub mod packer;
pub mod stats;
pub mod store;
pub mod writer;

pub use cache::SingleFlightCache;
pub use format::{BundleHeader, Export, Import, ImportEntry, Packet, BUNDLE_VERSION};
pub use stats::{StoreStats, StoreStatsSnapshot};
pub use store::{BundleStore, MountedBundle, StoreOptions};
pub use writer::BundleWriter;
