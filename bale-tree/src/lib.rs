//! # Bale Tree
//!
//! Content-defined trees over raw bytes and directory hierarchies.
//!
//! This crate turns streams and file layouts into Merkle trees of
//! fixed-identity nodes:
//!
//! - [`ChunkTree`] splits an append-only byte stream into chunk nodes at
//!   content-defined boundaries ([`chunking`]), growing height lazily.
//! - [`DirectoryTree`] assembles named hierarchies of files and
//!   subdirectories, re-sealing unchanged subtrees to identical hashes.
//! - [`NodeRef`] is the collapsible edge type connecting nodes: owned while
//!   in memory, detached to a [`bale_core::NodeLocator`] once durably
//!   written.
//! - [`copy_tree_to`] streams a tree's bytes back out through any resolver.
//!
//! Persistence lives elsewhere: this crate only defines node shapes, their
//! canonical encodings, and the [`NodeResolver`] seam a store plugs into.

pub mod builder;
pub mod chunking;
pub mod copy;
pub mod directory;
pub mod node;
pub mod node_ref;

pub use builder::ChunkTree;
pub use chunking::{BoundaryDetector, ChunkingOptions};
pub use copy::copy_tree_to;
pub use directory::{
    DirectoryEntry, DirectoryNode, DirectoryTree, FileEntry, FILE_FLAG_EXECUTABLE,
};
pub use node::{ChunkNode, Node, NODE_TYPE_CHUNK, NODE_TYPE_DIRECTORY};
pub use node_ref::{NodeRef, NodeResolver, NullResolver};
