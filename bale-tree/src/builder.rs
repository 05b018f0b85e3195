//! Streaming content tree builder.
//!
//! [`ChunkTree`] consumes an append-only byte stream and produces a tree of
//! chunk nodes whose shape depends only on content. Bytes accumulate in an
//! open leaf until the boundary detector fires; the sealed leaf's hash then
//! feeds the parent's detector (one test per hash, see
//! [`crate::chunking`]), and so on up the tree.
//!
//! Height grows lazily: the tree starts as a single open leaf, and whenever
//! the root seals with input still arriving, the sealed root is demoted to
//! the first child of a new, deeper root. Sealed subtrees are immutable and
//! may be handed to a writer (and collapsed) while the stream continues.

use crate::chunking::{BoundaryDetector, ChunkingOptions};
use crate::node::{ChunkNode, Node};
use crate::node_ref::NodeRef;
use bale_core::{Error, Result, HASH_SIZE};

/// One open (still growing) node. Leaves buffer raw bytes; interior nodes
/// hold sealed children plus at most one open child, the `tail`.
#[derive(Debug)]
struct OpenNode {
    depth: u64,
    detector: BoundaryDetector,
    // Leaf bytes at depth 0, concatenated child hashes above.
    payload: Vec<u8>,
    children: Vec<NodeRef>,
    tail: Option<Box<OpenNode>>,
}

impl OpenNode {
    fn new(opts: &ChunkingOptions, depth: u64) -> Self {
        let stride = if depth == 0 { 1 } else { HASH_SIZE };
        Self {
            depth,
            detector: BoundaryDetector::new(opts, stride),
            payload: Vec::new(),
            children: Vec::new(),
            tail: None,
        }
    }

    /// Feed bytes into this subtree. Returns the number of bytes consumed
    /// and whether this node sealed (hit a boundary or its size cap).
    fn push(&mut self, opts: &ChunkingOptions, data: &[u8]) -> Result<(usize, bool)> {
        if self.depth == 0 {
            let (consumed, sealed) = self.detector.scan(data);
            self.payload.extend_from_slice(&data[..consumed]);
            return Ok((consumed, sealed));
        }

        if self.tail.is_none() {
            self.tail = Some(Box::new(OpenNode::new(opts, self.depth - 1)));
        }
        let tail = match self.tail.as_mut() {
            Some(tail) => tail,
            None => return Err(Error::usage("open interior node lost its tail")),
        };
        let (consumed, child_sealed) = tail.push(opts, data)?;
        if !child_sealed {
            return Ok((consumed, false));
        }

        // The open child hit a boundary: seal it and test whether its hash
        // also ends this node.
        let tail = match self.tail.take() {
            Some(tail) => tail,
            None => return Err(Error::usage("open interior node lost its tail")),
        };
        let child = tail.into_ref()?;
        let hash = child.hash();
        self.payload.extend_from_slice(hash.as_bytes());
        self.children.push(child);
        let sealed = self.detector.push(hash.as_bytes());
        Ok((consumed, sealed))
    }

    /// Seal this subtree, flushing any open tail, and return its reference.
    fn into_ref(mut self) -> Result<NodeRef> {
        if self.depth == 0 {
            return Ok(NodeRef::owned(Node::Chunk(ChunkNode::leaf(self.payload))));
        }
        if let Some(tail) = self.tail.take() {
            self.children.push(tail.into_ref()?);
        }
        let node = ChunkNode::interior(self.depth, self.children)?;
        Ok(NodeRef::owned(Node::Chunk(node)))
    }
}

/// Append-only builder producing a content-defined chunk tree.
pub struct ChunkTree {
    opts: ChunkingOptions,
    root: OpenNode,
    total_length: u64,
    finalized: bool,
}

impl std::fmt::Debug for ChunkTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkTree")
            .field("depth", &self.root.depth)
            .field("total_length", &self.total_length)
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl ChunkTree {
    /// Create a builder with the given chunking parameters.
    pub fn new(opts: ChunkingOptions) -> Result<Self> {
        opts.validate()?;
        let root = OpenNode::new(&opts, 0);
        Ok(Self {
            opts,
            root,
            total_length: 0,
            finalized: false,
        })
    }

    /// Create a builder with default chunking parameters.
    pub fn with_defaults() -> Self {
        Self {
            opts: ChunkingOptions::default(),
            root: OpenNode::new(&ChunkingOptions::default(), 0),
            total_length: 0,
            finalized: false,
        }
    }

    /// Total bytes appended so far.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Current height of the tree above the leaves.
    pub fn depth(&self) -> u64 {
        self.root.depth
    }

    /// Append bytes to the end of the stream.
    pub fn append(&mut self, mut data: &[u8]) -> Result<()> {
        if self.finalized {
            return Err(Error::usage("append after finalize"));
        }
        self.total_length += data.len() as u64;
        while !data.is_empty() {
            let (consumed, sealed) = self.root.push(&self.opts, data)?;
            data = &data[consumed..];
            if sealed {
                self.grow()?;
            }
        }
        Ok(())
    }

    /// Demote the sealed root to the first child of a new, deeper root.
    fn grow(&mut self) -> Result<()> {
        let depth = self.root.depth + 1;
        tracing::trace!(depth, total_length = self.total_length, "growing content tree");
        let old = std::mem::replace(&mut self.root, OpenNode::new(&self.opts, depth));
        let child = old.into_ref()?;
        let hash = child.hash();
        self.root.payload.extend_from_slice(hash.as_bytes());
        self.root.children.push(child);
        // Options validation guarantees min_size exceeds the hash width, so
        // a fresh root is still below its minimum here and cannot seal on
        // its first child.
        self.root.detector.push(hash.as_bytes());
        Ok(())
    }

    /// Seal the stream and return the root reference. The builder cannot be
    /// appended to afterwards.
    pub fn finalize(&mut self) -> Result<NodeRef> {
        if self.finalized {
            return Err(Error::usage("finalize called twice"));
        }
        self.finalized = true;
        let root = std::mem::replace(&mut self.root, OpenNode::new(&self.opts, 0));
        root.into_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_ref::NullResolver;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn small_opts() -> ChunkingOptions {
        ChunkingOptions {
            min_size: 1024,
            target_size: 4 * 1024,
            max_size: 16 * 1024,
            window_size: 32,
        }
    }

    fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen()).collect()
    }

    fn build(opts: &ChunkingOptions, data: &[u8], piece: usize) -> NodeRef {
        let mut tree = ChunkTree::new(opts.clone()).unwrap();
        for chunk in data.chunks(piece) {
            tree.append(chunk).unwrap();
        }
        tree.finalize().unwrap()
    }

    async fn collect_bytes(root: &NodeRef) -> Vec<u8> {
        let mut out = Vec::new();
        let mut stack = vec![root.resolve(&NullResolver).await.unwrap()];
        // Depth-first, children reversed so content order is preserved.
        while let Some(node) = stack.pop() {
            match &*node {
                Node::Chunk(c) if c.is_leaf() => out.extend_from_slice(c.payload()),
                Node::Chunk(c) => {
                    for child in c.children().iter().rev() {
                        stack.push(child.resolve(&NullResolver).await.unwrap());
                    }
                }
                Node::Directory(_) => panic!("directory in content tree"),
            }
        }
        out
    }

    fn leaf_hashes(root: &NodeRef) -> Vec<bale_core::ContentHash> {
        fn walk(node: &Arc<Node>, out: &mut Vec<bale_core::ContentHash>) {
            match &**node {
                Node::Chunk(c) if c.is_leaf() => out.push(node.hash()),
                Node::Chunk(c) => {
                    for child in c.children() {
                        walk(&child.node_if_resident().unwrap(), out);
                    }
                }
                Node::Directory(_) => panic!("directory in content tree"),
            }
        }
        let mut out = Vec::new();
        walk(&root.node_if_resident().unwrap(), &mut out);
        out
    }

    #[test]
    fn test_empty_stream_is_single_leaf() {
        let mut tree = ChunkTree::new(small_opts()).unwrap();
        let root = tree.finalize().unwrap();
        assert_eq!(root.length(), Some(0));
        match &*root.node_if_resident().unwrap() {
            Node::Chunk(c) => {
                assert!(c.is_leaf());
                assert!(c.payload().is_empty());
            }
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn test_append_after_finalize_fails() {
        let mut tree = ChunkTree::new(small_opts()).unwrap();
        tree.finalize().unwrap();
        assert!(matches!(tree.append(b"late"), Err(Error::Usage(_))));
        assert!(tree.finalize().is_err());
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_content() {
        let opts = small_opts();
        let data = random_bytes(3, 100 * 1024);
        let root = build(&opts, &data, 7000);
        assert_eq!(root.length(), Some(data.len() as u64));
        assert_eq!(collect_bytes(&root).await, data);
    }

    #[test]
    fn test_shape_independent_of_append_granularity() {
        let opts = small_opts();
        let data = random_bytes(5, 120 * 1024);
        let whole = build(&opts, &data, data.len());
        let bytewise = build(&opts, &data, 1);
        let mixed = build(&opts, &data, 333);
        assert_eq!(whole.hash(), bytewise.hash());
        assert_eq!(whole.hash(), mixed.hash());
    }

    #[test]
    fn test_height_grows_with_input() {
        let opts = small_opts();
        let mut tree = ChunkTree::new(opts).unwrap();
        tree.append(&random_bytes(9, 512 * 1024)).unwrap();
        assert!(tree.depth() >= 1, "512 KiB at a 4 KiB target must grow");
        let root = tree.finalize().unwrap();
        assert_eq!(root.length(), Some(512 * 1024));
    }

    #[test]
    fn test_local_edit_preserves_most_leaves() {
        let opts = small_opts();
        let original = random_bytes(21, 256 * 1024);
        let mut edited = original.clone();
        edited.insert(128 * 1024, 0xAB);

        let leaves_a = leaf_hashes(&build(&opts, &original, 8192));
        let leaves_b = leaf_hashes(&build(&opts, &edited, 8192));

        let set_a: std::collections::HashSet<_> = leaves_a.iter().collect();
        let shared = leaves_b.iter().filter(|h| set_a.contains(h)).count();
        // A one-byte insert disturbs only the chunks around the edit.
        assert!(
            shared * 2 > leaves_b.len(),
            "only {shared} of {} leaves survived a one-byte insert",
            leaves_b.len()
        );
    }

    #[tokio::test]
    async fn test_typical_options_on_300k_stream() {
        let opts = ChunkingOptions {
            min_size: 32 * 1024,
            target_size: 64 * 1024,
            max_size: 256 * 1024,
            window_size: 64,
        };
        let data = random_bytes(33, 300 * 1024);
        let root = build(&opts, &data, 20_000);
        assert_eq!(root.length(), Some(data.len() as u64));

        let leaves = leaf_hashes(&root).len();
        assert!((4..=6).contains(&leaves), "unexpected leaf count {leaves}");
        assert_eq!(collect_bytes(&root).await, data);
    }

    fn leaf_lengths(root: &NodeRef) -> Vec<usize> {
        fn walk(node: &Arc<Node>, out: &mut Vec<usize>) {
            match &**node {
                Node::Chunk(c) if c.is_leaf() => out.push(c.payload().len()),
                Node::Chunk(c) => {
                    for child in c.children() {
                        walk(&child.node_if_resident().unwrap(), out);
                    }
                }
                Node::Directory(_) => panic!("directory in content tree"),
            }
        }
        let mut out = Vec::new();
        walk(&root.node_if_resident().unwrap(), &mut out);
        out
    }

    #[tokio::test]
    async fn test_stream_of_exactly_min_size() {
        let opts = small_opts();
        let data = random_bytes(41, opts.min_size);
        let root = build(&opts, &data, data.len());
        assert_eq!(root.length(), Some(opts.min_size as u64));
        assert_eq!(leaf_lengths(&root).len(), 1);
        assert_eq!(collect_bytes(&root).await, data);
    }

    #[tokio::test]
    async fn test_stream_of_exactly_max_size() {
        let opts = small_opts();
        let data = random_bytes(43, opts.max_size);
        let root = build(&opts, &data, data.len());
        assert_eq!(root.length(), Some(opts.max_size as u64));

        let lengths = leaf_lengths(&root);
        assert_eq!(lengths.iter().sum::<usize>(), opts.max_size);
        for &len in &lengths {
            assert!(len <= opts.max_size, "leaf of {len} above max");
        }
        for &len in &lengths[..lengths.len() - 1] {
            assert!(len >= opts.min_size, "non-terminal leaf of {len} below min");
        }
        assert_eq!(collect_bytes(&root).await, data);
    }
}
