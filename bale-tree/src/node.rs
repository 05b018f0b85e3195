//! Tree node types and their canonical wire encodings.
//!
//! Two node kinds share one address space:
//!
//! - [`ChunkNode`]: a span of raw content. Depth 0 nodes (leaves) carry
//!   bytes; deeper nodes carry the ordered hashes of their children.
//! - [`DirectoryNode`]: a named mapping of files and subdirectories.
//!
//! The canonical encoding is `[type byte][body]`, with `b'c'` and `b'd'` as
//! type bytes. A node's [`ContentHash`] is the digest of exactly these bytes,
//! so two nodes are interchangeable iff their encodings match.
//!
//! Encoding never fails: every constructor and decoder upholds the
//! invariants the wire form needs (validated names, hash-aligned payloads).

use crate::directory::DirectoryNode;
use crate::node_ref::NodeRef;
use bale_core::{varint, ContentHash, Error, Result, HASH_SIZE};

/// Type byte of an encoded chunk node.
pub const NODE_TYPE_CHUNK: u8 = b'c';
/// Type byte of an encoded directory node.
pub const NODE_TYPE_DIRECTORY: u8 = b'd';

/// A sealed tree node.
#[derive(Debug, Clone)]
pub enum Node {
    Chunk(ChunkNode),
    Directory(DirectoryNode),
}

impl Node {
    /// Canonical serialized form: the bytes the content hash is computed
    /// over and the bytes a bundle exports.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size_hint());
        match self {
            Node::Chunk(c) => c.encode_into(&mut buf),
            Node::Directory(d) => d.encode_into(&mut buf),
        }
        buf
    }

    fn encoded_size_hint(&self) -> usize {
        match self {
            Node::Chunk(c) => c.payload.len() + 10,
            Node::Directory(_) => 256,
        }
    }

    /// Parse a node from its canonical encoding.
    ///
    /// `refs` supplies the outgoing references in encoding order (children
    /// for a chunk node, file entries then directory entries for a directory
    /// node); each is checked against the hash embedded in the body.
    pub fn decode(bytes: &[u8], refs: Vec<NodeRef>) -> Result<Node> {
        let (&type_byte, body) = bytes
            .split_first()
            .ok_or_else(|| Error::decode("empty node"))?;
        match type_byte {
            NODE_TYPE_CHUNK => Ok(Node::Chunk(ChunkNode::decode_body(body, refs)?)),
            NODE_TYPE_DIRECTORY => Ok(Node::Directory(DirectoryNode::decode_body(body, refs)?)),
            other => Err(Error::decode(format!("unknown node type byte {other:#04x}"))),
        }
    }

    /// Digest of the canonical encoding.
    pub fn hash(&self) -> ContentHash {
        ContentHash::of(&self.encode())
    }

    /// Logical length of the subtree, where known: raw bytes below a chunk
    /// node, the sum of entry lengths below a directory.
    ///
    /// `None` for interior chunk nodes decoded from a bundle — their
    /// children's logical lengths are not recorded on the wire. Directory
    /// nodes always know theirs (entry lengths are part of their encoding).
    pub fn length(&self) -> Option<u64> {
        match self {
            Node::Chunk(c) => c.length(),
            Node::Directory(d) => Some(d.length()),
        }
    }

    /// Outgoing references in encoding order.
    pub fn refs(&self) -> &[NodeRef] {
        match self {
            Node::Chunk(c) => c.children(),
            Node::Directory(d) => d.refs(),
        }
    }
}

/// A span of content: leaf bytes at depth 0, child hashes above.
#[derive(Debug, Clone)]
pub struct ChunkNode {
    depth: u64,
    payload: Vec<u8>,
    children: Vec<NodeRef>,
}

impl ChunkNode {
    /// A depth-0 node holding raw bytes.
    pub fn leaf(payload: Vec<u8>) -> Self {
        Self {
            depth: 0,
            payload,
            children: Vec::new(),
        }
    }

    /// An interior node over `children`, in content order. The payload is the
    /// concatenation of the children's hashes, so constructing an interior
    /// node hashes (and therefore serializes) any still-owned children.
    pub fn interior(depth: u64, children: Vec<NodeRef>) -> Result<Self> {
        if depth == 0 {
            return Err(Error::usage("interior chunk node requires depth >= 1"));
        }
        if children.is_empty() {
            return Err(Error::usage("interior chunk node requires at least one child"));
        }
        let mut payload = Vec::with_capacity(children.len() * HASH_SIZE);
        for child in &children {
            payload.extend_from_slice(child.hash().as_bytes());
        }
        Ok(Self {
            depth,
            payload,
            children,
        })
    }

    /// Height of this node above the leaves.
    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// True for depth-0 nodes.
    pub fn is_leaf(&self) -> bool {
        self.depth == 0
    }

    /// Raw bytes (leaf) or concatenated child hashes (interior).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Child references, in content order. Empty for leaves.
    pub fn children(&self) -> &[NodeRef] {
        &self.children
    }

    /// Child reference at `index`.
    pub fn child(&self, index: usize) -> Option<&NodeRef> {
        self.children.get(index)
    }

    /// Raw bytes represented beneath this node, where known.
    ///
    /// Leaves always know their length. An interior node knows it only if
    /// every child does, which holds for trees built in memory but not for
    /// interior nodes decoded from a bundle.
    pub fn length(&self) -> Option<u64> {
        if self.depth == 0 {
            Some(self.payload.len() as u64)
        } else {
            self.children.iter().map(|c| c.length()).sum()
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(NODE_TYPE_CHUNK);
        varint::encode_varint(self.depth, buf);
        buf.extend_from_slice(&self.payload);
    }

    fn decode_body(body: &[u8], refs: Vec<NodeRef>) -> Result<Self> {
        let mut pos = 0;
        let depth = varint::decode_varint(body, &mut pos)?;
        let payload = body[pos..].to_vec();

        if depth == 0 {
            if !refs.is_empty() {
                return Err(Error::decode(format!(
                    "leaf chunk node carries {} references",
                    refs.len()
                )));
            }
            return Ok(Self::leaf(payload));
        }

        if payload.len() % HASH_SIZE != 0 {
            return Err(Error::decode(format!(
                "interior payload of {} bytes is not hash-aligned",
                payload.len()
            )));
        }
        let child_count = payload.len() / HASH_SIZE;
        if refs.len() != child_count {
            return Err(Error::decode(format!(
                "interior node names {child_count} children but {} references were supplied",
                refs.len()
            )));
        }
        for (i, child) in refs.iter().enumerate() {
            let expected = &payload[i * HASH_SIZE..(i + 1) * HASH_SIZE];
            if child.hash().as_bytes() != expected {
                return Err(Error::decode(format!("child {i} hash mismatch")));
            }
        }
        Ok(Self {
            depth,
            payload,
            children: refs,
        })
    }
}
