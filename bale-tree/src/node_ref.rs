//! Shared, collapsible references between tree nodes.
//!
//! A [`NodeRef`] is the edge type of the tree: parents hold `NodeRef`s to
//! children, and the same `NodeRef` may be shared by many parents (structural
//! sharing). Each reference is in one of two states:
//!
//! - **Owned**: the node lives in memory and has not been durably written.
//! - **Detached**: the node has been written; the reference keeps only its
//!   content hash, its [`NodeLocator`], and the subtree's logical length,
//!   plus a weak handle to the decoded node so hot re-reads skip the store.
//!
//! The transition is one-way: [`NodeRef::collapse`] moves Owned to Detached
//! after a durable write and nothing ever moves back. Collapsing bounds
//! writer memory to the unwritten frontier of the tree.

use crate::node::Node;
use bale_core::{ContentHash, NodeLocator, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::{Arc, Weak};

/// Resolves a detached reference back into a decoded node.
///
/// Implemented by the bundle store; [`NullResolver`] is available for trees
/// that are guaranteed fully in memory.
#[async_trait]
pub trait NodeResolver: Debug + Send + Sync {
    /// Fetch and decode the node identified by `hash` at `locator`.
    async fn resolve_node(&self, hash: &ContentHash, locator: &NodeLocator) -> Result<Arc<Node>>;
}

/// Resolver for fully in-memory trees; resolving through it is a usage error.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResolver;

#[async_trait]
impl NodeResolver for NullResolver {
    async fn resolve_node(&self, hash: &ContentHash, _locator: &NodeLocator) -> Result<Arc<Node>> {
        Err(bale_core::Error::usage(format!(
            "node {hash} is detached but no store is attached"
        )))
    }
}

enum RefState {
    Owned {
        node: Arc<Node>,
        // Hash of the canonical encoding, computed on first use.
        hash: Option<ContentHash>,
    },
    Detached {
        hash: ContentHash,
        locator: NodeLocator,
        // Keeps hot nodes resolvable without a store round trip.
        cached: Weak<Node>,
    },
}

struct RefInner {
    state: RwLock<RefState>,
    length: Option<u64>,
}

/// A shared reference to a tree node, collapsible after a durable write.
///
/// Cloning is cheap and clones observe each other's state: collapsing one
/// handle collapses them all.
#[derive(Clone)]
pub struct NodeRef {
    inner: Arc<RefInner>,
}

impl NodeRef {
    /// Reference a node held in memory.
    pub fn owned(node: Node) -> Self {
        let length = node.length();
        Self {
            inner: Arc::new(RefInner {
                state: RwLock::new(RefState::Owned {
                    node: Arc::new(node),
                    hash: None,
                }),
                length,
            }),
        }
    }

    /// Reference a node by its persisted location.
    ///
    /// `length` is the subtree's logical length where the caller knows it
    /// (a root pointer records it); references recovered from a bundle's
    /// tables pass `None`.
    pub fn detached(hash: ContentHash, locator: NodeLocator, length: Option<u64>) -> Self {
        Self {
            inner: Arc::new(RefInner {
                state: RwLock::new(RefState::Detached {
                    hash,
                    locator,
                    cached: Weak::new(),
                }),
                length,
            }),
        }
    }

    /// Logical length of the referenced subtree, where known.
    ///
    /// References built in memory and references loaded from a root pointer
    /// know their length; references recovered from a bundle's tables do
    /// not (`None`) — logical lengths for persisted content travel in
    /// directory entries and root pointers, never in the bundle itself.
    pub fn length(&self) -> Option<u64> {
        self.inner.length
    }

    /// True if `self` and `other` are handles to the same underlying
    /// reference (not merely equal content).
    pub fn ptr_eq(&self, other: &NodeRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// True while the node is held in memory and not yet durably written.
    pub fn is_owned(&self) -> bool {
        matches!(*self.inner.state.read(), RefState::Owned { .. })
    }

    /// The persisted location, once collapsed.
    pub fn locator(&self) -> Option<NodeLocator> {
        match &*self.inner.state.read() {
            RefState::Owned { .. } => None,
            RefState::Detached { locator, .. } => Some(locator.clone()),
        }
    }

    /// Content hash of the referenced node.
    ///
    /// For an owned reference this serializes the node on first call and
    /// caches the digest; interior encodings embed child hashes, so this may
    /// recurse into owned children.
    pub fn hash(&self) -> ContentHash {
        {
            let state = self.inner.state.read();
            match &*state {
                RefState::Owned { hash: Some(h), .. } => return *h,
                RefState::Detached { hash, .. } => return *hash,
                RefState::Owned { hash: None, .. } => {}
            }
        }
        // Serialize outside the lock; child hash() calls take their own locks
        // and the tree is acyclic, so parent-then-child ordering cannot
        // deadlock.
        let node = {
            let state = self.inner.state.read();
            match &*state {
                RefState::Owned { node, .. } => Arc::clone(node),
                RefState::Detached { hash, .. } => return *hash,
            }
        };
        let computed = node.hash();
        let mut state = self.inner.state.write();
        if let RefState::Owned { hash, .. } = &mut *state {
            *hash = Some(computed);
        }
        computed
    }

    /// The in-memory node, if this reference still owns one or has it cached.
    pub fn node_if_resident(&self) -> Option<Arc<Node>> {
        match &*self.inner.state.read() {
            RefState::Owned { node, .. } => Some(Arc::clone(node)),
            RefState::Detached { cached, .. } => cached.upgrade(),
        }
    }

    /// Collapse an owned reference to its persisted location.
    ///
    /// Called once the node's bundle write is durable. Idempotent: collapsing
    /// an already-detached reference is a no-op, so aliased handles produced
    /// by deduplication can all be collapsed safely.
    pub fn collapse(&self, locator: NodeLocator) {
        let mut state = self.inner.state.write();
        if let RefState::Owned { node, hash } = &*state {
            let hash = match hash {
                Some(h) => *h,
                None => node.hash(),
            };
            // Hold a weak handle so reads hitting this reference before the
            // node leaves memory avoid a store round trip.
            let cached = Arc::downgrade(node);
            *state = RefState::Detached {
                hash,
                locator,
                cached,
            };
        }
    }

    /// Load the referenced node, fetching through `resolver` if it is
    /// detached and no longer resident.
    pub async fn resolve(&self, resolver: &dyn NodeResolver) -> Result<Arc<Node>> {
        let (hash, locator) = {
            let state = self.inner.state.read();
            match &*state {
                RefState::Owned { node, .. } => return Ok(Arc::clone(node)),
                RefState::Detached {
                    hash,
                    locator,
                    cached,
                } => {
                    if let Some(node) = cached.upgrade() {
                        return Ok(node);
                    }
                    (*hash, locator.clone())
                }
            }
        };
        let node = resolver.resolve_node(&hash, &locator).await?;
        let mut state = self.inner.state.write();
        if let RefState::Detached { cached, .. } = &mut *state {
            *cached = Arc::downgrade(&node);
        }
        Ok(node)
    }
}

impl Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.inner.state.read() {
            RefState::Owned { .. } => f
                .debug_struct("NodeRef::Owned")
                .field("length", &self.inner.length)
                .finish(),
            RefState::Detached { hash, locator, .. } => f
                .debug_struct("NodeRef::Detached")
                .field("hash", hash)
                .field("locator", locator)
                .field("length", &self.inner.length)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ChunkNode, Node};
    use bale_core::BlobId;

    fn leaf_ref(payload: &[u8]) -> NodeRef {
        NodeRef::owned(Node::Chunk(ChunkNode::leaf(payload.to_vec())))
    }

    fn locator(index: u32) -> NodeLocator {
        NodeLocator {
            blob: BlobId::from("blob-00000000"),
            export_index: index,
            export_count: 4,
        }
    }

    #[test]
    fn test_owned_hash_is_cached_and_stable() {
        let r = leaf_ref(b"stable");
        assert_eq!(r.hash(), r.hash());
        assert!(r.is_owned());
        assert_eq!(r.locator(), None);
    }

    #[test]
    fn test_collapse_is_shared_and_one_way() {
        let a = leaf_ref(b"collapse me");
        let b = a.clone();
        let hash = a.hash();

        a.collapse(locator(1));
        assert!(!b.is_owned());
        assert_eq!(b.locator(), Some(locator(1)));
        assert_eq!(b.hash(), hash);

        // Collapsing again (an aliased handle after dedup) keeps the first
        // location.
        b.collapse(locator(2));
        assert_eq!(a.locator(), Some(locator(1)));
    }

    #[tokio::test]
    async fn test_resolve_owned_needs_no_store() {
        let r = leaf_ref(b"resident");
        let node = r.resolve(&NullResolver).await.unwrap();
        match &*node {
            Node::Chunk(c) => assert_eq!(c.payload(), b"resident"),
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_collapsed_hits_weak_cache() {
        let r = leaf_ref(b"still warm");
        // Keep the node alive across the collapse so the weak handle upgrades.
        let resident = r.node_if_resident().unwrap();
        r.collapse(locator(0));
        assert!(!r.is_owned());

        let node = r.resolve(&NullResolver).await.unwrap();
        assert!(Arc::ptr_eq(&node, &resident));
    }

    #[tokio::test]
    async fn test_resolve_cold_detached_fails_without_store() {
        let r = NodeRef::detached(ContentHash::of(b"gone"), locator(0), Some(17));
        assert_eq!(r.length(), Some(17));
        assert!(r.resolve(&NullResolver).await.is_err());
    }

    #[test]
    fn test_table_recovered_reference_has_no_length() {
        let r = NodeRef::detached(ContentHash::of(b"table"), locator(2), None);
        assert_eq!(r.length(), None);
    }
}
