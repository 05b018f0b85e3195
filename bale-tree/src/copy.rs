//! Streaming extraction of a content tree's bytes.

use crate::node::Node;
use crate::node_ref::{NodeRef, NodeResolver};
use bale_core::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Write the raw content beneath `root` to `out`, in order.
///
/// Nodes are resolved one at a time during the in-order walk, so memory use
/// is bounded by the tree height times the chunk size regardless of the
/// content's total length. Fails with a usage error on a directory node;
/// directories are traversed by path, not copied as a byte stream.
pub async fn copy_tree_to<W>(
    root: &NodeRef,
    resolver: &dyn NodeResolver,
    out: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let node = root.resolve(resolver).await?;
    copy_node(node, resolver, out).await
}

fn copy_node<'a, W>(
    node: Arc<Node>,
    resolver: &'a dyn NodeResolver,
    out: &'a mut W,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>
where
    W: AsyncWrite + Unpin + Send,
{
    Box::pin(async move {
        match &*node {
            Node::Chunk(chunk) => {
                if chunk.is_leaf() {
                    out.write_all(chunk.payload()).await?;
                    return Ok(());
                }
                for child in chunk.children() {
                    let child_node = child.resolve(resolver).await?;
                    copy_node(child_node, resolver, out).await?;
                }
                Ok(())
            }
            Node::Directory(_) => Err(Error::usage(
                "cannot copy a directory node as a byte stream",
            )),
        }
    })
}
