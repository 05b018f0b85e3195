//! Bundle write path.
//!
//! A [`BundleWriter`] is the per-logical-target write context: it
//! deduplicates nodes by content hash, queues them post-order (children
//! before parents), and rotates the queue into asynchronous pack-and-write
//! operations whenever the running raw total would exceed
//! `max_blob_size`. Pack-and-writes for one writer are strictly sequenced:
//! each waits for the previous one to complete before running, so a bundle
//! is only imported by bundles written after it, and a root pointer is
//! published only once everything it depends on is durable.
//!
//! Failure leaves the dirty set intact: a batch whose write fails is put
//! back at the front of the queue, so the next `flush` re-packs it (content
//! identity makes the re-pack equivalent even if laid out differently).
//! On success every queued reference collapses to its export locator under
//! the state lock, releasing the decoded nodes.

use crate::format::{encode_bundle, BundleHeader, Export, Import, ImportEntry, BUNDLE_VERSION};
use crate::packer::PacketPacker;
use crate::store::BundleStore;
use bale_core::{BlobId, ContentHash, Error, NodeLocator, Result, RootPointer};
use bale_tree::{Node, NodeRef};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Worst-case packed size of a node: zstd expansion bound plus framing.
/// Batch rotation uses this so a bundle's compressed payload stays under
/// `max_blob_size` even for incompressible input.
fn packed_cost(encoded_len: usize) -> usize {
    encoded_len + encoded_len / 128 + 64
}

#[derive(Clone)]
struct QueuedNode {
    hash: ContentHash,
    encoded: Arc<Vec<u8>>,
    node: Arc<Node>,
    handle: NodeRef,
}

/// One drain step of `flush`: wait out the in-flight pack-and-write, or
/// claim the next batch and write it inline.
enum FlushStep {
    Wait(oneshot::Receiver<Result<()>>),
    Pack(Vec<QueuedNode>, oneshot::Sender<Result<()>>),
}

/// Split off a queue prefix whose worst-case packed size fits `max` (a
/// single oversized node still travels alone).
fn take_batch(state: &mut WriterState, max: usize) -> Vec<QueuedNode> {
    let mut total = 0usize;
    let mut count = 0usize;
    for node in &state.queue {
        let cost = packed_cost(node.encoded.len());
        if count > 0 && total + cost > max {
            break;
        }
        total += cost;
        count += 1;
    }
    state.pending_bytes -= total.min(state.pending_bytes);
    let rest = state.queue.split_off(count);
    std::mem::replace(&mut state.queue, rest)
}

#[derive(Default)]
struct WriterState {
    /// Content hash → canonical reference handle. Entries persist across
    /// batches; once a handle collapses, later duplicates resolve to its
    /// locator immediately.
    dedup: HashMap<ContentHash, NodeRef>,
    /// Nodes awaiting the next pack-and-write, children before parents.
    queue: Vec<QueuedNode>,
    /// Hashes queued or in flight, not yet durable.
    queued: HashSet<ContentHash>,
    /// Extra owned handles for content that is queued under another handle;
    /// collapsed together with the canonical handle.
    aliases: HashMap<ContentHash, Vec<NodeRef>>,
    /// Worst-case packed bytes of `queue`.
    pending_bytes: usize,
    closed: bool,
}

struct WriterInner {
    store: Arc<BundleStore>,
    state: Mutex<WriterState>,
    /// Completion of the most recently spawned pack-and-write; taken by the
    /// next write (or by `flush`) to sequence after it.
    chain: Mutex<Option<oneshot::Receiver<Result<()>>>>,
}

/// Write context for one logical target.
#[derive(Clone)]
pub struct BundleWriter {
    inner: Arc<WriterInner>,
}

impl std::fmt::Debug for BundleWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BundleWriter")
            .field("queued", &state.queue.len())
            .field("pending_bytes", &state.pending_bytes)
            .field("dedup_entries", &state.dedup.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl BundleWriter {
    pub fn new(store: Arc<BundleStore>) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                store,
                state: Mutex::new(WriterState::default()),
                chain: Mutex::new(None),
            }),
        }
    }

    /// Write one node (children first, via its references).
    ///
    /// Returns the canonical reference for the node's content: a duplicate
    /// of previously written content returns the existing handle and queues
    /// nothing.
    pub fn write_node(&self, node: Node) -> Result<NodeRef> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Error::usage("write_node on a closed writer"));
        }
        let reference = NodeRef::owned(node);
        let hash = reference.hash();
        if let Some(existing) = state.dedup.get(&hash).cloned() {
            return Ok(existing);
        }
        self.queue_ref_locked(&mut state, &reference)?;
        Ok(reference)
    }

    /// Queue everything reachable from `root` that is still in memory, then
    /// pack and durably write it, after all previously rotated batches.
    ///
    /// Concurrent flushes on clones of one writer cooperate: every inline
    /// pack-and-write is registered in the chain just like a rotated batch,
    /// so a flush returns only once the queue is drained and nothing is in
    /// flight, no matter which flush ended up writing its nodes.
    ///
    /// On error the un-written nodes remain queued; calling `flush` again
    /// retries them.
    pub async fn flush(&self, root: &NodeRef) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::usage("flush on a closed writer"));
            }
            self.queue_ref_locked(&mut state, root)?;
        }

        loop {
            // Decide the next step atomically against rotations and other
            // flushes: either wait out the in-flight pack-and-write, or
            // claim the next batch and publish our own chain entry.
            let step = {
                let mut state = self.inner.state.lock();
                let mut chain = self.inner.chain.lock();
                if let Some(previous) = chain.take() {
                    FlushStep::Wait(previous)
                } else if state.queue.is_empty() {
                    return Ok(());
                } else {
                    let max = self.inner.store.options().max_blob_size;
                    let batch = take_batch(&mut state, max);
                    let (tx, rx) = oneshot::channel();
                    *chain = Some(rx);
                    FlushStep::Pack(batch, tx)
                }
            };
            match step {
                FlushStep::Wait(previous) => {
                    // Outcomes were already folded into the queue (failed
                    // batches re-queued themselves), so only an aborted
                    // task is an error here.
                    if previous.await.is_err() {
                        return Err(Error::storage("background bundle write task aborted"));
                    }
                }
                FlushStep::Pack(batch, tx) => {
                    let result = self.inner.pack_and_write(batch).await;
                    let _ = tx.send(result.clone());
                    result?;
                }
            }
        }
    }

    /// Flush `root` and publish it under `name` through the collaborator's
    /// ref primitive. The ref is advanced only after every bundle the root
    /// transitively depends on is durable.
    pub async fn commit(&self, name: &str, root: &NodeRef) -> Result<RootPointer> {
        self.flush(root).await?;
        let locator = root
            .locator()
            .ok_or_else(|| Error::usage("root is not durable after flush"))?;
        let length = root
            .length()
            .ok_or_else(|| Error::usage("root length is unknown"))?;
        let pointer = RootPointer {
            hash: root.hash(),
            locator: locator.clone(),
            length,
        };
        self.inner
            .store
            .backend()
            .write_ref(name, &pointer.encode(), std::slice::from_ref(&locator.blob))
            .await?;
        tracing::debug!(name, root = %pointer.hash, blob = %locator.blob, "committed root");
        Ok(pointer)
    }

    /// Mark the writer finished. Later writes and flushes fail with a usage
    /// error. Queued-but-unflushed nodes are dropped.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.queue.clear();
        state.pending_bytes = 0;
    }

    /// Recursively queue an owned reference after its children, rotating
    /// the queue whenever the batch bound would be exceeded.
    fn queue_ref_locked(&self, state: &mut WriterState, reference: &NodeRef) -> Result<()> {
        if !reference.is_owned() {
            return Ok(());
        }
        let hash = reference.hash();
        if let Some(existing) = state.dedup.get(&hash) {
            if !existing.ptr_eq(reference) {
                // Duplicate content under a second handle: collapse it now
                // if the canonical copy is durable, otherwise alias it to
                // collapse together.
                match existing.locator() {
                    Some(locator) => reference.collapse(locator),
                    None => state.aliases.entry(hash).or_default().push(reference.clone()),
                }
            }
            return Ok(());
        }

        let node = reference
            .node_if_resident()
            .ok_or_else(|| Error::usage("owned reference lost its node"))?;
        for child in node.refs() {
            self.queue_ref_locked(state, child)?;
        }

        let encoded = Arc::new(node.encode());
        let cost = packed_cost(encoded.len());
        if !state.queue.is_empty()
            && state.pending_bytes + cost > self.inner.store.options().max_blob_size
        {
            self.rotate_locked(state);
        }
        state.pending_bytes += cost;
        state.queue.push(QueuedNode {
            hash,
            encoded,
            node,
            handle: reference.clone(),
        });
        state.queued.insert(hash);
        state.dedup.insert(hash, reference.clone());
        Ok(())
    }

    /// Hand the current queue to a background pack-and-write, sequenced
    /// after the previous one.
    fn rotate_locked(&self, state: &mut WriterState) {
        if state.queue.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut state.queue);
        state.pending_bytes = 0;

        let previous = self.inner.chain.lock().take();
        let (tx, rx) = oneshot::channel();
        *self.inner.chain.lock() = Some(rx);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Some(previous) = previous {
                // Sequencing only; a failed batch already re-queued itself
                // and surfaces when its nodes are flushed.
                let _ = previous.await;
            }
            let result = inner.pack_and_write(batch).await;
            let _ = tx.send(result);
        });
    }
}

struct PackedBundle {
    bytes: Vec<u8>,
    import_blobs: Vec<BlobId>,
    /// Batch indices in export order.
    export_order: Vec<usize>,
    raw_bytes: u64,
    compressed_bytes: u64,
}

impl WriterInner {
    async fn pack_and_write(&self, batch: Vec<QueuedNode>) -> Result<()> {
        let packed = match self.pack(&batch) {
            Ok(packed) => packed,
            Err(err) => {
                self.requeue(batch);
                return Err(err);
            }
        };
        match self
            .store
            .backend()
            .write_blob(&packed.bytes, &packed.import_blobs)
            .await
        {
            Ok(blob) => {
                self.complete(&batch, &packed, blob);
                Ok(())
            }
            Err(err) => {
                self.requeue(batch);
                Err(err)
            }
        }
    }

    /// Build the bundle blob for a batch: dependency-order the exports,
    /// collect the import table, pack the payload.
    fn pack(&self, batch: &[QueuedNode]) -> Result<PackedBundle> {
        // Normalize to children-first order. The queue is already
        // post-order in normal operation; after failure re-queueing it may
        // not be.
        let index_of: HashMap<ContentHash, usize> = batch
            .iter()
            .enumerate()
            .map(|(i, n)| (n.hash, i))
            .collect();
        let mut export_order = Vec::with_capacity(batch.len());
        let mut placed: HashSet<ContentHash> = HashSet::with_capacity(batch.len());
        fn place(
            i: usize,
            batch: &[QueuedNode],
            index_of: &HashMap<ContentHash, usize>,
            placed: &mut HashSet<ContentHash>,
            order: &mut Vec<usize>,
        ) {
            if !placed.insert(batch[i].hash) {
                return;
            }
            for child in batch[i].node.refs() {
                if let Some(&j) = index_of.get(&child.hash()) {
                    place(j, batch, index_of, placed, order);
                }
            }
            order.push(i);
        }
        for i in 0..batch.len() {
            place(i, batch, &index_of, &mut placed, &mut export_order);
        }

        // Imports: every referenced node outside the batch, grouped by its
        // owning bundle, listing only the entries actually used.
        let mut import_blobs: Vec<BlobId> = Vec::new();
        let mut imports: HashMap<BlobId, (u32, Vec<ImportEntry>, HashMap<u32, usize>)> =
            HashMap::new();
        for &i in &export_order {
            for child in batch[i].node.refs() {
                if index_of.contains_key(&child.hash()) {
                    continue;
                }
                let locator = child.locator().ok_or_else(|| {
                    Error::storage("bundle write depends on a node that is not yet durable")
                })?;
                let entry = imports.entry(locator.blob.clone()).or_insert_with(|| {
                    import_blobs.push(locator.blob.clone());
                    (locator.export_count, Vec::new(), HashMap::new())
                });
                if !entry.2.contains_key(&locator.export_index) {
                    entry.2.insert(locator.export_index, entry.1.len());
                    entry.1.push(ImportEntry {
                        local_index: locator.export_index,
                        hash: child.hash(),
                    });
                }
            }
        }

        // Combined reference table layout: imported entries in declaration
        // order, then exports.
        let mut entry_base: HashMap<BlobId, usize> = HashMap::new();
        let mut base = 0usize;
        let mut import_table = Vec::with_capacity(import_blobs.len());
        for blob in &import_blobs {
            let (export_count, entries, _) = match imports.get(blob) {
                Some(entry) => entry,
                None => return Err(Error::usage("import bookkeeping out of sync")),
            };
            entry_base.insert(blob.clone(), base);
            base += entries.len();
            import_table.push(Import {
                blob: blob.clone(),
                export_count: *export_count,
                entries: entries.clone(),
            });
        }
        let import_entry_total = base;

        let export_index: HashMap<ContentHash, usize> = export_order
            .iter()
            .enumerate()
            .map(|(pos, &i)| (batch[i].hash, pos))
            .collect();

        let mut exports = Vec::with_capacity(export_order.len());
        let mut packer = PacketPacker::new(
            self.store.options().min_packet_size,
            self.store.options().compression_level,
        );
        for &i in &export_order {
            let queued = &batch[i];
            let mut refs = Vec::with_capacity(queued.node.refs().len());
            for child in queued.node.refs() {
                let hash = child.hash();
                let idx = if let Some(&pos) = export_index.get(&hash) {
                    import_entry_total + pos
                } else {
                    let locator = child.locator().ok_or_else(|| {
                        Error::storage("bundle write depends on a node that is not yet durable")
                    })?;
                    let base = entry_base
                        .get(&locator.blob)
                        .copied()
                        .ok_or_else(|| Error::usage("import bookkeeping out of sync"))?;
                    let position = imports
                        .get(&locator.blob)
                        .and_then(|(_, _, positions)| positions.get(&locator.export_index))
                        .copied()
                        .ok_or_else(|| Error::usage("import bookkeeping out of sync"))?;
                    base + position
                };
                refs.push(idx as u32);
            }
            exports.push(Export {
                hash: queued.hash,
                length: queued.encoded.len() as u64,
                refs,
            });
            packer.add_node(&queued.encoded)?;
        }

        let (packets, payload, raw_bytes) = packer.finish()?;
        let header = BundleHeader {
            version: BUNDLE_VERSION,
            imports: import_table,
            exports,
            packets,
        };
        let compressed_bytes = payload.len() as u64;
        let bytes = encode_bundle(&header, &payload);
        Ok(PackedBundle {
            bytes,
            import_blobs,
            export_order,
            raw_bytes,
            compressed_bytes,
        })
    }

    /// A batch is durable: collapse every handle (and its aliases) to its
    /// export locator and drop the nodes from the dirty set, all under the
    /// state lock so concurrent writers observe a consistent view.
    fn complete(&self, batch: &[QueuedNode], packed: &PackedBundle, blob: BlobId) {
        let export_count = packed.export_order.len() as u32;
        let mut state = self.state.lock();
        for (position, &i) in packed.export_order.iter().enumerate() {
            let queued = &batch[i];
            let locator = NodeLocator {
                blob: blob.clone(),
                export_index: position as u32,
                export_count,
            };
            queued.handle.collapse(locator.clone());
            if let Some(aliases) = state.aliases.remove(&queued.hash) {
                for alias in aliases {
                    alias.collapse(locator.clone());
                }
            }
            state.queued.remove(&queued.hash);
        }
        drop(state);

        self.store.stats_handle().record_bundle_write(
            batch.len() as u64,
            packed.raw_bytes,
            packed.compressed_bytes,
        );
        tracing::debug!(
            blob = %blob,
            nodes = batch.len(),
            imports = packed.import_blobs.len(),
            raw_bytes = packed.raw_bytes,
            compressed_bytes = packed.compressed_bytes,
            "wrote bundle"
        );
    }

    /// A pack or write failed: put the batch back at the front of the queue
    /// (its nodes precede anything queued later) so a retry re-packs it.
    fn requeue(&self, batch: Vec<QueuedNode>) {
        let mut state = self.state.lock();
        let restored: usize = batch.iter().map(|n| packed_cost(n.encoded.len())).sum();
        let mut rest = std::mem::replace(&mut state.queue, batch);
        state.queue.append(&mut rest);
        state.pending_bytes += restored;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::decode_bundle;
    use crate::store::StoreOptions;
    use bale_core::MemoryBlobStore;
    use bale_tree::{copy_tree_to, ChunkNode, ChunkTree, ChunkingOptions, DirectoryTree, FileEntry};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn small_store(backend: &MemoryBlobStore, max_blob_size: usize) -> Arc<BundleStore> {
        let opts = StoreOptions {
            max_blob_size,
            min_packet_size: 4 * 1024,
            ..StoreOptions::default()
        };
        Arc::new(BundleStore::new(Arc::new(backend.clone()), opts).unwrap())
    }

    fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen()).collect()
    }

    fn chunk_tree(data: &[u8]) -> bale_tree::NodeRef {
        let opts = ChunkingOptions {
            min_size: 1024,
            target_size: 4 * 1024,
            max_size: 16 * 1024,
            window_size: 32,
        };
        let mut tree = ChunkTree::new(opts).unwrap();
        tree.append(data).unwrap();
        tree.finalize().unwrap()
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let backend = MemoryBlobStore::new();
        let store = small_store(&backend, 1 << 20);
        let writer = BundleWriter::new(Arc::clone(&store));

        let data = random_bytes(1, 50 * 1024);
        let root = chunk_tree(&data);
        writer.flush(&root).await.unwrap();
        assert!(!root.is_owned());

        let mut out = Vec::new();
        copy_tree_to(&root, &*store, &mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_dedup_single_export_two_references() {
        let backend = MemoryBlobStore::new();
        let store = small_store(&backend, 1 << 20);
        let writer = BundleWriter::new(Arc::clone(&store));

        // Two identical 10 KiB files in one directory.
        let content = random_bytes(2, 10 * 1024);
        let mut dir = DirectoryTree::new();
        dir.add_file("a.bin", FileEntry::new(chunk_tree(&content), 0).unwrap(), &*store)
            .await
            .unwrap();
        dir.add_file("b.bin", FileEntry::new(chunk_tree(&content), 0).unwrap(), &*store)
            .await
            .unwrap();
        let root = dir.finalize().unwrap();
        writer.flush(&root).await.unwrap();

        let locator = root.locator().unwrap();
        let bytes = store.read_bundle(&locator.blob).await.unwrap();
        let (header, _) = decode_bundle(&bytes).unwrap();

        let file_hash = chunk_tree(&content).hash();
        let matching = header
            .exports
            .iter()
            .filter(|e| e.hash == file_hash)
            .count();
        assert_eq!(matching, 1, "identical files must share one export");

        // The directory export references that one entry twice.
        let dir_export = &header.exports[locator.export_index as usize];
        assert_eq!(dir_export.refs.len(), 2);
        assert_eq!(dir_export.refs[0], dir_export.refs[1]);
    }

    #[tokio::test]
    async fn test_duplicate_write_node_returns_existing_handle() {
        let backend = MemoryBlobStore::new();
        let store = small_store(&backend, 1 << 20);
        let writer = BundleWriter::new(store);

        let a = writer
            .write_node(Node::Chunk(ChunkNode::leaf(b"same".to_vec())))
            .unwrap();
        let b = writer
            .write_node(Node::Chunk(ChunkNode::leaf(b"same".to_vec())))
            .unwrap();
        assert!(a.ptr_eq(&b));
    }

    #[tokio::test]
    async fn test_batch_rotation_respects_blob_bound() {
        let backend = MemoryBlobStore::new();
        let max = 128 * 1024;
        let store = small_store(&backend, max);
        let writer = BundleWriter::new(Arc::clone(&store));

        // ~400 KiB of incompressible leaves forces several rotations.
        let mut leaves = Vec::new();
        for i in 0..20u64 {
            let leaf = Node::Chunk(ChunkNode::leaf(random_bytes(100 + i, 20 * 1024)));
            leaves.push(writer.write_node(leaf).unwrap());
        }
        let parent = writer
            .write_node(Node::Chunk(ChunkNode::interior(1, leaves.clone()).unwrap()))
            .unwrap();
        writer.flush(&parent).await.unwrap();

        assert!(backend.blob_count() >= 3);
        for leaf in &leaves {
            let locator = leaf.locator().unwrap();
            let bytes = store.read_bundle(&locator.blob).await.unwrap();
            let (_, payload) = decode_bundle(&bytes).unwrap();
            assert!(
                payload.len() <= max,
                "payload of {} exceeds bound {max}",
                payload.len()
            );
        }
    }

    #[tokio::test]
    async fn test_single_oversized_node_is_written_alone() {
        let backend = MemoryBlobStore::new();
        let store = small_store(&backend, 64 * 1024);
        let writer = BundleWriter::new(store);

        let big = Node::Chunk(ChunkNode::leaf(random_bytes(7, 256 * 1024)));
        let reference = writer.write_node(big).unwrap();
        writer.flush(&reference).await.unwrap();

        let locator = reference.locator().unwrap();
        assert_eq!(locator.export_index, 0);
        assert_eq!(locator.export_count, 1);
    }

    #[tokio::test]
    async fn test_import_tables_span_bundles() {
        let backend = MemoryBlobStore::new();
        let store = small_store(&backend, 32 * 1024);
        let writer = BundleWriter::new(Arc::clone(&store));

        // Children land in earlier bundles than the parent.
        let data = random_bytes(11, 200 * 1024);
        let root = chunk_tree(&data);
        writer.flush(&root).await.unwrap();

        let locator = root.locator().unwrap();
        let bytes = store.read_bundle(&locator.blob).await.unwrap();
        let (header, _) = decode_bundle(&bytes).unwrap();
        assert!(
            !header.imports.is_empty(),
            "root bundle must import earlier bundles"
        );
        for import in &header.imports {
            for entry in &import.entries {
                assert!(entry.local_index < import.export_count);
            }
        }

        // And the whole tree still reads back.
        let mut out = Vec::new();
        copy_tree_to(&root, &*store, &mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_commit_and_load_root() {
        let backend = MemoryBlobStore::new();
        let store = small_store(&backend, 1 << 20);
        let writer = BundleWriter::new(Arc::clone(&store));

        let data = random_bytes(13, 40 * 1024);
        let root = chunk_tree(&data);
        let pointer = writer.commit("heads/main", &root).await.unwrap();
        assert_eq!(pointer.length, data.len() as u64);

        // A fresh store over the same backend sees the committed tree.
        let cold = small_store(&backend, 1 << 20);
        let loaded = cold.load_root("heads/main").await.unwrap();
        assert_eq!(loaded.hash(), root.hash());
        assert_eq!(loaded.length(), Some(data.len() as u64));

        let mut out = Vec::new();
        copy_tree_to(&loaded, &*cold, &mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_closed_writer_rejects_work() {
        let backend = MemoryBlobStore::new();
        let store = small_store(&backend, 1 << 20);
        let writer = BundleWriter::new(store);

        writer.close();
        let err = writer
            .write_node(Node::Chunk(ChunkNode::leaf(b"late".to_vec())))
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)));

        let root = chunk_tree(b"late too");
        let err = writer.flush(&root).await.unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[tokio::test]
    async fn test_flush_of_unchanged_root_is_a_noop() {
        let backend = MemoryBlobStore::new();
        let store = small_store(&backend, 1 << 20);
        let writer = BundleWriter::new(Arc::clone(&store));

        let root = chunk_tree(&random_bytes(17, 20 * 1024));
        writer.commit("heads/main", &root).await.unwrap();
        let blobs_before = backend.blob_count();

        writer.commit("heads/main", &root).await.unwrap();
        assert_eq!(backend.blob_count(), blobs_before);
    }

    /// Backend whose blob writes take long enough for flushes to overlap.
    #[derive(Debug, Clone)]
    struct SlowBlobStore {
        inner: MemoryBlobStore,
        delay: std::time::Duration,
    }

    #[async_trait::async_trait]
    impl bale_core::BlobStore for SlowBlobStore {
        async fn read_blob(&self, id: &BlobId) -> Result<Vec<u8>> {
            self.inner.read_blob(id).await
        }

        async fn write_blob(&self, data: &[u8], imports: &[BlobId]) -> Result<BlobId> {
            tokio::time::sleep(self.delay).await;
            self.inner.write_blob(data, imports).await
        }

        async fn read_ref(&self, name: &str) -> Result<Vec<u8>> {
            self.inner.read_ref(name).await
        }

        async fn write_ref(&self, name: &str, value: &[u8], imports: &[BlobId]) -> Result<()> {
            self.inner.write_ref(name, value, imports).await
        }

        async fn has_ref(&self, name: &str) -> Result<bool> {
            self.inner.has_ref(name).await
        }

        async fn delete_ref(&self, name: &str) -> Result<()> {
            self.inner.delete_ref(name).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_flushes_wait_for_durability() {
        let backend = SlowBlobStore {
            inner: MemoryBlobStore::new(),
            delay: std::time::Duration::from_millis(50),
        };
        let store =
            Arc::new(BundleStore::new(Arc::new(backend), StoreOptions::default()).unwrap());
        let writer = BundleWriter::new(store);

        // Two independent subtrees flushed from two tasks on clones of one
        // writer. Whichever flush ends up packing the other's nodes, each
        // call must not return before its own root is durable.
        let leaves: Vec<NodeRef> = (0..4u64)
            .map(|i| {
                writer
                    .write_node(Node::Chunk(ChunkNode::leaf(random_bytes(200 + i, 8 * 1024))))
                    .unwrap()
            })
            .collect();
        let parent_a = writer
            .write_node(Node::Chunk(ChunkNode::interior(1, leaves[..2].to_vec()).unwrap()))
            .unwrap();
        let parent_b = writer
            .write_node(Node::Chunk(ChunkNode::interior(1, leaves[2..].to_vec()).unwrap()))
            .unwrap();

        let mut tasks = Vec::new();
        for parent in [parent_a, parent_b] {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                writer.flush(&parent).await.unwrap();
                assert!(
                    parent.locator().is_some(),
                    "flush returned before the root was durable"
                );
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }
}
