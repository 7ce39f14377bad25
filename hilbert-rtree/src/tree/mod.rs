//! The Hilbert R-Tree façade and its structural algorithms.
//!
//! A tree owns a node store (file-backed or in-memory), an element
//! mapper and the parameters fixed at creation time: coordinate
//! reference system, node fan-out and cell capacity. All mutating
//! operations go through `&self` with interior locking; the design is
//! single-writer, and a search racing a concurrent writer is an
//! accepted limitation, not something the locks try to prevent.

mod packing;
mod search;

pub use packing::RebuildStats;
pub use search::{Search, SearchIter};

use parking_lot::RwLock;

use crate::envelope::{Crs, Envelope};
use crate::mapper::ElementMapper;
use crate::store::constants::MIN_CAPACITY;
use crate::store::types::{
    ChildLink, EntryId, FreeRecord, IndexResult, Node, NodeId, StoreHeader, StoreIndexError,
};
use crate::store::{FileStore, MemoryStore, NodeStore};

/// A Hilbert-curve-ordered R-Tree over a persistent node store.
pub struct HilbertRTree<M: ElementMapper> {
    store: Box<dyn NodeStore>,
    header: RwLock<StoreHeader>,
    mapper: RwLock<M>,
    closed: RwLock<bool>,
    crs: Crs,
    node_capacity: u32,
    cell_capacity: u32,
}

impl<M: ElementMapper> HilbertRTree<M> {
    /// Wraps an already constructed store whose header has been
    /// validated.
    fn with_store(store: Box<dyn NodeStore>, header: StoreHeader, mapper: M) -> Self {
        Self {
            crs: header.crs,
            node_capacity: header.node_capacity,
            cell_capacity: header.cell_capacity,
            store,
            header: RwLock::new(header),
            mapper: RwLock::new(mapper),
            closed: RwLock::new(false),
        }
    }

    fn validated_header(crs: Crs, node_capacity: u32, cell_capacity: u32) -> IndexResult<StoreHeader> {
        if node_capacity < MIN_CAPACITY || cell_capacity < MIN_CAPACITY {
            return Err(StoreIndexError::InvalidArgument(format!(
                "capacities must be at least {}, got {}/{}",
                MIN_CAPACITY, node_capacity, cell_capacity
            )));
        }
        Ok(StoreHeader::new(crs, node_capacity, cell_capacity))
    }

    /// Creates an empty tree backed by an in-memory store.
    pub fn create_in_memory(
        mapper: M,
        crs: Crs,
        node_capacity: u32,
        cell_capacity: u32,
    ) -> IndexResult<Self> {
        let header = Self::validated_header(crs, node_capacity, cell_capacity)?;
        let store = MemoryStore::create(&header)?;
        Ok(Self::with_store(Box::new(store), header, mapper))
    }

    /// Creates an empty tree in a fresh store file, truncating any
    /// existing content at `path`.
    pub fn create_on_disk(
        path: &std::path::Path,
        mapper: M,
        crs: Crs,
        node_capacity: u32,
        cell_capacity: u32,
    ) -> IndexResult<Self> {
        let header = Self::validated_header(crs, node_capacity, cell_capacity)?;
        let store = FileStore::create(path, &header)?;
        Ok(Self::with_store(Box::new(store), header, mapper))
    }

    /// Opens an existing store file, adopting the dimensionality and
    /// capacities recorded in its header. Opening a store that holds
    /// zero entries is fully supported and performs no writes.
    pub fn open(path: &std::path::Path, mapper: M) -> IndexResult<Self> {
        let (store, header) = FileStore::open(path)?;
        Ok(Self::with_store(Box::new(store), header, mapper))
    }

    /// Wraps a caller-provided store implementation. The header is read
    /// and validated; its parameters win over anything the caller
    /// believes about the store.
    pub fn from_parts(store: Box<dyn NodeStore>, mapper: M) -> IndexResult<Self> {
        let header = store.read_header()?;
        header.validate()?;
        Ok(Self::with_store(store, header, mapper))
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    pub fn node_capacity(&self) -> u32 {
        self.node_capacity
    }

    pub fn cell_capacity(&self) -> u32 {
        self.cell_capacity
    }

    /// Number of live data entries.
    pub fn len(&self) -> u64 {
        self.header.read().entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tree height: `0` when empty, `1` for a single leaf root.
    pub fn height(&self) -> u32 {
        self.header.read().height
    }

    pub(crate) fn check_closed(&self) -> IndexResult<()> {
        if *self.closed.read() {
            Err(StoreIndexError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_envelope(&self, envelope: &Envelope) -> IndexResult<()> {
        if envelope.dim() != self.crs.dim {
            return Err(StoreIndexError::InvalidArgument(format!(
                "envelope dimensionality {:?} does not match the tree's {:?}",
                envelope.dim(),
                self.crs.dim
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Node plumbing
    // ========================================================================

    /// Pops a recycled slot off the free chain, or extends the store.
    pub(super) fn allocate_node(&self) -> IndexResult<NodeId> {
        let mut header = self.header.write();
        if header.free_head != 0 {
            let id = header.free_head;
            let free = self.store.read_free(id)?;
            header.free_head = free.next_free;
            header.free_count = header.free_count.saturating_sub(1);
            Ok(id)
        } else {
            let id = header.next_id;
            header.next_id += 1;
            Ok(id)
        }
    }

    /// Pushes a slot onto the free chain for reuse.
    fn free_node(&self, id: NodeId) -> IndexResult<()> {
        let mut header = self.header.write();
        self.store.write_free(
            id,
            &FreeRecord {
                next_free: header.free_head,
            },
        )?;
        header.free_head = id;
        header.free_count += 1;
        Ok(())
    }

    /// Follows the sibling chain starting at `node`'s first child.
    pub(super) fn read_children(&self, node: &Node) -> IndexResult<Vec<Node>> {
        let mut out = Vec::new();
        let limit = self.header.read().next_id;
        let mut next = node.first_child();
        while let Some(id) = next {
            if out.len() as u64 >= limit {
                return Err(StoreIndexError::Corrupt(format!(
                    "sibling chain under node {} does not terminate",
                    node.id
                )));
            }
            let child = self.store.read_node(id)?;
            next = (child.sibling != 0).then_some(child.sibling);
            out.push(child);
        }
        Ok(out)
    }

    /// Relinks `children` as `parent`'s child list and writes every
    /// touched record.
    pub(super) fn write_chain(&self, parent: &mut Node, children: &mut [Node]) -> IndexResult<()> {
        for i in 0..children.len() {
            children[i].sibling = if i + 1 < children.len() {
                children[i + 1].id
            } else {
                0
            };
        }
        parent.child = match children.first() {
            Some(first) => ChildLink::Node(first.id),
            None => ChildLink::None,
        };
        for child in children.iter() {
            self.store.write_node(child)?;
        }
        self.store.write_node(parent)
    }

    /// Applies the union of the live children (or the tombstone flag)
    /// to a container node.
    pub(super) fn refresh_boundary(node: &mut Node, children: &[Node]) {
        match live_union(children) {
            Some(boundary) => {
                node.boundary = boundary;
                node.flags.empty = false;
            }
            None => node.flags.empty = true,
        }
    }

    // ========================================================================
    // Insert
    // ========================================================================

    /// Stores an object under a freshly assigned id and indexes its
    /// envelope.
    pub fn add(&self, item: M::Item, envelope: &Envelope) -> IndexResult<EntryId> {
        self.check_closed()?;
        self.check_envelope(envelope)?;
        let id = self.mapper.write().store(item, *envelope)?;
        self.insert_entry(id, envelope)?;
        Ok(id)
    }

    /// Indexes an envelope under an externally supplied id.
    pub fn insert(&self, id: EntryId, item: M::Item, envelope: &Envelope) -> IndexResult<()> {
        self.check_closed()?;
        self.check_envelope(envelope)?;
        self.mapper.write().bind(id, item, *envelope)?;
        self.insert_entry(id, envelope)
    }

    fn insert_entry(&self, id: EntryId, envelope: &Envelope) -> IndexResult<()> {
        let root = self.header.read().root;

        if root == 0 {
            // Empty tree: entry, enclosing cell, leaf root.
            let entry_id = self.allocate_node()?;
            let cell_id = self.allocate_node()?;
            let leaf_id = self.allocate_node()?;

            let mut entries = [Node::entry(entry_id, id, *envelope)];
            let mut cell = Node::cell(cell_id, *envelope);
            self.write_chain(&mut cell, &mut entries)?;
            let mut leaf = Node::leaf(leaf_id, *envelope);
            self.write_chain(&mut leaf, &mut [cell])?;

            let mut header = self.header.write();
            header.root = leaf_id;
            header.height = 1;
            header.entry_count += 1;
            self.store.write_header(&header)?;
            return Ok(());
        }

        // Descend to a leaf, remembering the path of internal nodes.
        let mut path: Vec<NodeId> = Vec::new();
        let mut current = root;
        loop {
            let node = self.store.read_node(current)?;
            if node.is_leaf() {
                break;
            }
            if !node.is_internal() {
                return Err(StoreIndexError::Corrupt(format!(
                    "descent reached node {} which is neither internal nor leaf",
                    node.id
                )));
            }
            path.push(current);
            current = self.choose_child(&node, envelope)?;
        }

        let split = self.insert_into_leaf(current, id, envelope)?;
        self.propagate(&path, current, split)?;

        let mut header = self.header.write();
        header.entry_count += 1;
        self.store.write_header(&header)?;
        Ok(())
    }

    /// Picks the child whose boundary needs the least enlargement, ties
    /// broken by smallest resulting measure, then lowest identifier.
    fn choose_child(&self, node: &Node, envelope: &Envelope) -> IndexResult<NodeId> {
        let children = self.read_children(node)?;
        let mut best: Option<(f64, f64, NodeId)> = None;
        for child in children.iter().filter(|c| !c.is_empty()) {
            let enlargement = child.boundary.enlargement(envelope);
            let resulting = child.boundary.union(envelope).measure();
            let candidate = (enlargement, resulting, child.id);
            let better = match best {
                None => true,
                Some((e, r, i)) => {
                    enlargement < e
                        || (enlargement == e && (resulting < r || (resulting == r && child.id < i)))
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        match best {
            Some((_, _, id)) => Ok(id),
            // Fully tombstoned subtree: descend into the first child and
            // let the leaf level revive a cell.
            None => children.first().map(|c| c.id).ok_or_else(|| {
                StoreIndexError::Corrupt(format!("internal node {} has no children", node.id))
            }),
        }
    }

    /// Walks the insertion path bottom-up, re-unioning boundaries and
    /// absorbing a split sibling if the leaf level produced one. A split
    /// that bubbles past the old root grows the tree by one level.
    fn propagate(
        &self,
        path: &[NodeId],
        mut child_id: NodeId,
        mut split: Option<Node>,
    ) -> IndexResult<()> {
        for &parent_id in path.iter().rev() {
            let mut parent = self.store.read_node(parent_id)?;
            let mut children = self.read_children(&parent)?;

            if let Some(new_sibling) = split.take() {
                let at = children
                    .iter()
                    .position(|c| c.id == child_id)
                    .ok_or_else(|| {
                        StoreIndexError::Corrupt(format!(
                            "node {} is not a child of {}",
                            child_id, parent_id
                        ))
                    })?;
                children.insert(at + 1, new_sibling);

                if children.len() > self.node_capacity as usize {
                    let mid = (children.len() + 1) / 2;
                    let mut right_children = children.split_off(mid);
                    let right_id = self.allocate_node()?;
                    let mut right = Node::internal(right_id, right_children[0].boundary);
                    Self::refresh_boundary(&mut right, &right_children);
                    self.write_chain(&mut right, &mut right_children)?;
                    log::trace!("split internal node {} into {}", parent_id, right_id);
                    split = Some(right);
                }
            }

            Self::refresh_boundary(&mut parent, &children);
            self.write_chain(&mut parent, &mut children)?;
            child_id = parent_id;
        }

        if let Some(new_sibling) = split {
            let old_root_id = self.header.read().root;
            let old_root = self.store.read_node(old_root_id)?;
            let new_root_id = self.allocate_node()?;
            let mut new_root = Node::internal(new_root_id, old_root.boundary);
            let mut children = [old_root, new_sibling];
            Self::refresh_boundary(&mut new_root, &children);
            self.write_chain(&mut new_root, &mut children)?;

            let mut header = self.header.write();
            header.root = new_root_id;
            header.height += 1;
            log::debug!("root split; height is now {}", header.height);
        }
        Ok(())
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Removes the entry for `id`. Returns `Ok(false)` when the id is
    /// unknown; that is a normal negative result, not an error. The cell
    /// and leaf that held the entry are tombstoned in place when they
    /// run empty and stay linked until a rebuild.
    pub fn delete(&self, id: EntryId) -> IndexResult<bool> {
        self.check_closed()?;
        let envelope = match self.mapper.read().envelope(id)? {
            Some(envelope) => envelope,
            None => return Ok(false),
        };
        let root = self.header.read().root;
        if root == 0 {
            return Ok(false);
        }

        if !self.delete_below(root, id, &envelope)? {
            return Ok(false);
        }

        self.mapper.write().remove(id)?;
        let mut header = self.header.write();
        header.entry_count = header.entry_count.saturating_sub(1);
        self.store.write_header(&header)?;
        Ok(true)
    }

    fn delete_below(&self, node_id: NodeId, id: EntryId, envelope: &Envelope) -> IndexResult<bool> {
        let mut node = self.store.read_node(node_id)?;
        if node.is_empty() || !node.boundary.intersects(envelope) {
            return Ok(false);
        }

        if node.is_leaf() {
            let mut cells = self.read_children(&node)?;
            for i in 0..cells.len() {
                if cells[i].is_empty() || !cells[i].boundary.intersects(envelope) {
                    continue;
                }
                let mut entries = self.read_children(&cells[i])?;
                let Some(at) = entries.iter().position(|e| e.entry_id() == Some(id)) else {
                    continue;
                };
                let removed = entries.remove(at);
                Self::refresh_boundary(&mut cells[i], &entries);
                self.write_chain(&mut cells[i], &mut entries)?;
                self.free_node(removed.id)?;

                Self::refresh_boundary(&mut node, &cells);
                self.store.write_node(&node)?;
                return Ok(true);
            }
            return Ok(false);
        }

        let children = self.read_children(&node)?;
        for child in &children {
            if child.is_empty() || !child.boundary.intersects(envelope) {
                continue;
            }
            if self.delete_below(child.id, id, envelope)? {
                // Re-read: the subtree rewrote the child record.
                let fresh = self.read_children(&node)?;
                Self::refresh_boundary(&mut node, &fresh);
                self.store.write_node(&node)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Looks up the mapped object and envelope for an id.
    pub fn get(&self, id: EntryId) -> IndexResult<Option<(M::Item, Envelope)>> {
        self.check_closed()?;
        self.mapper.read().get(id)
    }

    /// Drops all entries, resetting the store to an empty tree with the
    /// same parameters.
    pub fn clear(&self) -> IndexResult<()> {
        self.check_closed()?;
        self.store.truncate()?;
        let mut header = self.header.write();
        *header = StoreHeader::new(self.crs, self.node_capacity, self.cell_capacity);
        self.store.write_header(&header)?;
        self.store.sync()?;
        self.mapper.write().clear()
    }

    /// Flushes the mapper and header and releases the underlying
    /// channel. Closing twice is a no-op.
    pub fn close(&self) -> IndexResult<()> {
        let mut closed = self.closed.write();
        if *closed {
            return Ok(());
        }
        self.mapper.write().flush()?;
        self.store.write_header(&self.header.read())?;
        self.store.release()?;
        *closed = true;
        Ok(())
    }

    // ========================================================================
    // Integrity
    // ========================================================================

    /// Walks the whole tree verifying the structural invariant: every
    /// container's boundary equals the union of its live children's
    /// boundaries. A violation is reported as corruption, never
    /// repaired silently.
    pub fn check_integrity(&self) -> IndexResult<()> {
        self.check_closed()?;
        let header = *self.header.read();
        header.validate()?;
        if header.root == 0 {
            if header.entry_count != 0 {
                return Err(StoreIndexError::Corrupt(format!(
                    "empty tree claims {} entries",
                    header.entry_count
                )));
            }
            return Ok(());
        }
        let root = self.store.read_node(header.root)?;
        if root.is_cell() || root.is_entry() {
            return Err(StoreIndexError::Corrupt(format!(
                "root {} is not a leaf or internal node",
                root.id
            )));
        }
        let counted = self.verify_subtree(&root)?;
        if counted != header.entry_count {
            return Err(StoreIndexError::Corrupt(format!(
                "header claims {} entries but the tree holds {}",
                header.entry_count, counted
            )));
        }
        Ok(())
    }

    fn verify_subtree(&self, node: &Node) -> IndexResult<u64> {
        if node.is_entry() {
            return Ok(1);
        }
        let children = self.read_children(node)?;
        for child in &children {
            let role_ok = if node.is_cell() {
                child.is_entry()
            } else if node.is_leaf() {
                child.is_cell()
            } else {
                !child.is_cell() && !child.is_entry()
            };
            if !role_ok {
                return Err(StoreIndexError::Corrupt(format!(
                    "node {} has a child {} of the wrong role",
                    node.id, child.id
                )));
            }
        }
        let live: Vec<&Node> = children.iter().filter(|c| !c.is_empty()).collect();
        if node.is_empty() {
            if !live.is_empty() {
                return Err(StoreIndexError::Corrupt(format!(
                    "tombstoned node {} still has live children",
                    node.id
                )));
            }
        } else {
            let expected = live
                .iter()
                .map(|c| c.boundary)
                .reduce(|a, b| a.union(&b))
                .ok_or_else(|| {
                    StoreIndexError::Corrupt(format!(
                        "node {} is live but has no live children",
                        node.id
                    ))
                })?;
            if expected != node.boundary {
                return Err(StoreIndexError::Corrupt(format!(
                    "boundary of node {} is not the union of its children",
                    node.id
                )));
            }
        }
        let mut count = 0;
        for child in live {
            count += self.verify_subtree(child)?;
        }
        Ok(count)
    }
}

/// Union of the boundaries of the non-tombstoned nodes, if any.
pub(super) fn live_union(children: &[Node]) -> Option<Envelope> {
    children
        .iter()
        .filter(|c| !c.is_empty())
        .map(|c| c.boundary)
        .reduce(|a, b| a.union(&b))
}

impl<M: ElementMapper> Drop for HilbertRTree<M> {
    fn drop(&mut self) {
        if !*self.closed.read() {
            if let Err(e) = self.close() {
                log::warn!("failed to close spatial index cleanly: {}", e);
            }
        }
    }
}
