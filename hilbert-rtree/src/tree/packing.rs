//! Hilbert packing: where new entries land inside a leaf, how full
//! cells and leaves split, and the bottom-up bulk pack used by
//! [`rebuild`](super::HilbertRTree::rebuild).
//!
//! Ordering inside a leaf uses [`packing_key`]: the Hilbert index of an
//! envelope's center normalized into the current reference bounds, with
//! the entry id as a deterministic tiebreak. During incremental inserts
//! the reference bounds are the leaf boundary extended by the incoming
//! envelope; during a rebuild they are the union of everything in the
//! tree, so the pack produces one globally consistent order.

use crate::envelope::Envelope;
use crate::hilbert::packing_key;
use crate::mapper::ElementMapper;
use crate::store::types::{EntryId, IndexResult, Node, NodeId, StoreHeader, StoreIndexError};

use super::HilbertRTree;

/// Outcome of a [`rebuild`](HilbertRTree::rebuild): how much the pack
/// compacted the structure.
#[derive(Debug, Clone, Copy)]
pub struct RebuildStats {
    /// Live entries carried over into the packed tree.
    pub entries: u64,
    pub height_before: u32,
    pub height_after: u32,
    /// Store slots in use before and after; the difference is the space
    /// reclaimed from tombstones and free-chain slack.
    pub slots_before: u64,
    pub slots_after: u64,
}

impl<M: ElementMapper> HilbertRTree<M> {
    /// Places an entry into the leaf at `leaf_id`, splitting the target
    /// cell and possibly the leaf itself. Returns the new right leaf
    /// when the leaf split; the caller links it into the parent.
    pub(super) fn insert_into_leaf(
        &self,
        leaf_id: NodeId,
        id: EntryId,
        envelope: &Envelope,
    ) -> IndexResult<Option<Node>> {
        let mut leaf = self.store.read_node(leaf_id)?;
        if !leaf.is_leaf() {
            return Err(StoreIndexError::Corrupt(format!(
                "node {} is not a leaf",
                leaf_id
            )));
        }
        let mut cells = self.read_children(&leaf)?;
        let has_live = cells.iter().any(|c| !c.is_empty());

        // Reference bounds for this leaf's ordering. A fully tombstoned
        // leaf has a stale boundary, so the new envelope stands alone.
        let bounds = if has_live && !leaf.is_empty() {
            leaf.boundary.union(envelope)
        } else {
            *envelope
        };
        let key = packing_key(envelope, &bounds, id);

        let mut cell_entries: Vec<Vec<Node>> = Vec::with_capacity(cells.len());
        for cell in &cells {
            cell_entries.push(if cell.is_empty() {
                Vec::new()
            } else {
                self.read_children(cell)?
            });
        }

        let target = if has_live {
            self.choose_cell(&cells, &cell_entries, &bounds, key)?
        } else {
            // Revive the first tombstone, or start the leaf's first cell.
            match cells.iter().position(|c| c.is_empty()) {
                Some(at) => {
                    cells[at].flags.empty = false;
                    at
                }
                None => {
                    let cell_id = self.allocate_node()?;
                    cells.push(Node::cell(cell_id, *envelope));
                    cell_entries.push(Vec::new());
                    cells.len() - 1
                }
            }
        };

        let entry_node = Node::entry(self.allocate_node()?, id, *envelope);
        let entries = &mut cell_entries[target];
        let at = entries.partition_point(|e| {
            packing_key(&e.boundary, &bounds, e.entry_id().unwrap_or(0)) <= key
        });
        entries.insert(at, entry_node);

        if entries.len() > self.cell_capacity as usize {
            // A run of ascending keys hitting the tail of the last live
            // cell cuts a fresh trailing cell instead of rebalancing, so
            // sorted bulk loads pack cells to capacity.
            let appended_past_all = at == entries.len() - 1;
            let last_live = (target + 1..cells.len()).all(|i| cells[i].is_empty());
            let mut right_entries = if appended_past_all && last_live {
                vec![entries.remove(entries.len() - 1)]
            } else {
                let mid = (entries.len() + 1) / 2;
                entries.split_off(mid)
            };

            let new_cell_id = self.allocate_node()?;
            let mut new_cell = Node::cell(new_cell_id, right_entries[0].boundary);
            Self::refresh_boundary(&mut new_cell, &right_entries);
            self.write_chain(&mut new_cell, &mut right_entries)?;

            Self::refresh_boundary(&mut cells[target], entries);
            self.write_chain(&mut cells[target], entries)?;
            cells.insert(target + 1, new_cell);
            log::trace!("split cell in leaf {} into {}", leaf_id, new_cell_id);
        } else {
            Self::refresh_boundary(&mut cells[target], entries);
            self.write_chain(&mut cells[target], entries)?;
        }

        if cells.len() > self.node_capacity as usize {
            let mid = (cells.len() + 1) / 2;
            let mut right_cells = cells.split_off(mid);
            let right_id = self.allocate_node()?;
            let mut right = Node::leaf(right_id, right_cells[0].boundary);
            Self::refresh_boundary(&mut right, &right_cells);
            self.write_chain(&mut right, &mut right_cells)?;

            Self::refresh_boundary(&mut leaf, &cells);
            self.write_chain(&mut leaf, &mut cells)?;
            log::trace!("split leaf {} into {}", leaf_id, right_id);
            return Ok(Some(right));
        }

        Self::refresh_boundary(&mut leaf, &cells);
        self.write_chain(&mut leaf, &mut cells)?;
        Ok(None)
    }

    /// The last live cell whose minimum key does not exceed `key`, or
    /// the first live cell when the new entry sorts before everything.
    fn choose_cell(
        &self,
        cells: &[Node],
        cell_entries: &[Vec<Node>],
        bounds: &Envelope,
        key: (u64, u64),
    ) -> IndexResult<usize> {
        let mut chosen = None;
        let mut first_live = None;
        for (i, cell) in cells.iter().enumerate() {
            if cell.is_empty() {
                continue;
            }
            if first_live.is_none() {
                first_live = Some(i);
            }
            let min_key = cell_entries[i]
                .iter()
                .map(|e| packing_key(&e.boundary, bounds, e.entry_id().unwrap_or(0)))
                .min();
            if matches!(min_key, Some(min) if min <= key) {
                chosen = Some(i);
            }
        }
        chosen
            .or(first_live)
            .ok_or_else(|| StoreIndexError::Corrupt("leaf has no live cells".into()))
    }

    // ========================================================================
    // Rebuild
    // ========================================================================

    /// Rewrites the whole store as a bottom-up Hilbert pack of the live
    /// entries: tombstones vanish, cells and nodes fill to capacity and
    /// the slot sequence restarts from one.
    pub fn rebuild(&self) -> IndexResult<RebuildStats> {
        self.check_closed()?;
        let before = *self.header.read();

        let mut items = self.collect_entries()?;
        self.store.truncate()?;

        let mut header = StoreHeader::new(self.crs, self.node_capacity, self.cell_capacity);
        if let Some(world) = items.iter().map(|(_, e)| *e).reduce(|a, b| a.union(&b)) {
            items.sort_by_key(|(id, env)| packing_key(env, &world, *id));
            self.pack(&mut header, &items)?;
        }

        *self.header.write() = header;
        self.store.write_header(&header)?;
        self.store.sync()?;

        log::debug!(
            "rebuilt index: {} entries, height {} -> {}, slots {} -> {}",
            header.entry_count,
            before.height,
            header.height,
            before.next_id,
            header.next_id
        );
        Ok(RebuildStats {
            entries: header.entry_count,
            height_before: before.height,
            height_after: header.height,
            slots_before: before.next_id,
            slots_after: header.next_id,
        })
    }

    fn collect_entries(&self) -> IndexResult<Vec<(EntryId, Envelope)>> {
        let root = self.header.read().root;
        let mut out = Vec::new();
        if root != 0 {
            let node = self.store.read_node(root)?;
            self.collect_from(&node, &mut out)?;
        }
        Ok(out)
    }

    fn collect_from(&self, node: &Node, out: &mut Vec<(EntryId, Envelope)>) -> IndexResult<()> {
        if let Some(id) = node.entry_id() {
            out.push((id, node.boundary));
            return Ok(());
        }
        for child in self.read_children(node)? {
            self.collect_from(&child, out)?;
        }
        Ok(())
    }

    /// Builds the packed structure level by level over a truncated
    /// store, allocating slots straight off the fresh header.
    fn pack(&self, header: &mut StoreHeader, items: &[(EntryId, Envelope)]) -> IndexResult<()> {
        let mut cells: Vec<Node> = Vec::new();
        for chunk in items.chunks(self.cell_capacity as usize) {
            let mut entries: Vec<Node> = chunk
                .iter()
                .map(|(id, env)| {
                    let node_id = header.next_id;
                    header.next_id += 1;
                    Node::entry(node_id, *id, *env)
                })
                .collect();
            let cell_id = header.next_id;
            header.next_id += 1;
            let mut cell = Node::cell(cell_id, entries[0].boundary);
            Self::refresh_boundary(&mut cell, &entries);
            self.write_chain(&mut cell, &mut entries)?;
            cells.push(cell);
        }

        let mut level: Vec<Node> = Vec::new();
        for chunk in cells.chunks_mut(self.node_capacity as usize) {
            let leaf_id = header.next_id;
            header.next_id += 1;
            let mut leaf = Node::leaf(leaf_id, chunk[0].boundary);
            Self::refresh_boundary(&mut leaf, chunk);
            self.write_chain(&mut leaf, chunk)?;
            level.push(leaf);
        }

        let mut height = 1u32;
        while level.len() > 1 {
            let mut upper: Vec<Node> = Vec::new();
            for chunk in level.chunks_mut(self.node_capacity as usize) {
                let node_id = header.next_id;
                header.next_id += 1;
                let mut node = Node::internal(node_id, chunk[0].boundary);
                Self::refresh_boundary(&mut node, chunk);
                self.write_chain(&mut node, chunk)?;
                upper.push(node);
            }
            level = upper;
            height += 1;
        }

        if let Some(root) = level.first() {
            header.root = root.id;
            header.height = height;
            header.entry_count = items.len() as u64;
        }
        Ok(())
    }
}
