//! Intersection search over the tree.
//!
//! A [`Search`] holds the query envelope; each call to
//! [`iter`](Search::iter) starts a fresh traversal over the tree as it
//! stands at that moment, so one query can be walked any number of
//! times. The iterator descends lazily, keeping a stack of nodes still
//! to visit and a buffer of entry ids from the current cell; nothing is
//! read ahead of what the caller consumes.

use std::collections::VecDeque;

use crate::envelope::Envelope;
use crate::mapper::ElementMapper;
use crate::store::types::{EntryId, IndexResult, NodeId};

use super::HilbertRTree;

impl<M: ElementMapper> HilbertRTree<M> {
    /// Prepares an intersection query. Touching boundaries count as
    /// intersecting, so a point query on a shared edge finds entries on
    /// both sides.
    pub fn search(&self, query: &Envelope) -> IndexResult<Search<'_, M>> {
        self.check_closed()?;
        self.check_envelope(query)?;
        Ok(Search {
            tree: self,
            query: *query,
        })
    }

    /// Convenience for the common case: all intersecting entry ids,
    /// collected eagerly.
    pub fn search_ids(&self, query: &Envelope) -> IndexResult<Vec<EntryId>> {
        self.search(query)?.ids()
    }
}

/// A prepared intersection query bound to a tree.
pub struct Search<'a, M: ElementMapper> {
    tree: &'a HilbertRTree<M>,
    query: Envelope,
}

impl<'a, M: ElementMapper> Search<'a, M> {
    /// Starts a traversal over the tree's current state.
    pub fn iter(&self) -> SearchIter<'_, M> {
        let root = self.tree.header.read().root;
        SearchIter {
            tree: self.tree,
            query: &self.query,
            stack: if root != 0 { vec![root] } else { Vec::new() },
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Drains a traversal into a vector of entry ids.
    pub fn ids(&self) -> IndexResult<Vec<EntryId>> {
        self.iter().collect()
    }
}

impl<'s, 'a, M: ElementMapper> IntoIterator for &'s Search<'a, M> {
    type Item = IndexResult<EntryId>;
    type IntoIter = SearchIter<'s, M>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy depth-first traversal yielding ids of entries whose envelopes
/// intersect the query. A store error ends the traversal after being
/// yielded once.
pub struct SearchIter<'a, M: ElementMapper> {
    tree: &'a HilbertRTree<M>,
    query: &'a Envelope,
    stack: Vec<NodeId>,
    pending: VecDeque<EntryId>,
    done: bool,
}

impl<'a, M: ElementMapper> Iterator for SearchIter<'a, M> {
    type Item = IndexResult<EntryId>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(id) = self.pending.pop_front() {
                return Some(Ok(id));
            }
            if self.done {
                return None;
            }
            let Some(node_id) = self.stack.pop() else {
                self.done = true;
                return None;
            };
            let node = match self.tree.store.read_node(node_id) {
                Ok(node) => node,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if node.is_empty() || !node.boundary.intersects(self.query) {
                continue;
            }
            let children = match self.tree.read_children(&node) {
                Ok(children) => children,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if node.is_cell() {
                for entry in &children {
                    if entry.boundary.intersects(self.query) {
                        if let Some(id) = entry.entry_id() {
                            self.pending.push_back(id);
                        }
                    }
                }
            } else {
                // Reverse push so siblings pop in chain order.
                for child in children.iter().rev() {
                    if !child.is_empty() && child.boundary.intersects(self.query) {
                        self.stack.push(child.id);
                    }
                }
            }
        }
    }
}
