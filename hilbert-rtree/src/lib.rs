//! # Hilbert R-Tree - Persistent Spatial Indexing
//!
//! This crate provides a disk-backed spatial index over axis-aligned
//! envelopes in two or three dimensions, organized as an R-Tree whose
//! leaves group entries into cells ordered along a Hilbert
//! space-filling curve.
//!
//! ## Features
//!
//! - **Fixed-Format Storage**: One checksummed record per slot, node ids
//!   doubling as byte offsets
//! - **Crash-Aware Reopen**: The header is written through on every
//!   mutation, so a reopened store resumes where it left off
//! - **Hilbert Packing**: Nearby entries land in the same cell, keeping
//!   range queries local
//! - **Pluggable Backends**: File-backed and in-memory stores share one
//!   record codec; element mappers are a trait
//! - **Tombstone Deletes**: Emptied cells stay linked until a
//!   [`rebuild`](HilbertRTree::rebuild) compacts the whole structure
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hilbert_rtree::{Crs, Dimension, Envelope, HilbertRTree, MemoryMapper};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tree = HilbertRTree::create_in_memory(
//!     MemoryMapper::new(),
//!     Crs::new(4326, Dimension::Two),
//!     32,
//!     32,
//! )?;
//!
//! let id = tree.add("city park", &Envelope::rect(2.0, 2.0, 4.0, 4.0)?)?;
//!
//! let query = Envelope::rect(3.0, 3.0, 10.0, 10.0)?;
//! for hit in &tree.search(&query)? {
//!     assert_eq!(hit?, id);
//! }
//!
//! tree.delete(id)?;
//! tree.close()?;
//! # Ok(())
//! # }
//! ```

pub mod envelope;
pub mod hilbert;
pub mod mapper;
pub mod store;
pub mod tree;

pub use envelope::{Crs, Dimension, Envelope};
pub use mapper::{ElementMapper, FileMapper, MemoryMapper};
pub use store::{
    EntryId, FileStore, IndexResult, MemoryStore, NodeId, NodeStore, StoreHeader, StoreIndexError,
    DEFAULT_CELL_CAPACITY, DEFAULT_NODE_CAPACITY,
};
pub use tree::{HilbertRTree, RebuildStats, Search, SearchIter};
