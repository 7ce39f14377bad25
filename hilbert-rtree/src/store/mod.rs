//! Node store: fixed-format binary records addressed by identifiers
//! that double as byte offsets, with a file-backed and an in-memory
//! backend sharing one record codec.

pub mod constants;
pub mod file;
pub mod memory;
pub mod types;

pub use constants::{DEFAULT_CELL_CAPACITY, DEFAULT_NODE_CAPACITY, RECORD_SIZE};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use types::{
    ChildLink, EntryId, FreeRecord, IndexResult, Node, NodeFlags, NodeId, StoreHeader,
    StoreIndexError,
};

/// Random-access backing for node records.
///
/// Implementations serialize all channel access behind their own lock;
/// the tree provides no transactional isolation on top of this, only
/// memory safety of the shared channel.
pub trait NodeStore: Send + Sync {
    /// Reads and decodes the header slot.
    fn read_header(&self) -> IndexResult<StoreHeader>;

    /// Overwrites the header slot.
    fn write_header(&self, header: &StoreHeader) -> IndexResult<()>;

    /// Reads the record at `id`, failing with a corruption error when
    /// the identifier is out of range or the record fails its checks.
    fn read_node(&self, id: NodeId) -> IndexResult<Node>;

    /// Writes the record at `node.id`, growing the backing medium when
    /// the slot lies past its current end.
    fn write_node(&self, node: &Node) -> IndexResult<()>;

    /// Reads a recycled slot's free-chain link.
    fn read_free(&self, id: NodeId) -> IndexResult<FreeRecord>;

    /// Turns the slot at `id` into a free-chain link.
    fn write_free(&self, id: NodeId, free: &FreeRecord) -> IndexResult<()>;

    /// Discards every record except the header slot.
    fn truncate(&self) -> IndexResult<()>;

    /// Flushes pending writes to the backing medium.
    fn sync(&self) -> IndexResult<()>;

    /// Releases the underlying channel. The store must not be used
    /// afterwards; releasing twice is a no-op.
    fn release(&self) -> IndexResult<()>;
}
