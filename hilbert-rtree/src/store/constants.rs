//! Constants for the node store layout.

/// Fixed size of every record slot, header included. Node identifiers
/// double as byte offsets: a record lives at `id * RECORD_SIZE`.
pub const RECORD_SIZE: usize = 128;

/// Magic number identifying a store file ("HRTI").
pub const MAGIC: u32 = 0x4852_5449;

/// Store format version.
pub const VERSION: u32 = 1;

/// Default maximum number of children per internal or leaf node.
pub const DEFAULT_NODE_CAPACITY: u32 = 32;

/// Default maximum number of data entries per cell.
pub const DEFAULT_CELL_CAPACITY: u32 = 32;

/// Smallest capacity that still allows a split to produce two
/// non-degenerate halves.
pub const MIN_CAPACITY: u32 = 2;
