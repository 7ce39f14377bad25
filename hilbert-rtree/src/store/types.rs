//! Core types for the node store: error taxonomy, identifiers, node
//! records and the persisted header.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use super::constants::{MAGIC, MIN_CAPACITY, RECORD_SIZE, VERSION};
use crate::envelope::{Crs, Envelope};

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the spatial index and its node store.
#[derive(Debug, Error)]
pub enum StoreIndexError {
    /// Channel read/write failure; the store is left unusable and the
    /// caller must reopen.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unreadable or inconsistent record, bad header, checksum mismatch.
    /// Fatal; never repaired silently.
    #[error("store corruption: {0}")]
    Corrupt(String),

    /// Record (de)serialization failure.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Rejected synchronously at the API boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation on a closed tree or store.
    #[error("index is closed")]
    Closed,
}

/// Result type for index operations.
pub type IndexResult<T> = Result<T, StoreIndexError>;

/// Identifier of a node record. `0` is the sentinel "no node" value and
/// also addresses the header slot, so it is never a valid node.
pub type NodeId = u64;

/// External identifier namespace managed by the element mapper.
pub type EntryId = u64;

// ============================================================================
// Node Model
// ============================================================================

/// What a node's child pointer designates.
///
/// Data entries used to be encoded as negative child identifiers; the
/// tagged variant keeps the same record slot without the off-by-one
/// arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildLink {
    /// No children.
    None,
    /// First node of the singly linked child list.
    Node(NodeId),
    /// This node is a data entry for the given external id.
    Entry(EntryId),
}

/// Structural role flags persisted with every node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    /// Children are cells rather than internal nodes.
    pub leaf: bool,
    /// Leaf-level grouping unit holding data entries.
    pub cell: bool,
    /// Tombstone: zero live children, retained for reuse until rebuild.
    pub empty: bool,
}

/// The atomic persisted unit. Entries, cells, leaves and internal nodes
/// all share this record shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Union of the boundaries of this node's live children (the entry's
    /// own envelope for data entries). Stale when `flags.empty` is set.
    pub boundary: Envelope,
    pub child: ChildLink,
    /// Next sibling in the parent's child list, `0` if last.
    pub sibling: NodeId,
    pub flags: NodeFlags,
}

impl Node {
    /// A data entry for `entry_id` covering `envelope`.
    pub fn entry(id: NodeId, entry_id: EntryId, envelope: Envelope) -> Self {
        Self {
            id,
            boundary: envelope,
            child: ChildLink::Entry(entry_id),
            sibling: 0,
            flags: NodeFlags::default(),
        }
    }

    /// A cell grouping a run of data entries.
    pub fn cell(id: NodeId, boundary: Envelope) -> Self {
        Self {
            id,
            boundary,
            child: ChildLink::None,
            sibling: 0,
            flags: NodeFlags {
                cell: true,
                ..NodeFlags::default()
            },
        }
    }

    /// A leaf node whose children are cells.
    pub fn leaf(id: NodeId, boundary: Envelope) -> Self {
        Self {
            id,
            boundary,
            child: ChildLink::None,
            sibling: 0,
            flags: NodeFlags {
                leaf: true,
                ..NodeFlags::default()
            },
        }
    }

    /// An internal node whose children are leaves or other internals.
    pub fn internal(id: NodeId, boundary: Envelope) -> Self {
        Self {
            id,
            boundary,
            child: ChildLink::None,
            sibling: 0,
            flags: NodeFlags::default(),
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self.child, ChildLink::Entry(_))
    }

    pub fn is_cell(&self) -> bool {
        self.flags.cell
    }

    pub fn is_leaf(&self) -> bool {
        self.flags.leaf
    }

    pub fn is_internal(&self) -> bool {
        !self.flags.leaf && !self.flags.cell && !self.is_entry()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.empty
    }

    /// External id if this node is a data entry.
    pub fn entry_id(&self) -> Option<EntryId> {
        match self.child {
            ChildLink::Entry(id) => Some(id),
            _ => None,
        }
    }

    /// First child node id, if any.
    pub fn first_child(&self) -> Option<NodeId> {
        match self.child {
            ChildLink::Node(id) => Some(id),
            _ => None,
        }
    }

    /// Structural consistency of flags and links; violations mean the
    /// record did not come from this store.
    fn sanity_check(&self) -> IndexResult<()> {
        if self.id == 0 {
            return Err(StoreIndexError::Corrupt(
                "node record carries the reserved id 0".into(),
            ));
        }
        if self.flags.leaf && self.flags.cell {
            return Err(StoreIndexError::Corrupt(format!(
                "node {} is flagged both leaf and cell",
                self.id
            )));
        }
        if self.is_entry() && (self.flags.leaf || self.flags.cell || self.flags.empty) {
            return Err(StoreIndexError::Corrupt(format!(
                "data entry {} carries container flags",
                self.id
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Record Codec
// ============================================================================

/// A node wrapped with a CRC32 checksum for corruption detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckedRecord {
    checksum: u32,
    node: Node,
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Serializes a node into a checksummed, fixed-size record slot.
pub fn encode_record(node: &Node) -> IndexResult<Vec<u8>> {
    let body = bincode::serde::encode_to_vec(node, bincode::config::legacy())
        .map_err(|e| StoreIndexError::Encoding(e.to_string()))?;
    let record = CheckedRecord {
        checksum: crc32(&body),
        node: node.clone(),
    };
    let mut bytes = bincode::serde::encode_to_vec(&record, bincode::config::legacy())
        .map_err(|e| StoreIndexError::Encoding(e.to_string()))?;
    if bytes.len() > RECORD_SIZE {
        return Err(StoreIndexError::Encoding(format!(
            "node record too large: {} bytes (max {})",
            bytes.len(),
            RECORD_SIZE
        )));
    }
    bytes.resize(RECORD_SIZE, 0);
    Ok(bytes)
}

/// Decodes a record slot, verifying the checksum, the stored id against
/// the slot it was read from, and the structural flag invariants.
pub fn decode_record(bytes: &[u8], expected_id: NodeId) -> IndexResult<Node> {
    let (record, _): (CheckedRecord, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
            .map_err(|e| StoreIndexError::Corrupt(format!("undecodable node record: {}", e)))?;
    let body = bincode::serde::encode_to_vec(&record.node, bincode::config::legacy())
        .map_err(|e| StoreIndexError::Encoding(e.to_string()))?;
    let expected = crc32(&body);
    if record.checksum != expected {
        return Err(StoreIndexError::Corrupt(format!(
            "checksum mismatch for node {} (expected {:08x}, got {:08x})",
            expected_id, expected, record.checksum
        )));
    }
    if record.node.id != expected_id {
        return Err(StoreIndexError::Corrupt(format!(
            "record at slot {} claims id {}",
            expected_id, record.node.id
        )));
    }
    record.node.sanity_check()?;
    Ok(record.node)
}

/// Slot content of a recycled record: the next free slot in the chain
/// (`0` terminates).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FreeRecord {
    pub next_free: NodeId,
}

pub fn encode_free_record(free: &FreeRecord) -> IndexResult<Vec<u8>> {
    let mut bytes = bincode::serde::encode_to_vec(free, bincode::config::legacy())
        .map_err(|e| StoreIndexError::Encoding(e.to_string()))?;
    bytes.resize(RECORD_SIZE, 0);
    Ok(bytes)
}

pub fn decode_free_record(bytes: &[u8]) -> IndexResult<FreeRecord> {
    bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
        .map(|(free, _)| free)
        .map_err(|e| StoreIndexError::Corrupt(format!("undecodable free record: {}", e)))
}

// ============================================================================
// Store Header
// ============================================================================

/// Metadata persisted in slot 0 of the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoreHeader {
    pub magic: u32,
    pub version: u32,
    pub crs: Crs,
    pub node_capacity: u32,
    pub cell_capacity: u32,
    /// Root node, `0` for an empty tree.
    pub root: NodeId,
    /// Next never-allocated slot; also the exclusive upper bound for
    /// valid node identifiers.
    pub next_id: NodeId,
    pub entry_count: u64,
    /// Tree height; `1` for a single leaf root, `0` when empty.
    pub height: u32,
    pub free_head: NodeId,
    pub free_count: u64,
}

impl StoreHeader {
    pub fn new(crs: Crs, node_capacity: u32, cell_capacity: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            crs,
            node_capacity,
            cell_capacity,
            root: 0,
            next_id: 1,
            entry_count: 0,
            height: 0,
            free_head: 0,
            free_count: 0,
        }
    }

    pub fn validate(&self) -> IndexResult<()> {
        if self.magic != MAGIC {
            return Err(StoreIndexError::Corrupt(
                "not a spatial index store (bad magic)".into(),
            ));
        }
        if self.version != VERSION {
            return Err(StoreIndexError::Corrupt(format!(
                "unsupported store format version {}",
                self.version
            )));
        }
        if self.node_capacity < MIN_CAPACITY || self.cell_capacity < MIN_CAPACITY {
            return Err(StoreIndexError::Corrupt(format!(
                "implausible capacities {}/{} in header",
                self.node_capacity, self.cell_capacity
            )));
        }
        if self.next_id == 0 || self.root >= self.next_id && self.root != 0 {
            return Err(StoreIndexError::Corrupt(format!(
                "header root {} out of range (next id {})",
                self.root, self.next_id
            )));
        }
        Ok(())
    }
}

pub fn encode_header(header: &StoreHeader) -> IndexResult<Vec<u8>> {
    let mut bytes = bincode::serde::encode_to_vec(header, bincode::config::legacy())
        .map_err(|e| StoreIndexError::Encoding(e.to_string()))?;
    if bytes.len() > RECORD_SIZE {
        return Err(StoreIndexError::Encoding(format!(
            "header too large: {} bytes (max {})",
            bytes.len(),
            RECORD_SIZE
        )));
    }
    bytes.resize(RECORD_SIZE, 0);
    Ok(bytes)
}

pub fn decode_header(bytes: &[u8]) -> IndexResult<StoreHeader> {
    bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
        .map(|(header, _)| header)
        .map_err(|e| StoreIndexError::Corrupt(format!("undecodable store header: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Dimension;

    fn sample_node() -> Node {
        Node::cell(7, Envelope::rect(0.0, 1.0, 2.0, 3.0).unwrap())
    }

    #[test]
    fn test_record_round_trip() {
        let node = sample_node();
        let bytes = encode_record(&node).unwrap();
        assert_eq!(bytes.len(), RECORD_SIZE);
        let decoded = decode_record(&bytes, 7).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn test_record_checksum_detects_corruption() {
        let mut bytes = encode_record(&sample_node()).unwrap();
        // Flip a bit inside the boundary ordinates
        bytes[20] ^= 0x01;
        let err = decode_record(&bytes, 7).unwrap_err();
        assert!(matches!(err, StoreIndexError::Corrupt(_)), "{:?}", err);
    }

    #[test]
    fn test_record_slot_mismatch_detected() {
        let bytes = encode_record(&sample_node()).unwrap();
        let err = decode_record(&bytes, 8).unwrap_err();
        assert!(matches!(err, StoreIndexError::Corrupt(_)));
    }

    #[test]
    fn test_entry_with_container_flags_rejected() {
        let mut node = Node::entry(3, 42, Envelope::point2(1.0, 1.0).unwrap());
        node.flags.cell = true;
        let bytes = encode_record(&node).unwrap();
        let err = decode_record(&bytes, 3).unwrap_err();
        assert!(matches!(err, StoreIndexError::Corrupt(_)));
    }

    #[test]
    fn test_header_round_trip() {
        let header = StoreHeader::new(Crs::new(4326, Dimension::Two), 16, 8);
        let bytes = encode_header(&header).unwrap();
        assert_eq!(bytes.len(), RECORD_SIZE);
        let decoded = decode_header(&bytes).unwrap();
        decoded.validate().unwrap();
        assert_eq!(decoded.node_capacity, 16);
        assert_eq!(decoded.cell_capacity, 8);
        assert_eq!(decoded.root, 0);
    }

    #[test]
    fn test_header_validate_rejects_bad_magic() {
        let mut header = StoreHeader::new(Crs::new(0, Dimension::Two), 8, 8);
        header.magic = 0xDEAD_BEEF;
        assert!(matches!(
            header.validate(),
            Err(StoreIndexError::Corrupt(_))
        ));
    }

    #[test]
    fn test_header_validate_rejects_out_of_range_root() {
        let mut header = StoreHeader::new(Crs::new(0, Dimension::Two), 8, 8);
        header.root = 5;
        assert!(header.validate().is_err());
        header.next_id = 6;
        assert!(header.validate().is_ok());
    }

    #[test]
    fn test_free_record_round_trip() {
        let free = FreeRecord { next_free: 12 };
        let bytes = encode_free_record(&free).unwrap();
        assert_eq!(decode_free_record(&bytes).unwrap().next_free, 12);
    }

    #[test]
    fn test_3d_record_fits_slot() {
        let node = Node::entry(
            1,
            u64::MAX,
            Envelope::cuboid(-1e9, -1e9, -1e9, 1e9, 1e9, 1e9).unwrap(),
        );
        let bytes = encode_record(&node).unwrap();
        assert_eq!(bytes.len(), RECORD_SIZE);
        assert_eq!(decode_record(&bytes, 1).unwrap(), node);
    }
}
