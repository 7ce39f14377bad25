//! In-memory node store.
//!
//! A growable byte arena with the exact slot layout of the file backend,
//! so both paths exercise the same record codec and identifier/offset
//! arithmetic. Useful for purely transient indexes and for tests.

use parking_lot::Mutex;

use super::constants::RECORD_SIZE;
use super::types::{
    decode_free_record, decode_header, decode_record, encode_free_record, encode_header,
    encode_record, FreeRecord, IndexResult, Node, NodeId, StoreHeader, StoreIndexError,
};
use super::NodeStore;

/// Node store backed by a growable in-memory arena.
#[derive(Debug)]
pub struct MemoryStore {
    /// `None` once released.
    arena: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store holding only the header slot.
    pub fn create(header: &StoreHeader) -> IndexResult<Self> {
        let store = Self {
            arena: Mutex::new(Some(vec![0u8; RECORD_SIZE])),
        };
        store.write_header(header)?;
        Ok(store)
    }

    fn with_arena<T>(&self, f: impl FnOnce(&mut Vec<u8>) -> IndexResult<T>) -> IndexResult<T> {
        let mut guard = self.arena.lock();
        match guard.as_mut() {
            Some(arena) => f(arena),
            None => Err(StoreIndexError::Closed),
        }
    }

    fn read_slot(&self, id: NodeId) -> IndexResult<Vec<u8>> {
        if id == 0 {
            return Err(StoreIndexError::Corrupt(
                "slot 0 is reserved for the header".into(),
            ));
        }
        let offset = id as usize * RECORD_SIZE;
        self.with_arena(|arena| {
            if offset + RECORD_SIZE > arena.len() {
                return Err(StoreIndexError::Corrupt(format!(
                    "node id {} is out of range (store holds {} slots)",
                    id,
                    arena.len() / RECORD_SIZE
                )));
            }
            Ok(arena[offset..offset + RECORD_SIZE].to_vec())
        })
    }

    fn write_slot(&self, id: NodeId, bytes: &[u8]) -> IndexResult<()> {
        debug_assert_eq!(bytes.len(), RECORD_SIZE);
        if id == 0 {
            return Err(StoreIndexError::Corrupt(
                "slot 0 is reserved for the header".into(),
            ));
        }
        let offset = id as usize * RECORD_SIZE;
        self.with_arena(|arena| {
            if arena.len() < offset + RECORD_SIZE {
                arena.resize(offset + RECORD_SIZE, 0);
            }
            arena[offset..offset + RECORD_SIZE].copy_from_slice(bytes);
            Ok(())
        })
    }
}

impl NodeStore for MemoryStore {
    fn read_header(&self) -> IndexResult<StoreHeader> {
        self.with_arena(|arena| Ok(arena[..RECORD_SIZE].to_vec()))
            .and_then(|bytes| decode_header(&bytes))
    }

    fn write_header(&self, header: &StoreHeader) -> IndexResult<()> {
        let bytes = encode_header(header)?;
        self.with_arena(|arena| {
            arena[..RECORD_SIZE].copy_from_slice(&bytes);
            Ok(())
        })
    }

    fn read_node(&self, id: NodeId) -> IndexResult<Node> {
        let bytes = self.read_slot(id)?;
        decode_record(&bytes, id)
    }

    fn write_node(&self, node: &Node) -> IndexResult<()> {
        let bytes = encode_record(node)?;
        self.write_slot(node.id, &bytes)
    }

    fn read_free(&self, id: NodeId) -> IndexResult<FreeRecord> {
        let bytes = self.read_slot(id)?;
        decode_free_record(&bytes)
    }

    fn write_free(&self, id: NodeId, free: &FreeRecord) -> IndexResult<()> {
        let bytes = encode_free_record(free)?;
        self.write_slot(id, &bytes)
    }

    fn truncate(&self) -> IndexResult<()> {
        self.with_arena(|arena| {
            arena.truncate(RECORD_SIZE);
            Ok(())
        })
    }

    fn sync(&self) -> IndexResult<()> {
        Ok(())
    }

    fn release(&self) -> IndexResult<()> {
        self.arena.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Crs, Dimension, Envelope};

    fn header() -> StoreHeader {
        StoreHeader::new(Crs::new(0, Dimension::Two), 8, 8)
    }

    #[test]
    fn test_node_round_trip() {
        let store = MemoryStore::create(&header()).unwrap();
        let node = Node::cell(2, Envelope::rect(1.0, 2.0, 3.0, 4.0).unwrap());
        store.write_node(&node).unwrap();
        assert_eq!(store.read_node(2).unwrap(), node);
    }

    #[test]
    fn test_arena_grows_on_demand() {
        let store = MemoryStore::create(&header()).unwrap();
        let node = Node::leaf(40, Envelope::point2(0.0, 0.0).unwrap());
        store.write_node(&node).unwrap();
        assert_eq!(store.read_node(40).unwrap(), node);
        // Slots between header and 40 exist but hold no valid record.
        assert!(store.read_node(10).is_err());
    }

    #[test]
    fn test_out_of_range_is_corruption() {
        let store = MemoryStore::create(&header()).unwrap();
        assert!(matches!(
            store.read_node(1).unwrap_err(),
            StoreIndexError::Corrupt(_)
        ));
    }

    #[test]
    fn test_truncate_resets_to_header() {
        let store = MemoryStore::create(&header()).unwrap();
        store
            .write_node(&Node::leaf(1, Envelope::point2(0.0, 0.0).unwrap()))
            .unwrap();
        store.truncate().unwrap();
        assert!(store.read_node(1).is_err());
        assert!(store.read_header().is_ok());
    }

    #[test]
    fn test_release_blocks_further_use() {
        let store = MemoryStore::create(&header()).unwrap();
        store.release().unwrap();
        assert!(matches!(
            store.read_header().unwrap_err(),
            StoreIndexError::Closed
        ));
    }
}
