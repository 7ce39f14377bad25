//! File-backed node store.
//!
//! One record per `RECORD_SIZE` slot, slot 0 holding the header. Every
//! read and write seeks on a single shared file handle, so all channel
//! access funnels through one mutex owned by the store.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::constants::RECORD_SIZE;
use super::types::{
    decode_free_record, decode_header, decode_record, encode_free_record, encode_header,
    encode_record, FreeRecord, IndexResult, Node, NodeId, StoreHeader, StoreIndexError,
};
use super::NodeStore;

/// Node store persisted in a single random-access file.
#[derive(Debug)]
pub struct FileStore {
    /// `None` once the channel has been released.
    file: Mutex<Option<File>>,
    path: PathBuf,
}

impl FileStore {
    /// Creates a fresh store file, truncating any existing content, and
    /// writes the initial header.
    pub fn create(path: &Path, header: &StoreHeader) -> IndexResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let store = Self {
            file: Mutex::new(Some(file)),
            path: path.to_path_buf(),
        };
        store.write_header(header)?;
        store.sync()?;
        log::debug!("created node store at {:?}", store.path);
        Ok(store)
    }

    /// Opens an existing store file and validates its header. Succeeds
    /// for a store holding nothing but the header (an empty tree) and
    /// performs no writes of its own.
    pub fn open(path: &Path) -> IndexResult<(Self, StoreHeader)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < RECORD_SIZE as u64 {
            return Err(StoreIndexError::Corrupt(format!(
                "store file {:?} is truncated ({} bytes)",
                path, len
            )));
        }
        let store = Self {
            file: Mutex::new(Some(file)),
            path: path.to_path_buf(),
        };
        let header = store.read_header()?;
        header.validate()?;
        log::debug!(
            "opened node store at {:?} (root {}, {} entries)",
            store.path,
            header.root,
            header.entry_count
        );
        Ok((store, header))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> IndexResult<T>) -> IndexResult<T> {
        let mut guard = self.file.lock();
        match guard.as_mut() {
            Some(file) => f(file),
            None => Err(StoreIndexError::Closed),
        }
    }

    fn read_slot(&self, id: NodeId) -> IndexResult<Vec<u8>> {
        if id == 0 {
            return Err(StoreIndexError::Corrupt(
                "slot 0 is reserved for the header".into(),
            ));
        }
        let offset = id
            .checked_mul(RECORD_SIZE as u64)
            .ok_or_else(|| StoreIndexError::Corrupt(format!("node id {} overflows", id)))?;
        self.with_file(|file| {
            let len = file.metadata()?.len();
            if offset + RECORD_SIZE as u64 > len {
                return Err(StoreIndexError::Corrupt(format!(
                    "node id {} is out of range (store holds {} slots)",
                    id,
                    len / RECORD_SIZE as u64
                )));
            }
            file.seek(SeekFrom::Start(offset))?;
            let mut buffer = vec![0u8; RECORD_SIZE];
            file.read_exact(&mut buffer)?;
            Ok(buffer)
        })
    }

    fn write_slot(&self, id: NodeId, bytes: &[u8]) -> IndexResult<()> {
        debug_assert_eq!(bytes.len(), RECORD_SIZE);
        if id == 0 {
            return Err(StoreIndexError::Corrupt(
                "slot 0 is reserved for the header".into(),
            ));
        }
        let offset = id
            .checked_mul(RECORD_SIZE as u64)
            .ok_or_else(|| StoreIndexError::Corrupt(format!("node id {} overflows", id)))?;
        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(bytes)?;
            Ok(())
        })
    }
}

impl NodeStore for FileStore {
    fn read_header(&self) -> IndexResult<StoreHeader> {
        self.with_file(|file| {
            file.seek(SeekFrom::Start(0))?;
            let mut buffer = vec![0u8; RECORD_SIZE];
            file.read_exact(&mut buffer)?;
            Ok(buffer)
        })
        .and_then(|buffer| decode_header(&buffer))
    }

    fn write_header(&self, header: &StoreHeader) -> IndexResult<()> {
        let bytes = encode_header(header)?;
        self.with_file(|file| {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&bytes)?;
            Ok(())
        })
    }

    fn read_node(&self, id: NodeId) -> IndexResult<Node> {
        let buffer = self.read_slot(id)?;
        decode_record(&buffer, id)
    }

    fn write_node(&self, node: &Node) -> IndexResult<()> {
        let bytes = encode_record(node)?;
        self.write_slot(node.id, &bytes)
    }

    fn read_free(&self, id: NodeId) -> IndexResult<FreeRecord> {
        let buffer = self.read_slot(id)?;
        decode_free_record(&buffer)
    }

    fn write_free(&self, id: NodeId, free: &FreeRecord) -> IndexResult<()> {
        let bytes = encode_free_record(free)?;
        self.write_slot(id, &bytes)
    }

    fn truncate(&self) -> IndexResult<()> {
        self.with_file(|file| {
            file.set_len(RECORD_SIZE as u64)?;
            Ok(())
        })
    }

    fn sync(&self) -> IndexResult<()> {
        self.with_file(|file| {
            file.sync_all()?;
            Ok(())
        })
    }

    fn release(&self) -> IndexResult<()> {
        let mut guard = self.file.lock();
        if let Some(file) = guard.take() {
            file.sync_all()?;
            log::debug!("released node store at {:?}", self.path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Crs, Dimension, Envelope};
    use tempfile::tempdir;

    fn header() -> StoreHeader {
        StoreHeader::new(Crs::new(4326, Dimension::Two), 8, 8)
    }

    #[test]
    fn test_create_then_open_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.hrt");

        let store = FileStore::create(&path, &header()).unwrap();
        store.release().unwrap();

        // The empty round trip must succeed with no intervening write.
        let (store, reopened) = FileStore::open(&path).unwrap();
        assert_eq!(reopened.root, 0);
        assert_eq!(reopened.entry_count, 0);
        store.release().unwrap();
    }

    #[test]
    fn test_node_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.hrt");
        let store = FileStore::create(&path, &header()).unwrap();

        let node = Node::leaf(3, Envelope::rect(0.0, 0.0, 5.0, 5.0).unwrap());
        store.write_node(&node).unwrap();
        assert_eq!(store.read_node(3).unwrap(), node);
    }

    #[test]
    fn test_out_of_range_id_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.hrt");
        let store = FileStore::create(&path, &header()).unwrap();

        let err = store.read_node(99).unwrap_err();
        assert!(matches!(err, StoreIndexError::Corrupt(_)), "{:?}", err);
        let err = store.read_node(0).unwrap_err();
        assert!(matches!(err, StoreIndexError::Corrupt(_)));
    }

    #[test]
    fn test_header_survives_node_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.hrt");
        let store = FileStore::create(&path, &header()).unwrap();

        let mut h = header();
        h.root = 1;
        h.next_id = 2;
        h.entry_count = 1;
        store.write_header(&h).unwrap();
        store
            .write_node(&Node::leaf(1, Envelope::point2(1.0, 1.0).unwrap()))
            .unwrap();

        let read = store.read_header().unwrap();
        assert_eq!(read.root, 1);
        assert_eq!(read.entry_count, 1);
    }

    #[test]
    fn test_release_is_idempotent_and_final() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.hrt");
        let store = FileStore::create(&path, &header()).unwrap();

        store.release().unwrap();
        store.release().unwrap();
        assert!(matches!(
            store.read_header().unwrap_err(),
            StoreIndexError::Closed
        ));
    }

    #[test]
    fn test_truncate_keeps_header_slot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.hrt");
        let store = FileStore::create(&path, &header()).unwrap();

        store
            .write_node(&Node::leaf(1, Envelope::point2(0.0, 0.0).unwrap()))
            .unwrap();
        store.truncate().unwrap();

        assert!(store.read_header().is_ok());
        assert!(store.read_node(1).is_err());
    }

    #[test]
    fn test_free_record_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.hrt");
        let store = FileStore::create(&path, &header()).unwrap();

        store
            .write_node(&Node::leaf(1, Envelope::point2(0.0, 0.0).unwrap()))
            .unwrap();
        store.write_free(1, &FreeRecord { next_free: 0 }).unwrap();
        assert_eq!(store.read_free(1).unwrap().next_free, 0);
        // The recycled slot no longer decodes as a node.
        assert!(store.read_node(1).is_err());
    }

    #[test]
    fn test_overflowing_id_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.hrt");
        let store = FileStore::create(&path, &header()).unwrap();

        let node = Node::leaf(u64::MAX, Envelope::point2(0.0, 0.0).unwrap());
        assert!(matches!(
            store.write_node(&node).unwrap_err(),
            StoreIndexError::Corrupt(_)
        ));
        assert!(matches!(
            store.read_node(u64::MAX).unwrap_err(),
            StoreIndexError::Corrupt(_)
        ));
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.hrt");
        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(
            FileStore::open(&path).unwrap_err(),
            StoreIndexError::Corrupt(_)
        ));
    }
}
