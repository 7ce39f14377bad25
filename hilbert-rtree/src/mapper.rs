//! Element mapper: the pluggable association between tree-internal
//! integer identifiers and caller-owned objects with their envelopes.
//!
//! The tree consults the mapper for an entry's last-known envelope on
//! delete and hands ids back to callers from search; everything else
//! about the mapped objects is the caller's business.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::store::types::{EntryId, IndexResult, StoreIndexError};

/// Bidirectional store mapping a dense integer id to a caller object
/// plus its envelope.
///
/// Ids are assigned monotonically increasing unless supplied externally
/// through [`bind`](ElementMapper::bind). Unknown ids are a normal
/// negative result (`Ok(None)`), not an error; only backing-medium
/// failures surface as `Err`.
pub trait ElementMapper: Send + Sync {
    type Item: Clone;

    /// Stores an object under a freshly assigned id.
    fn store(&mut self, item: Self::Item, envelope: Envelope) -> IndexResult<EntryId>;

    /// Stores an object under an externally supplied id. Rejects ids
    /// that are already bound.
    fn bind(&mut self, id: EntryId, item: Self::Item, envelope: Envelope) -> IndexResult<()>;

    /// Looks up the object and envelope for `id`.
    fn get(&self, id: EntryId) -> IndexResult<Option<(Self::Item, Envelope)>>;

    /// Looks up just the envelope for `id`.
    fn envelope(&self, id: EntryId) -> IndexResult<Option<Envelope>>;

    /// Removes `id`, returning the object it mapped to.
    fn remove(&mut self, id: EntryId) -> IndexResult<Option<Self::Item>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every mapping.
    fn clear(&mut self) -> IndexResult<()>;

    /// Persists pending state, if the backend persists anything.
    fn flush(&mut self) -> IndexResult<()> {
        Ok(())
    }
}

// ============================================================================
// In-Memory Backend
// ============================================================================

/// Hash map backed mapper for transient indexes.
#[derive(Debug, Default)]
pub struct MemoryMapper<T> {
    entries: HashMap<EntryId, (T, Envelope)>,
    next_id: EntryId,
}

impl<T> MemoryMapper<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<T: Clone + Send + Sync> ElementMapper for MemoryMapper<T> {
    type Item = T;

    fn store(&mut self, item: T, envelope: Envelope) -> IndexResult<EntryId> {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, (item, envelope));
        Ok(id)
    }

    fn bind(&mut self, id: EntryId, item: T, envelope: Envelope) -> IndexResult<()> {
        if self.entries.contains_key(&id) {
            return Err(StoreIndexError::InvalidArgument(format!(
                "id {} is already mapped",
                id
            )));
        }
        self.next_id = self.next_id.max(id + 1);
        self.entries.insert(id, (item, envelope));
        Ok(())
    }

    fn get(&self, id: EntryId) -> IndexResult<Option<(T, Envelope)>> {
        Ok(self.entries.get(&id).cloned())
    }

    fn envelope(&self, id: EntryId) -> IndexResult<Option<Envelope>> {
        Ok(self.entries.get(&id).map(|(_, env)| *env))
    }

    fn remove(&mut self, id: EntryId) -> IndexResult<Option<T>> {
        Ok(self.entries.remove(&id).map(|(item, _)| item))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) -> IndexResult<()> {
        self.entries.clear();
        Ok(())
    }
}

// ============================================================================
// File Backend
// ============================================================================

#[derive(Serialize, Deserialize)]
struct MapperSnapshot<T> {
    next_id: EntryId,
    entries: Vec<(EntryId, T, Envelope)>,
}

/// File-backed mapper: the whole table is held in memory and snapshotted
/// to disk on [`flush`](ElementMapper::flush), so mappings survive
/// process restarts alongside the node store.
pub struct FileMapper<T: Serialize + DeserializeOwned + Clone> {
    path: PathBuf,
    entries: HashMap<EntryId, (T, Envelope)>,
    next_id: EntryId,
    dirty: bool,
}

impl<T: Serialize + DeserializeOwned + Clone> FileMapper<T> {
    /// Opens an existing snapshot or starts an empty mapper when the
    /// file does not exist yet.
    pub fn open_or_create(path: &Path) -> IndexResult<Self> {
        if path.exists() {
            let bytes = fs::read(path)?;
            let (snapshot, _): (MapperSnapshot<T>, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::legacy()).map_err(
                    |e| StoreIndexError::Corrupt(format!("undecodable mapper snapshot: {}", e)),
                )?;
            let entries = snapshot
                .entries
                .into_iter()
                .map(|(id, item, env)| (id, (item, env)))
                .collect();
            Ok(Self {
                path: path.to_path_buf(),
                entries,
                next_id: snapshot.next_id,
                dirty: false,
            })
        } else {
            Ok(Self {
                path: path.to_path_buf(),
                entries: HashMap::new(),
                next_id: 0,
                dirty: false,
            })
        }
    }

    fn write_snapshot(&self) -> IndexResult<()> {
        let mut entries: Vec<(EntryId, T, Envelope)> = self
            .entries
            .iter()
            .map(|(id, (item, env))| (*id, item.clone(), *env))
            .collect();
        entries.sort_by_key(|(id, _, _)| *id);
        let snapshot = MapperSnapshot {
            next_id: self.next_id,
            entries,
        };
        let bytes = bincode::serde::encode_to_vec(&snapshot, bincode::config::legacy())
            .map_err(|e| StoreIndexError::Encoding(e.to_string()))?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

impl<T> ElementMapper for FileMapper<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    type Item = T;

    fn store(&mut self, item: T, envelope: Envelope) -> IndexResult<EntryId> {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, (item, envelope));
        self.dirty = true;
        Ok(id)
    }

    fn bind(&mut self, id: EntryId, item: T, envelope: Envelope) -> IndexResult<()> {
        if self.entries.contains_key(&id) {
            return Err(StoreIndexError::InvalidArgument(format!(
                "id {} is already mapped",
                id
            )));
        }
        self.next_id = self.next_id.max(id + 1);
        self.entries.insert(id, (item, envelope));
        self.dirty = true;
        Ok(())
    }

    fn get(&self, id: EntryId) -> IndexResult<Option<(T, Envelope)>> {
        Ok(self.entries.get(&id).cloned())
    }

    fn envelope(&self, id: EntryId) -> IndexResult<Option<Envelope>> {
        Ok(self.entries.get(&id).map(|(_, env)| *env))
    }

    fn remove(&mut self, id: EntryId) -> IndexResult<Option<T>> {
        let removed = self.entries.remove(&id).map(|(item, _)| item);
        if removed.is_some() {
            self.dirty = true;
        }
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) -> IndexResult<()> {
        self.entries.clear();
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> IndexResult<()> {
        if self.dirty {
            self.write_snapshot()?;
            self.dirty = false;
        }
        Ok(())
    }
}

impl<T: Serialize + DeserializeOwned + Clone> Drop for FileMapper<T> {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.write_snapshot() {
                log::warn!("failed to flush element mapper {:?}: {}", self.path, e);
            }
        }
    }
}
