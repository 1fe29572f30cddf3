use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::backend::{entry_key_bounds, entry_key_path, ReadTx, Storage, WriteTx};
use super::error::StoreError;
use super::model::{EntryKeyRecord, EntryRecord};

/// In-process backend for tests and throwaway deployments. Nothing survives a
/// restart.
///
/// The mutex is held for the whole closure, so transactions are fully
/// serialized. A write edits the live tables in place and logs the prior
/// value of every row it touches; if the closure returns `Err` the log is
/// replayed backwards. A panicking closure poisons the lock, after which
/// every call fails.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<Mutex<Tables>>,
}

#[derive(Default)]
struct Tables {
    entries: BTreeMap<String, EntryRecord>,
    /// Keyed by `"{entry_id}/{key_id}"`, same as the redb table.
    entry_keys: BTreeMap<String, EntryKeyRecord>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("memory store lock poisoned".into())
}

impl Storage for MemoryStorage {
    fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn ReadTx) -> Result<T, StoreError>,
    {
        let guard = self.tables.lock().map_err(|_| poisoned())?;
        f(&*guard)
    }

    fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn WriteTx) -> Result<T, StoreError>,
    {
        let mut guard = self.tables.lock().map_err(|_| poisoned())?;
        let mut tx = MemoryTx {
            tables: &mut *guard,
            undo: Vec::new(),
        };
        match f(&mut tx) {
            Ok(value) => Ok(value),
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }
}

/// Prior state of one touched row; `None` means it did not exist.
enum Undo {
    Entry(String, Option<EntryRecord>),
    Key(String, Option<EntryKeyRecord>),
}

struct MemoryTx<'a> {
    tables: &'a mut Tables,
    undo: Vec<Undo>,
}

impl MemoryTx<'_> {
    fn rollback(self) {
        let tables = self.tables;
        for step in self.undo.into_iter().rev() {
            match step {
                Undo::Entry(id, Some(prior)) => {
                    tables.entries.insert(id, prior);
                }
                Undo::Entry(id, None) => {
                    tables.entries.remove(&id);
                }
                Undo::Key(path, Some(prior)) => {
                    tables.entry_keys.insert(path, prior);
                }
                Undo::Key(path, None) => {
                    tables.entry_keys.remove(&path);
                }
            }
        }
    }
}

impl ReadTx for Tables {
    fn entry(&self, id: &str) -> Result<Option<EntryRecord>, StoreError> {
        Ok(self.entries.get(id).cloned())
    }

    fn entries(&self) -> Result<Vec<EntryRecord>, StoreError> {
        Ok(self.entries.values().cloned().collect())
    }

    fn entry_key(&self, entry_id: &str, key_id: &str) -> Result<Option<EntryKeyRecord>, StoreError> {
        Ok(self.entry_keys.get(&entry_key_path(entry_id, key_id)).cloned())
    }

    fn entry_keys(&self, entry_id: &str) -> Result<Vec<EntryKeyRecord>, StoreError> {
        let (lo, hi) = entry_key_bounds(entry_id);
        Ok(self.entry_keys.range(lo..hi).map(|(_, k)| k.clone()).collect())
    }

    fn all_entry_keys(&self) -> Result<Vec<EntryKeyRecord>, StoreError> {
        Ok(self.entry_keys.values().cloned().collect())
    }
}

impl ReadTx for MemoryTx<'_> {
    fn entry(&self, id: &str) -> Result<Option<EntryRecord>, StoreError> {
        self.tables.entry(id)
    }

    fn entries(&self) -> Result<Vec<EntryRecord>, StoreError> {
        self.tables.entries()
    }

    fn entry_key(&self, entry_id: &str, key_id: &str) -> Result<Option<EntryKeyRecord>, StoreError> {
        self.tables.entry_key(entry_id, key_id)
    }

    fn entry_keys(&self, entry_id: &str) -> Result<Vec<EntryKeyRecord>, StoreError> {
        self.tables.entry_keys(entry_id)
    }

    fn all_entry_keys(&self) -> Result<Vec<EntryKeyRecord>, StoreError> {
        self.tables.all_entry_keys()
    }
}

impl WriteTx for MemoryTx<'_> {
    fn put_entry(&mut self, record: &EntryRecord) -> Result<(), StoreError> {
        let prior = self.tables.entries.insert(record.id.clone(), record.clone());
        self.undo.push(Undo::Entry(record.id.clone(), prior));
        Ok(())
    }

    fn remove_entry(&mut self, id: &str) -> Result<bool, StoreError> {
        let prior = self.tables.entries.remove(id);
        let existed = prior.is_some();
        if existed {
            self.undo.push(Undo::Entry(id.to_owned(), prior));
        }
        Ok(existed)
    }

    fn put_entry_key(&mut self, record: &EntryKeyRecord) -> Result<(), StoreError> {
        let path = entry_key_path(&record.entry_id, &record.id);
        let prior = self.tables.entry_keys.insert(path.clone(), record.clone());
        self.undo.push(Undo::Key(path, prior));
        Ok(())
    }

    fn remove_entry_key(&mut self, entry_id: &str, key_id: &str) -> Result<bool, StoreError> {
        let path = entry_key_path(entry_id, key_id);
        let prior = self.tables.entry_keys.remove(&path);
        let existed = prior.is_some();
        if existed {
            self.undo.push(Undo::Key(path, prior));
        }
        Ok(existed)
    }

    fn remove_entry_keys(&mut self, entry_id: &str) -> Result<usize, StoreError> {
        let (lo, hi) = entry_key_bounds(entry_id);
        let paths: Vec<String> = self
            .tables
            .entry_keys
            .range(lo..hi)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &paths {
            let prior = self.tables.entry_keys.remove(path);
            self.undo.push(Undo::Key(path.clone(), prior));
        }
        Ok(paths.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> EntryRecord {
        EntryRecord {
            id: id.into(),
            ciphertext: vec![1; 40],
            content_type: "application/octet-stream".into(),
            created_at: 0,
            accessed_at: None,
            expires_at: 10,
            remaining_reads: 1,
            delete_token_hash: [0u8; 32],
        }
    }

    #[test]
    fn write_is_all_or_nothing() {
        let s = MemoryStorage::new();
        s.write(|tx| tx.put_entry(&entry("keep"))).unwrap();

        let failed: Result<(), StoreError> = s.write(|tx| {
            tx.remove_entry("keep")?;
            tx.put_entry(&entry("ghost"))?;
            Err(StoreError::NotFound)
        });
        assert!(failed.is_err());

        assert!(s.read(|tx| tx.entry("keep")).unwrap().is_some());
        assert!(s.read(|tx| tx.entry("ghost")).unwrap().is_none());
    }

    fn key(entry_id: &str, id: &str, remaining_reads: Option<i64>) -> EntryKeyRecord {
        EntryKeyRecord {
            id: id.into(),
            entry_id: entry_id.into(),
            wrapped_dek: vec![2; 60],
            dek_hash: [0u8; 32],
            created_at: 0,
            expires_at: None,
            remaining_reads,
        }
    }

    #[test]
    fn failed_write_restores_key_rows() {
        let s = MemoryStorage::new();
        s.write(|tx| {
            tx.put_entry(&entry("e"))?;
            tx.put_entry_key(&key("e", "a", Some(3)))?;
            tx.put_entry_key(&key("e", "b", None))
        })
        .unwrap();

        let failed: Result<(), StoreError> = s.write(|tx| {
            // Touch the same row twice; rollback must land on the oldest value.
            tx.put_entry_key(&key("e", "a", Some(2)))?;
            tx.put_entry_key(&key("e", "a", Some(1)))?;
            tx.put_entry_key(&key("e", "c", Some(9)))?;
            tx.remove_entry_keys("e")?;
            tx.remove_entry("e")?;
            Err(StoreError::Backend("disk full".into()))
        });
        assert!(failed.is_err());

        let keys = s.read(|tx| tx.entry_keys("e")).unwrap();
        let ids: Vec<(&str, Option<i64>)> = keys
            .iter()
            .map(|k| (k.id.as_str(), k.remaining_reads))
            .collect();
        assert_eq!(ids, vec![("a", Some(3)), ("b", None)]);
        assert!(s.read(|tx| tx.entry("e")).unwrap().is_some());
    }

    #[test]
    fn writes_see_their_own_changes() {
        let s = MemoryStorage::new();
        let seen = s
            .write(|tx| {
                tx.put_entry(&entry("e"))?;
                tx.put_entry_key(&key("e", "a", None))?;
                Ok(tx.entry_keys("e")?.len())
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn clones_share_state() {
        let a = MemoryStorage::new();
        let b = a.clone();
        a.write(|tx| tx.put_entry(&entry("x"))).unwrap();
        assert_eq!(b.read(|tx| tx.entries()).unwrap().len(), 1);
    }
}
