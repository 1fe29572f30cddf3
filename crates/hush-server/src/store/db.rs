use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use tracing::warn;

use super::backend::{
    decode, encode, entry_key_bounds, entry_key_path, ReadTx, Storage, WriteTx,
};
use super::error::StoreError;
use super::model::{EntryKeyRecord, EntryRecord};

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");
/// Keyed by `"{entry_id}/{key_id}"`; see [`entry_key_path`].
const ENTRY_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("entry_keys");

macro_rules! backend_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(e: $ty) -> Self {
                    StoreError::Backend(e.to_string())
                }
            }
        )*
    };
}

backend_error!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Thread-safe handle to the redb store.
///
/// redb admits one write transaction at a time; `begin_write` blocks until the
/// previous writer commits or aborts. That is the serialization point for
/// every consuming read.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path)?;

        // Ensure all tables exist so read transactions can open them.
        let write_txn = db.begin_write()?;
        write_txn.open_table(ENTRIES)?;
        write_txn.open_table(ENTRY_KEYS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl Storage for RedbStorage {
    fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn ReadTx) -> Result<T, StoreError>,
    {
        let read_txn = self.db.begin_read()?;
        f(&RedbRead { txn: &read_txn })
    }

    fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn WriteTx) -> Result<T, StoreError>,
    {
        let write_txn = self.db.begin_write()?;
        let result = f(&mut RedbWrite { txn: &write_txn });
        match result {
            Ok(value) => {
                write_txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = write_txn.abort() {
                    warn!(error = %abort_err, "aborting write transaction failed");
                }
                Err(e)
            }
        }
    }
}

struct RedbRead<'t> {
    txn: &'t ReadTransaction,
}

struct RedbWrite<'t> {
    txn: &'t WriteTransaction,
}

fn lookup<R, T>(table: &T, key: &str) -> Result<Option<R>, StoreError>
where
    R: DeserializeOwned,
    T: ReadableTable<&'static str, &'static [u8]>,
{
    // Copy the bytes out so the AccessGuard is dropped before decoding.
    let raw: Option<Vec<u8>> = table.get(key)?.map(|guard| guard.value().to_vec());
    raw.map(|bytes| decode(&bytes)).transpose()
}

fn scan_all<R, T>(table: &T) -> Result<Vec<R>, StoreError>
where
    R: DeserializeOwned,
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut out = Vec::new();
    for item in table.iter()? {
        let (_k, v) = item?;
        out.push(decode(v.value())?);
    }
    Ok(out)
}

/// Storage keys and records of every key row under `entry_id`.
fn scan_entry_keys<T>(table: &T, entry_id: &str) -> Result<Vec<(String, EntryKeyRecord)>, StoreError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let (lo, hi) = entry_key_bounds(entry_id);
    let mut out = Vec::new();
    for item in table.range(lo.as_str()..hi.as_str())? {
        let (k, v) = item?;
        out.push((k.value().to_owned(), decode(v.value())?));
    }
    Ok(out)
}

macro_rules! impl_read_tx {
    ($ty:ident) => {
        impl ReadTx for $ty<'_> {
            fn entry(&self, id: &str) -> Result<Option<EntryRecord>, StoreError> {
                let table = self.txn.open_table(ENTRIES)?;
                lookup(&table, id)
            }

            fn entries(&self) -> Result<Vec<EntryRecord>, StoreError> {
                let table = self.txn.open_table(ENTRIES)?;
                scan_all(&table)
            }

            fn entry_key(
                &self,
                entry_id: &str,
                key_id: &str,
            ) -> Result<Option<EntryKeyRecord>, StoreError> {
                let table = self.txn.open_table(ENTRY_KEYS)?;
                lookup(&table, &entry_key_path(entry_id, key_id))
            }

            fn entry_keys(&self, entry_id: &str) -> Result<Vec<EntryKeyRecord>, StoreError> {
                let table = self.txn.open_table(ENTRY_KEYS)?;
                Ok(scan_entry_keys(&table, entry_id)?
                    .into_iter()
                    .map(|(_path, record)| record)
                    .collect())
            }

            fn all_entry_keys(&self) -> Result<Vec<EntryKeyRecord>, StoreError> {
                let table = self.txn.open_table(ENTRY_KEYS)?;
                scan_all(&table)
            }
        }
    };
}

impl_read_tx!(RedbRead);
impl_read_tx!(RedbWrite);

impl WriteTx for RedbWrite<'_> {
    fn put_entry(&mut self, record: &EntryRecord) -> Result<(), StoreError> {
        let bytes = encode(record)?;
        let mut table = self.txn.open_table(ENTRIES)?;
        table.insert(record.id.as_str(), bytes.as_slice())?;
        Ok(())
    }

    fn remove_entry(&mut self, id: &str) -> Result<bool, StoreError> {
        let mut table = self.txn.open_table(ENTRIES)?;
        let existed = table.remove(id)?.is_some();
        Ok(existed)
    }

    fn put_entry_key(&mut self, record: &EntryKeyRecord) -> Result<(), StoreError> {
        let bytes = encode(record)?;
        let path = entry_key_path(&record.entry_id, &record.id);
        let mut table = self.txn.open_table(ENTRY_KEYS)?;
        table.insert(path.as_str(), bytes.as_slice())?;
        Ok(())
    }

    fn remove_entry_key(&mut self, entry_id: &str, key_id: &str) -> Result<bool, StoreError> {
        let path = entry_key_path(entry_id, key_id);
        let mut table = self.txn.open_table(ENTRY_KEYS)?;
        let existed = table.remove(path.as_str())?.is_some();
        Ok(existed)
    }

    fn remove_entry_keys(&mut self, entry_id: &str) -> Result<usize, StoreError> {
        let mut table = self.txn.open_table(ENTRY_KEYS)?;
        let paths: Vec<String> = scan_entry_keys(&table, entry_id)?
            .into_iter()
            .map(|(path, _record)| path)
            .collect();
        for path in &paths {
            table.remove(path.as_str())?;
        }
        Ok(paths.len())
    }
}
