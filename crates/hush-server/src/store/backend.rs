//! The transactional storage capability the entry and key stores run on.
//!
//! A backend hands a closure either a read snapshot or a write transaction.
//! Write transactions are all-or-nothing: when the closure returns `Err`
//! nothing it did is visible to anyone, and two write transactions never
//! interleave.

use serde::{de::DeserializeOwned, Serialize};

use super::error::StoreError;
use super::memory::MemoryStorage;
use super::model::{EntryKeyRecord, EntryRecord};
use super::db::RedbStorage;

/// Version byte prefixed to every encoded record.
const RECORD_FORMAT_V1: u8 = 0x01;

pub trait ReadTx {
    fn entry(&self, id: &str) -> Result<Option<EntryRecord>, StoreError>;

    /// Every entry row, live or not.
    fn entries(&self) -> Result<Vec<EntryRecord>, StoreError>;

    fn entry_key(&self, entry_id: &str, key_id: &str) -> Result<Option<EntryKeyRecord>, StoreError>;

    /// All key rows of one entry, in storage order.
    fn entry_keys(&self, entry_id: &str) -> Result<Vec<EntryKeyRecord>, StoreError>;

    /// Every key row across all entries.
    fn all_entry_keys(&self) -> Result<Vec<EntryKeyRecord>, StoreError>;
}

pub trait WriteTx: ReadTx {
    /// Insert or overwrite.
    fn put_entry(&mut self, record: &EntryRecord) -> Result<(), StoreError>;

    /// Returns true if the row existed.
    fn remove_entry(&mut self, id: &str) -> Result<bool, StoreError>;

    /// Insert or overwrite.
    fn put_entry_key(&mut self, record: &EntryKeyRecord) -> Result<(), StoreError>;

    /// Returns true if the row existed.
    fn remove_entry_key(&mut self, entry_id: &str, key_id: &str) -> Result<bool, StoreError>;

    /// Remove every key row of `entry_id`. Returns how many were removed.
    fn remove_entry_keys(&mut self, entry_id: &str) -> Result<usize, StoreError>;
}

pub trait Storage: Send + Sync {
    fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn ReadTx) -> Result<T, StoreError>;

    fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn WriteTx) -> Result<T, StoreError>;
}

/// Runtime-selected backend, so the server can be configured without
/// monomorphising handlers per storage type.
#[derive(Clone)]
pub enum Backend {
    Redb(RedbStorage),
    Memory(MemoryStorage),
}

impl Storage for Backend {
    fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn ReadTx) -> Result<T, StoreError>,
    {
        match self {
            Backend::Redb(s) => s.read(f),
            Backend::Memory(s) => s.read(f),
        }
    }

    fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn WriteTx) -> Result<T, StoreError>,
    {
        match self {
            Backend::Redb(s) => s.write(f),
            Backend::Memory(s) => s.write(f),
        }
    }
}

impl From<RedbStorage> for Backend {
    fn from(s: RedbStorage) -> Self {
        Backend::Redb(s)
    }
}

impl From<MemoryStorage> for Backend {
    fn from(s: MemoryStorage) -> Self {
        Backend::Memory(s)
    }
}

/// Storage key of an entry-key row: `"{entry_id}/{key_id}"`.
/// All keys of one entry sort into one contiguous range.
pub(crate) fn entry_key_path(entry_id: &str, key_id: &str) -> String {
    format!("{entry_id}/{key_id}")
}

/// Half-open `[lo, hi)` bounds covering every key path of `entry_id`.
/// `'0'` is the byte right after `'/'`.
pub(crate) fn entry_key_bounds(entry_id: &str) -> (String, String) {
    (format!("{entry_id}/"), format!("{entry_id}0"))
}

/// Encode a record as `[RECORD_FORMAT_V1] + bincode(record)`.
pub(crate) fn encode<R: Serialize>(record: &R) -> Result<Vec<u8>, StoreError> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::Codec(format!("bincode encode: {e}")))?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_FORMAT_V1);
    out.extend_from_slice(&payload);
    Ok(out)
}

pub(crate) fn decode<R: DeserializeOwned>(bytes: &[u8]) -> Result<R, StoreError> {
    match bytes.split_first() {
        Some((&RECORD_FORMAT_V1, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .map_err(|e| StoreError::Codec(format!("bincode decode: {e}")))?;
            Ok(record)
        }
        Some((marker, _)) => Err(StoreError::Codec(format!(
            "unknown record format {marker:#04x}"
        ))),
        None => Err(StoreError::Codec("empty record".into())),
    }
}
