//! Per-key state machine, scoped under a parent entry.
//!
//! Same shape as the entry state machine, except both bounds are optional: a
//! key without its own deadline or budget is limited only by its entry.
//!
//! A key that is spent, expired or revoked keeps its row as a tombstone until
//! its entry is deleted. The row still matches the key's KEK, so every later
//! attempt through that key reports the same outcome.

use tracing::debug;

use super::backend::{ReadTx, WriteTx};
use super::crypto::Digest32;
use super::error::StoreError;
use super::model::{EntryKeyMeta, EntryKeyRecord};

pub struct NewEntryKey<'a> {
    pub id: &'a str,
    pub entry_id: &'a str,
    pub wrapped_dek: Vec<u8>,
    pub dek_hash: Digest32,
    pub ttl_seconds: Option<i64>,
    pub max_reads: Option<i64>,
}

pub fn create_key<T: WriteTx + ?Sized>(
    tx: &mut T,
    new: NewEntryKey<'_>,
    now: i64,
) -> Result<EntryKeyMeta, StoreError> {
    if tx.entry(new.entry_id)?.is_none() {
        return Err(StoreError::CreateFailed(format!(
            "parent entry {} does not exist",
            new.entry_id
        )));
    }
    if tx.entry_key(new.entry_id, new.id)?.is_some() {
        return Err(StoreError::CreateFailed(format!(
            "entry key id collision: {}",
            new.id
        )));
    }

    let record = EntryKeyRecord {
        id: new.id.to_owned(),
        entry_id: new.entry_id.to_owned(),
        wrapped_dek: new.wrapped_dek,
        dek_hash: new.dek_hash,
        created_at: now,
        expires_at: new.ttl_seconds.map(|ttl| now.saturating_add(ttl)),
        remaining_reads: new.max_reads,
    };
    tx.put_entry_key(&record)?;

    debug!(
        entry_id = %record.entry_id,
        key_id = %record.id,
        expires_at = ?record.expires_at,
        max_reads = ?record.remaining_reads,
        "stored entry key"
    );
    Ok(record.meta())
}

/// Every key row of `entry_id`, tombstones included. Used by the read path to
/// find which key a KEK belongs to.
pub fn candidates<T: ReadTx + ?Sized>(
    tx: &T,
    entry_id: &str,
) -> Result<Vec<EntryKeyRecord>, StoreError> {
    tx.entry_keys(entry_id)
}

/// Number of key rows under `entry_id`, tombstones included.
pub fn count<T: ReadTx + ?Sized>(tx: &T, entry_id: &str) -> Result<usize, StoreError> {
    Ok(tx.entry_keys(entry_id)?.len())
}

/// Spend one read of this key's own budget. Never touches the parent entry.
///
/// Returns the remaining metadata while the key stays usable, `None` once it
/// is spent or when the row is missing. A spent row is kept as a tombstone.
pub fn consume<T: WriteTx + ?Sized>(
    tx: &mut T,
    entry_id: &str,
    key_id: &str,
    now: i64,
) -> Result<Option<EntryKeyMeta>, StoreError> {
    let Some(mut record) = tx.entry_key(entry_id, key_id)? else {
        return Ok(None);
    };

    if let Some(remaining) = record.remaining_reads.as_mut() {
        *remaining = (*remaining - 1).max(0);
    }
    tx.put_entry_key(&record)?;

    if record.is_usable(now) {
        Ok(Some(record.meta()))
    } else {
        debug!(entry_id = %entry_id, key_id = %key_id, "entry key spent");
        Ok(None)
    }
}

/// Keys currently inside their own bounds, oldest first.
pub fn list_active<T: ReadTx + ?Sized>(
    tx: &T,
    entry_id: &str,
    now: i64,
) -> Result<Vec<EntryKeyMeta>, StoreError> {
    let mut metas: Vec<EntryKeyMeta> = tx
        .entry_keys(entry_id)?
        .iter()
        .filter(|k| k.is_usable(now))
        .map(EntryKeyRecord::meta)
        .collect();
    metas.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    Ok(metas)
}

/// Turn a usable key into a tombstone. Returns false when the key is missing
/// or already unusable.
pub fn revoke<T: WriteTx + ?Sized>(
    tx: &mut T,
    entry_id: &str,
    key_id: &str,
    now: i64,
) -> Result<bool, StoreError> {
    let Some(mut record) = tx.entry_key(entry_id, key_id)? else {
        return Ok(false);
    };
    if !record.is_usable(now) {
        return Ok(false);
    }
    record.remaining_reads = Some(0);
    tx.put_entry_key(&record)?;
    debug!(entry_id = %entry_id, key_id = %key_id, "revoked entry key");
    Ok(true)
}

/// Physically remove one key row.
pub fn delete<T: WriteTx + ?Sized>(
    tx: &mut T,
    entry_id: &str,
    key_id: &str,
) -> Result<bool, StoreError> {
    let existed = tx.remove_entry_key(entry_id, key_id)?;
    if existed {
        debug!(entry_id = %entry_id, key_id = %key_id, "deleted entry key");
    }
    Ok(existed)
}

/// Cascade for a deleted entry.
pub fn delete_for_entry<T: WriteTx + ?Sized>(
    tx: &mut T,
    entry_id: &str,
) -> Result<usize, StoreError> {
    tx.remove_entry_keys(entry_id)
}

/// Remove key rows whose parent entry no longer exists. Tombstones of a live
/// entry stay; they go with the entry.
pub fn delete_expired<T: WriteTx + ?Sized>(tx: &mut T) -> Result<usize, StoreError> {
    let mut orphans: Vec<(String, String)> = Vec::new();
    for key in tx.all_entry_keys()? {
        if tx.entry(&key.entry_id)?.is_none() {
            orphans.push((key.entry_id.clone(), key.id.clone()));
        }
    }
    for (entry_id, key_id) in &orphans {
        delete(tx, entry_id, key_id)?;
    }
    Ok(orphans.len())
}
