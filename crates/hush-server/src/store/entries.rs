//! Entry state machine.
//!
//! ```text
//! Active(remaining > 0, now < expires_at) ──read──▶ Active
//!        │                                  └──last read──▶ Deleted
//!        └── deadline passes / counter <= 0 ──▶ Expired ──lazy purge or sweep──▶ Deleted
//! ```
//!
//! Every function runs inside the caller's transaction. A row that is no longer
//! active is never handed back by a read path, even while it still exists.

use tracing::debug;

use super::backend::{ReadTx, WriteTx};
use super::crypto::{self, Digest32, DIGEST_LEN};
use super::entry_keys;
use super::error::StoreError;
use super::model::{EntryMeta, EntryRecord};

pub struct NewEntry<'a> {
    pub id: &'a str,
    pub ciphertext: Vec<u8>,
    pub content_type: &'a str,
    pub ttl_seconds: i64,
    pub max_reads: i64,
    pub delete_token_hash: Digest32,
}

/// Result of a consuming read.
pub struct Consumed {
    /// Payload as it was before the read mutated anything.
    pub ciphertext: Vec<u8>,
    /// Post-decrement metadata.
    pub meta: EntryMeta,
    /// True when this read used the last unit and the row is gone.
    pub burned: bool,
}

pub fn create<T: WriteTx + ?Sized>(
    tx: &mut T,
    new: NewEntry<'_>,
    now: i64,
) -> Result<EntryMeta, StoreError> {
    if tx.entry(new.id)?.is_some() {
        return Err(StoreError::CreateFailed(format!(
            "entry id collision: {}",
            new.id
        )));
    }

    let record = EntryRecord {
        id: new.id.to_owned(),
        ciphertext: new.ciphertext,
        content_type: new.content_type.to_owned(),
        created_at: now,
        accessed_at: None,
        expires_at: now.saturating_add(new.ttl_seconds),
        remaining_reads: new.max_reads,
        delete_token_hash: new.delete_token_hash,
    };
    tx.put_entry(&record)?;

    debug!(entry_id = %record.id, expires_at = record.expires_at, "stored entry");
    Ok(record.meta())
}

/// Look up an entry that is still active.
fn active<T: ReadTx + ?Sized>(tx: &T, id: &str, now: i64) -> Result<EntryRecord, StoreError> {
    match tx.entry(id)? {
        None => Err(StoreError::NotFound),
        Some(record) if !record.is_active(now) => Err(StoreError::Expired),
        Some(record) => Ok(record),
    }
}

/// Consume one read. Deletes the row (and its keys) in the same transaction
/// when no reads remain afterwards or the deadline has passed.
pub fn read_and_consume<T: WriteTx + ?Sized>(
    tx: &mut T,
    id: &str,
    now: i64,
) -> Result<Consumed, StoreError> {
    let mut record = active(&*tx, id, now)?;
    let ciphertext = record.ciphertext.clone();

    record.remaining_reads -= 1;
    record.accessed_at = Some(now);
    let meta = record.meta();

    let burned = !record.is_active(now);
    if burned {
        delete(tx, id)?;
        debug!(entry_id = %id, "burned after final read");
    } else {
        tx.put_entry(&record)?;
        debug!(entry_id = %id, remaining_reads = record.remaining_reads, "consumed read");
    }

    Ok(Consumed {
        ciphertext,
        meta,
        burned,
    })
}

/// Metadata of an active entry, without consuming a read.
pub fn read_meta<T: ReadTx + ?Sized>(tx: &T, id: &str, now: i64) -> Result<EntryMeta, StoreError> {
    Ok(active(tx, id, now)?.meta())
}

/// Constant-time check of `token` against the stored digest. A missing row
/// yields `false` after the same hashing work as a present one.
pub fn verify_delete<T: ReadTx + ?Sized>(tx: &T, id: &str, token: &str) -> Result<bool, StoreError> {
    let presented = crypto::hash(token.as_bytes());
    let record = tx.entry(id)?;
    let stored = record
        .as_ref()
        .map(|r| r.delete_token_hash)
        .unwrap_or([0u8; DIGEST_LEN]);
    let matches = crypto::digest_eq(&presented, &stored);
    Ok(matches && record.is_some())
}

/// Remove an entry and all of its keys. Deleting a missing id is not an error.
pub fn delete<T: WriteTx + ?Sized>(tx: &mut T, id: &str) -> Result<bool, StoreError> {
    let keys = entry_keys::delete_for_entry(tx, id)?;
    let existed = tx.remove_entry(id)?;
    if existed {
        debug!(entry_id = %id, keys, "deleted entry");
    }
    Ok(existed)
}

/// Remove every entry past its deadline or out of reads, along with its keys.
/// Returns the removed ids.
pub fn delete_expired<T: WriteTx + ?Sized>(tx: &mut T, now: i64) -> Result<Vec<String>, StoreError> {
    let dead: Vec<String> = tx
        .entries()?
        .iter()
        .filter(|r| !r.is_active(now))
        .map(|r| r.id.clone())
        .collect();

    for id in &dead {
        delete(tx, id)?;
    }
    Ok(dead)
}
