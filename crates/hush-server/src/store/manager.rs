//! Orchestrates the entry and key stores into the operations callers use.
//!
//! Every operation runs inside a single storage transaction, so a failure at
//! any step leaves no trace. Reasons a secret is unavailable (never existed,
//! expired, used up) are collapsed into [`Error::NotFound`].

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{ReadTx, Storage};
use super::crypto::{self, CryptoError, SecretKey};
use super::entries::{self, NewEntry};
use super::entry_keys::{self, NewEntryKey};
use super::error::{Error, StoreError};
use super::model::{unix_now, EntryKeyMeta, EntryKeyRecord, EntryMeta};
use super::wrap;

/// Bounds applied to caller-requested TTLs, read counts and key fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_ttl_seconds: i64,
    pub max_reads: i64,
    /// Key rows per entry, spent ones included. Every read tries each of
    /// them, so this bounds the work a read does.
    pub max_keys_per_entry: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_ttl_seconds: 7 * 86_400,
            max_reads: 100,
            max_keys_per_entry: 16,
        }
    }
}

impl Limits {
    /// Upper-bound only: a negative TTL stays negative (already expired).
    fn ttl(&self, requested: i64) -> i64 {
        requested.min(self.max_ttl_seconds)
    }

    fn reads(&self, requested: i64) -> i64 {
        requested.clamp(1, self.max_reads.max(1))
    }
}

pub struct NewSecret<'a> {
    pub plaintext: &'a [u8],
    pub content_type: &'a str,
    pub ttl_seconds: i64,
    pub max_reads: i64,
}

/// Everything the writer gets back. `key` and `delete_token` are shown once.
#[derive(Clone)]
pub struct CreatedSecret {
    pub entry_id: String,
    pub key_id: String,
    /// Hex KEK of the first key.
    pub key: String,
    pub delete_token: String,
    pub meta: EntryMeta,
}

pub struct RevealedSecret {
    pub plaintext: Vec<u8>,
    pub content_type: String,
    /// Entry state after this read.
    pub meta: EntryMeta,
    /// True when this read used the entry's last unit.
    pub burned: bool,
}

#[derive(Clone)]
pub struct MintedKey {
    pub key_id: String,
    /// Hex KEK of the new key.
    pub key: String,
    pub meta: EntryKeyMeta,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub entries: usize,
    pub keys: usize,
}

impl std::fmt::Debug for CreatedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedSecret")
            .field("entry_id", &self.entry_id)
            .field("key_id", &self.key_id)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for RevealedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevealedSecret")
            .field("content_type", &self.content_type)
            .field("meta", &self.meta)
            .field("burned", &self.burned)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for MintedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MintedKey")
            .field("key_id", &self.key_id)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Which stored key a presented KEK opened.
struct Matched {
    record: EntryKeyRecord,
    dek: SecretKey,
}

pub struct Manager<S> {
    storage: S,
    limits: Limits,
}

impl<S: Storage> Manager<S> {
    pub fn new(storage: S, limits: Limits) -> Self {
        Self { storage, limits }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Encrypt and store a new secret with its first access key.
    pub fn create_secret(&self, new: NewSecret<'_>) -> Result<CreatedSecret, Error> {
        let now = unix_now();
        let ttl_seconds = self.limits.ttl(new.ttl_seconds);
        let max_reads = self.limits.reads(new.max_reads);

        let dek = crypto::generate_key();
        let ciphertext = crypto::encrypt(dek.as_bytes(), new.plaintext).map_err(StoreError::from)?;
        let (wrapped_dek, kek) = wrap::wrap(&dek).map_err(StoreError::from)?;
        let dek_hash = crypto::hash(dek.as_bytes());

        let entry_id = Uuid::new_v4().to_string();
        let key_id = Uuid::new_v4().to_string();
        let delete_token = crypto::generate_token();
        let delete_token_hash = crypto::hash(delete_token.as_bytes());

        let meta = self.storage.write(|tx| {
            let meta = entries::create(
                tx,
                NewEntry {
                    id: &entry_id,
                    ciphertext,
                    content_type: new.content_type,
                    ttl_seconds,
                    max_reads,
                    delete_token_hash,
                },
                now,
            )?;
            entry_keys::create_key(
                tx,
                NewEntryKey {
                    id: &key_id,
                    entry_id: &entry_id,
                    wrapped_dek,
                    dek_hash,
                    ttl_seconds: Some(ttl_seconds),
                    max_reads: Some(max_reads),
                },
                now,
            )?;
            Ok(meta)
        })?;

        info!(entry_id = %entry_id, ttl_seconds, max_reads, "secret created");
        Ok(CreatedSecret {
            entry_id,
            key_id,
            key: kek.to_hex(),
            delete_token,
            meta,
        })
    }

    /// Decrypt a secret, spending one read from both the entry and the key
    /// that was presented.
    pub fn read_secret(&self, entry_id: &str, key: &str) -> Result<RevealedSecret, Error> {
        let kek = SecretKey::from_hex(key).map_err(|_| Error::KeyInvalid)?;
        let now = unix_now();

        let result = self.storage.write(|tx| {
            entries::read_meta(&*tx, entry_id, now)?;
            let Matched { record, dek } = select_key(&*tx, entry_id, &kek)?;
            if !record.is_usable(now) {
                return Err(StoreError::Expired);
            }

            entry_keys::consume(tx, entry_id, &record.id, now)?;
            let consumed = entries::read_and_consume(tx, entry_id, now)?;

            // The DEK was verified against its hash, so a failure here means
            // the stored payload is damaged, not that the caller is wrong.
            let plaintext = crypto::decrypt(dek.as_bytes(), &consumed.ciphertext)
                .map_err(|_| StoreError::Codec("payload failed authentication".into()))?;

            Ok(RevealedSecret {
                plaintext,
                content_type: consumed.meta.content_type.clone(),
                meta: consumed.meta,
                burned: consumed.burned,
            })
        });

        let revealed = self.settle(entry_id, now, result)?;
        debug!(
            entry_id = %entry_id,
            remaining_reads = revealed.meta.remaining_reads,
            burned = revealed.burned,
            "secret read"
        );
        Ok(revealed)
    }

    /// Status of a secret without spending a read.
    pub fn read_meta(&self, entry_id: &str) -> Result<EntryMeta, Error> {
        let now = unix_now();
        let result = self
            .storage
            .read(|tx| entries::read_meta(tx, entry_id, now));
        self.settle(entry_id, now, result)
    }

    /// Issue another key for the same DEK. The caller proves possession with a
    /// key that is currently usable; that key's budget is not spent. The new
    /// key never outlives or out-reads the key that minted it.
    pub fn mint_key(
        &self,
        entry_id: &str,
        existing_key: &str,
        ttl_seconds: Option<i64>,
        max_reads: Option<i64>,
    ) -> Result<MintedKey, Error> {
        let kek = SecretKey::from_hex(existing_key).map_err(|_| Error::KeyInvalid)?;
        let now = unix_now();
        let ttl_seconds = ttl_seconds.map(|t| self.limits.ttl(t));
        let max_reads = max_reads.map(|r| self.limits.reads(r));
        let key_id = Uuid::new_v4().to_string();

        let result = self.storage.write(|tx| {
            entries::read_meta(&*tx, entry_id, now)?;
            let Matched { record, dek } = select_key(&*tx, entry_id, &kek)?;
            if !record.is_usable(now) {
                return Err(StoreError::Expired);
            }

            if entry_keys::count(&*tx, entry_id)? >= self.limits.max_keys_per_entry {
                return Err(StoreError::KeyLimit);
            }

            let requested_expiry = ttl_seconds.map(|t| now.saturating_add(t));
            let expires_at = tighter(requested_expiry, record.expires_at);
            let max_reads = tighter(max_reads, record.remaining_reads);

            let (wrapped_dek, new_kek) = wrap::wrap(&dek)?;
            let meta = entry_keys::create_key(
                tx,
                NewEntryKey {
                    id: &key_id,
                    entry_id,
                    wrapped_dek,
                    dek_hash: record.dek_hash,
                    ttl_seconds: expires_at.map(|at| at - now),
                    max_reads,
                },
                now,
            )?;
            Ok(MintedKey {
                key_id: key_id.clone(),
                key: new_kek.to_hex(),
                meta,
            })
        });

        let minted = self.settle(entry_id, now, result)?;
        info!(entry_id = %entry_id, key_id = %minted.key_id, "minted entry key");
        Ok(minted)
    }

    /// Usable keys of a secret. The delete token proves ownership.
    pub fn list_keys(&self, entry_id: &str, delete_token: &str) -> Result<Vec<EntryKeyMeta>, Error> {
        let now = unix_now();
        let result = self.storage.read(|tx| {
            entries::read_meta(tx, entry_id, now)?;
            authorize(tx, entry_id, delete_token)?;
            entry_keys::list_active(tx, entry_id, now)
        });
        self.settle(entry_id, now, result)
    }

    /// Revoke one key. Other keys of the secret keep working; the revoked key
    /// reads as `NotFound` from now on.
    pub fn revoke_key(&self, entry_id: &str, key_id: &str, delete_token: &str) -> Result<(), Error> {
        let now = unix_now();
        let result = self.storage.write(|tx| {
            entries::read_meta(&*tx, entry_id, now)?;
            authorize(&*tx, entry_id, delete_token)?;
            if entry_keys::revoke(tx, entry_id, key_id, now)? {
                Ok(())
            } else {
                Err(StoreError::NotFound)
            }
        });
        self.settle(entry_id, now, result)?;
        info!(entry_id = %entry_id, key_id = %key_id, "revoked entry key");
        Ok(())
    }

    /// Delete a secret and all of its keys.
    pub fn delete_secret(&self, entry_id: &str, delete_token: &str) -> Result<(), Error> {
        let now = unix_now();
        let result = self.storage.write(|tx| {
            entries::read_meta(&*tx, entry_id, now)?;
            authorize(&*tx, entry_id, delete_token)?;
            entries::delete(tx, entry_id)?;
            Ok(())
        });
        self.settle(entry_id, now, result)?;
        info!(entry_id = %entry_id, "secret deleted");
        Ok(())
    }

    /// Remove every expired or used-up entry with its keys, plus any orphaned
    /// key rows. Safe to run alongside reads: it is one write transaction like
    /// any other.
    pub fn delete_expired(&self) -> Result<SweepReport, Error> {
        let now = unix_now();
        let report = self.storage.write(|tx| {
            let entries = entries::delete_expired(tx, now)?.len();
            let keys = entry_keys::delete_expired(tx)?;
            Ok(SweepReport { entries, keys })
        })?;
        if report.entries > 0 || report.keys > 0 {
            info!(entries = report.entries, keys = report.keys, "swept expired secrets");
        }
        Ok(report)
    }

    /// Map a store result to the public error, purging rows found to be
    /// logically gone.
    fn settle<T>(&self, entry_id: &str, now: i64, result: Result<T, StoreError>) -> Result<T, Error> {
        match result {
            Ok(value) => Ok(value),
            Err(StoreError::Expired) => {
                self.purge(entry_id, now);
                Err(Error::NotFound)
            }
            Err(e @ (StoreError::Backend(_) | StoreError::Codec(_))) => {
                warn!(entry_id = %entry_id, error = %e, "storage failure");
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lazy cleanup: drop the entry and its keys if it is no longer active.
    /// Spent keys of a live entry stay as tombstones. Failures are left for
    /// the sweep.
    fn purge(&self, entry_id: &str, now: i64) {
        let result = self.storage.write(|tx| match tx.entry(entry_id)? {
            Some(entry) if !entry.is_active(now) => entries::delete(tx, entry_id),
            _ => Ok(false),
        });
        match result {
            Ok(true) => debug!(entry_id = %entry_id, "lazy-evicted expired entry"),
            Ok(false) => {}
            Err(e) => warn!(entry_id = %entry_id, error = %e, "lazy eviction failed"),
        }
    }
}

/// Find the key row `kek` unwraps. Every candidate is tried so the time taken
/// does not depend on which one matches.
fn select_key<T: ReadTx + ?Sized>(
    tx: &T,
    entry_id: &str,
    kek: &SecretKey,
) -> Result<Matched, StoreError> {
    let mut matched = None;
    for candidate in entry_keys::candidates(tx, entry_id)? {
        let dek = match wrap::unwrap(kek, &candidate.wrapped_dek) {
            Ok(dek) => dek,
            Err(CryptoError::AuthenticationFailed) => continue,
            Err(e) => return Err(e.into()),
        };
        let intact = crypto::digest_eq(&crypto::hash(dek.as_bytes()), &candidate.dek_hash);
        if intact && matched.is_none() {
            matched = Some(Matched {
                record: candidate,
                dek,
            });
        }
    }
    matched.ok_or(StoreError::Crypto(CryptoError::AuthenticationFailed))
}

/// The stricter of two optional bounds; `None` is unbounded.
fn tighter(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn authorize<T: ReadTx + ?Sized>(tx: &T, entry_id: &str, token: &str) -> Result<(), StoreError> {
    if entries::verify_delete(tx, entry_id, token)? {
        Ok(())
    } else {
        Err(StoreError::Unauthorized)
    }
}
