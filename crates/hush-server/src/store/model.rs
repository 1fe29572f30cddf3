use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use super::crypto::Digest32;

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Stored in the `entries` table as bincode-encoded bytes.
/// `ciphertext` is AES-256-GCM under the entry's DEK (`nonce || ct || tag`).
/// Counters and timestamps are plaintext so the sweep can evict without any key.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct EntryRecord {
    pub id: String,
    pub ciphertext: Vec<u8>,
    pub content_type: String,
    /// Unix timestamp (seconds) when the entry was created.
    pub created_at: i64,
    /// Unix timestamp of the last consuming read.
    pub accessed_at: Option<i64>,
    /// Unix timestamp at and after which the entry is expired.
    pub expires_at: i64,
    pub remaining_reads: i64,
    /// SHA-256 of the delete token. The token itself is never stored.
    pub delete_token_hash: Digest32,
}

impl EntryRecord {
    /// True while reads remain and the deadline has not passed.
    pub fn is_active(&self, now: i64) -> bool {
        self.remaining_reads > 0 && now < self.expires_at
    }

    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            id: self.id.clone(),
            content_type: self.content_type.clone(),
            created_at: self.created_at,
            accessed_at: self.accessed_at,
            expires_at: self.expires_at,
            remaining_reads: self.remaining_reads.max(0),
        }
    }
}

/// One wrapped copy of an entry's DEK, stored in the `entry_keys` table.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct EntryKeyRecord {
    pub id: String,
    pub entry_id: String,
    /// The entry's DEK sealed under this key's KEK.
    pub wrapped_dek: Vec<u8>,
    /// SHA-256 of the unwrapped DEK.
    pub dek_hash: Digest32,
    pub created_at: i64,
    /// Own deadline; `None` defers to the parent entry.
    pub expires_at: Option<i64>,
    /// Own read budget; `None` defers to the parent entry.
    pub remaining_reads: Option<i64>,
}

impl EntryKeyRecord {
    /// True while this key's own bounds allow a read. The parent entry is
    /// checked separately.
    pub fn is_usable(&self, now: i64) -> bool {
        if let Some(exp) = self.expires_at {
            if now >= exp {
                return false;
            }
        }
        if let Some(remaining) = self.remaining_reads {
            if remaining <= 0 {
                return false;
            }
        }
        true
    }

    pub fn meta(&self) -> EntryKeyMeta {
        EntryKeyMeta {
            id: self.id.clone(),
            entry_id: self.entry_id.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            remaining_reads: self.remaining_reads.map(|r| r.max(0)),
        }
    }
}

/// Entry metadata returned to callers. Never includes the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub id: String,
    pub content_type: String,
    pub created_at: i64,
    pub accessed_at: Option<i64>,
    pub expires_at: i64,
    pub remaining_reads: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryKeyMeta {
    pub id: String,
    pub entry_id: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub remaining_reads: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(remaining_reads: i64, expires_at: i64) -> EntryRecord {
        EntryRecord {
            id: "e".into(),
            ciphertext: vec![1, 2, 3],
            content_type: "text/plain".into(),
            created_at: 0,
            accessed_at: None,
            expires_at,
            remaining_reads,
            delete_token_hash: [0u8; 32],
        }
    }

    fn key(remaining_reads: Option<i64>, expires_at: Option<i64>) -> EntryKeyRecord {
        EntryKeyRecord {
            id: "k".into(),
            entry_id: "e".into(),
            wrapped_dek: vec![],
            dek_hash: [0u8; 32],
            created_at: 0,
            expires_at,
            remaining_reads,
        }
    }

    #[test]
    fn entry_activity() {
        assert!(entry(1, 100).is_active(99));
        assert!(!entry(1, 100).is_active(100));
        assert!(!entry(0, 100).is_active(0));
        assert!(!entry(-1, 100).is_active(0));
    }

    #[test]
    fn unbounded_key_is_usable() {
        assert!(key(None, None).is_usable(i64::MAX));
    }

    #[test]
    fn bounded_key_usability() {
        assert!(key(Some(1), Some(10)).is_usable(9));
        assert!(!key(Some(1), Some(10)).is_usable(10));
        assert!(!key(Some(0), None).is_usable(0));
    }

    #[test]
    fn meta_never_reports_negative_reads() {
        assert_eq!(entry(-3, 10).meta().remaining_reads, 0);
        assert_eq!(key(Some(-1), None).meta().remaining_reads, Some(0));
    }
}
