//! Envelope-encrypted, consumption-limited secret storage.

pub mod backend;
pub mod crypto;
pub mod db;
pub mod entries;
pub mod entry_keys;
pub mod error;
pub mod manager;
pub mod memory;
pub mod model;
pub mod wrap;

pub use backend::{Backend, ReadTx, Storage, WriteTx};
pub use db::RedbStorage;
pub use error::{Error, StoreError};
pub use manager::{CreatedSecret, Limits, Manager, MintedKey, NewSecret, RevealedSecret, SweepReport};
pub use memory::MemoryStorage;
pub use model::{EntryKeyMeta, EntryMeta};
