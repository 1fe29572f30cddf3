use thiserror::Error;

use super::crypto::CryptoError;

/// Store-layer failures. Keeps "row missing", "row present but logically gone"
/// and "transaction failed" apart so the manager can decide what to do.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    /// Row still on disk but past its deadline or out of reads.
    #[error("record expired or exhausted")]
    Expired,
    /// Delete token did not match.
    #[error("unauthorized")]
    Unauthorized,
    /// The entry already holds as many key rows as the limits allow.
    #[error("key limit reached")]
    KeyLimit,
    #[error("create failed: {0}")]
    CreateFailed(String),
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("record codec: {0}")]
    Codec(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors returned by [`Manager`](super::Manager) operations.
///
/// Missing, expired and exhausted secrets all surface as [`Error::NotFound`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The presented key does not unwrap any key of this entry.
    #[error("invalid key")]
    InvalidKey,
    #[error("not found or expired")]
    NotFound,
    /// Delete token mismatch.
    #[error("unauthorized")]
    Unauthorized,
    #[error("create failed: {0}")]
    CreateFailed(String),
    /// No more keys can be minted for this entry.
    #[error("key limit reached")]
    KeyLimitReached,
    /// Transaction or backend failure; the caller may retry.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// Key string is not 32 bytes of hex.
    #[error("malformed key material")]
    KeyInvalid,
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound | StoreError::Expired => Error::NotFound,
            StoreError::Unauthorized => Error::Unauthorized,
            StoreError::KeyLimit => Error::KeyLimitReached,
            StoreError::CreateFailed(msg) => Error::CreateFailed(msg),
            StoreError::Backend(msg) | StoreError::Codec(msg) => Error::StorageUnavailable(msg),
            StoreError::Crypto(CryptoError::KeyInvalid) => Error::KeyInvalid,
            StoreError::Crypto(CryptoError::AuthenticationFailed) => Error::InvalidKey,
            StoreError::Crypto(CryptoError::SealFailed) => {
                Error::CreateFailed("payload could not be sealed".into())
            }
        }
    }
}
