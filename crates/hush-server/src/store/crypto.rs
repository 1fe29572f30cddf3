use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use constant_time_eq::constant_time_eq;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AES-GCM tag length in bytes.
pub const TAG_LEN: usize = 16;
/// SHA-256 digest length in bytes.
pub const DIGEST_LEN: usize = 32;

pub type Digest32 = [u8; DIGEST_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("key material has the wrong length")]
    KeyInvalid,
    /// Wrong key, tampered ciphertext and truncated input all land here.
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("encryption failed")]
    SealFailed,
}

/// 32 bytes of raw key material (a DEK or a KEK). Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::KeyInvalid)?;
        Ok(Self(arr))
    }

    /// Parse the lowercase-hex form handed out to readers.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        if s.len() != KEY_LEN * 2 {
            return Err(CryptoError::KeyInvalid);
        }
        let mut arr = [0u8; KEY_LEN];
        hex::decode_to_slice(s, &mut arr).map_err(|_| CryptoError::KeyInvalid)?;
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Generate a fresh random 256-bit key.
pub fn generate_key() -> SecretKey {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    let key = SecretKey(bytes);
    bytes.zeroize();
    key
}

/// Generate a random bearer token (64 hex chars). Used for delete tokens.
pub fn generate_token() -> String {
    let mut bytes = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut bytes[..]);
    hex::encode(&bytes[..])
}

/// Seal `plaintext` under `key`. Returns `nonce || ciphertext || tag`.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyInvalid)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::SealFailed)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a blob produced by [`encrypt`].
pub fn decrypt(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyInvalid)?;
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }
    let (nonce, body) = sealed.split_at(NONCE_LEN);

    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// SHA-256 of `data`. Only ever compared with [`digest_eq`].
pub fn hash(data: &[u8]) -> Digest32 {
    Sha256::digest(data).into()
}

pub fn digest_eq(a: &Digest32, b: &Digest32) -> bool {
    constant_time_eq(a, b)
}
