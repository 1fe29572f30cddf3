//! DEK wrapping under single-use KEKs.
//!
//! A KEK never touches storage: it is handed to the writer once and comes back
//! only as the key half of a reader's access token.

use zeroize::Zeroizing;

use super::crypto::{self, CryptoError, SecretKey};

/// Wrap `dek` under a freshly generated KEK. Returns `(wrapped_dek, kek)`.
pub fn wrap(dek: &SecretKey) -> Result<(Vec<u8>, SecretKey), CryptoError> {
    let kek = crypto::generate_key();
    let wrapped = crypto::encrypt(kek.as_bytes(), dek.as_bytes())?;
    Ok((wrapped, kek))
}

/// Recover a DEK with a caller-supplied KEK.
///
/// A wrong KEK surfaces as [`CryptoError::AuthenticationFailed`], exactly like
/// a tampered blob.
pub fn unwrap(kek: &SecretKey, wrapped: &[u8]) -> Result<SecretKey, CryptoError> {
    let raw = Zeroizing::new(crypto::decrypt(kek.as_bytes(), wrapped)?);
    SecretKey::from_slice(&raw).map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_then_unwrap() {
        let dek = crypto::generate_key();
        let (wrapped, kek) = wrap(&dek).unwrap();
        assert_ne!(wrapped.as_slice(), dek.as_bytes());
        let back = unwrap(&kek, &wrapped).unwrap();
        assert_eq!(back.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn every_wrap_gets_its_own_kek() {
        let dek = crypto::generate_key();
        let (w1, k1) = wrap(&dek).unwrap();
        let (w2, k2) = wrap(&dek).unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
        assert_eq!(unwrap(&k1, &w1).unwrap().as_bytes(), dek.as_bytes());
        assert_eq!(unwrap(&k2, &w2).unwrap().as_bytes(), dek.as_bytes());
        assert!(unwrap(&k1, &w2).is_err());
    }

    #[test]
    fn unrelated_kek_fails_authentication() {
        let dek = crypto::generate_key();
        let (wrapped, _kek) = wrap(&dek).unwrap();
        let stranger = crypto::generate_key();
        assert_eq!(
            unwrap(&stranger, &wrapped).unwrap_err(),
            CryptoError::AuthenticationFailed
        );
    }

    #[test]
    fn wrapped_payload_of_wrong_size_is_rejected() {
        let kek = crypto::generate_key();
        let not_a_key = crypto::encrypt(kek.as_bytes(), b"too short").unwrap();
        assert_eq!(
            unwrap(&kek, &not_a_key).unwrap_err(),
            CryptoError::AuthenticationFailed
        );
    }
}
