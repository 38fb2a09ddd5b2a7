//! # Symmetric Encryption
//!
//! AES-256-CBC with PKCS#7 padding. Every call to [`SymmetricKey::encrypt`]
//! draws a fresh IV, carried in front of the ciphertext:
//!
//! ```text
//! u32_le(16) || IV || u32_le(len) || ciphertext
//! ```
//!
//! CBC carries no authentication tag. A tampered ciphertext either fails
//! padding checks or decrypts to garbage that the envelope layer rejects.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytes::BytesMut;
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::{put_prefixed, take_prefixed};
use crate::{IV_SIZE, KEY_SIZE};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// A 256-bit session key
///
/// Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    key: [u8; KEY_SIZE],
}

impl SymmetricKey {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Build a key from a slice that must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> ProtocolResult<Self> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            ProtocolError::CryptoError(format!(
                "Key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self { key })
    }

    /// Fresh random key (tests and the unencrypted debug path)
    pub fn generate() -> Self {
        Self::new(random_bytes::<KEY_SIZE>())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Encrypt under a fresh random IV
    ///
    /// Empty plaintext yields an empty payload.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        if plaintext.is_empty() {
            return Vec::new();
        }
        let iv = random_bytes::<IV_SIZE>();
        self.encrypt_with_iv(plaintext, &iv)
    }

    fn encrypt_with_iv(&self, plaintext: &[u8], iv: &[u8; IV_SIZE]) -> Vec<u8> {
        let ciphertext = Aes256CbcEnc::new(&self.key.into(), iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = BytesMut::with_capacity(8 + IV_SIZE + ciphertext.len());
        put_prefixed(&mut out, iv);
        put_prefixed(&mut out, &ciphertext);
        out.to_vec()
    }

    /// Decrypt a payload produced by [`SymmetricKey::encrypt`]
    pub fn decrypt(&self, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }

        let mut cursor = payload;
        let iv = take_prefixed(&mut cursor)?;
        let ciphertext = take_prefixed(&mut cursor)?;

        let iv: [u8; IV_SIZE] = iv.try_into().map_err(|_| {
            ProtocolError::CryptoError(format!("IV must be {} bytes, got {}", IV_SIZE, iv.len()))
        })?;

        Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| ProtocolError::CryptoError(format!("Decryption failed: {}", e)))
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_decryption() {
        let key = SymmetricKey::generate();
        let plaintext = b"Hello, secure world!";

        let payload = key.encrypt(plaintext);
        assert_eq!(&payload[..4], &(IV_SIZE as u32).to_le_bytes());

        let decrypted = key.decrypt(&payload).unwrap();
        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_fresh_iv_per_message() {
        let key = SymmetricKey::generate();
        let a = key.encrypt(b"same input");
        let b = key.encrypt(b"same input");
        assert_ne!(a, b);
    }

    #[test]
    fn test_block_aligned_plaintext_gets_full_pad_block() {
        let key = SymmetricKey::generate();
        let payload = key.encrypt(&[7u8; 32]);
        // prefix + iv + prefix + 48 bytes of ciphertext
        assert_eq!(payload.len(), 4 + IV_SIZE + 4 + 48);
    }

    #[test]
    fn test_empty_passthrough() {
        let key = SymmetricKey::generate();
        assert!(key.encrypt(b"").is_empty());
        assert!(key.decrypt(b"").unwrap().is_empty());
    }

    #[test]
    fn test_wrong_key_fails_or_differs() {
        let key = SymmetricKey::generate();
        let other = SymmetricKey::generate();
        let payload = key.encrypt(b"secret message for one key only");

        match other.decrypt(&payload) {
            Err(ProtocolError::CryptoError(_)) => {}
            Ok(garbage) => assert_ne!(garbage, b"secret message for one key only"),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let key = SymmetricKey::generate();
        let payload = key.encrypt(b"data");
        assert!(key.decrypt(&payload[..10]).is_err());
    }

    #[test]
    fn test_from_slice_length_checked() {
        assert!(SymmetricKey::from_slice(&[0u8; 31]).is_err());
        let key = SymmetricKey::from_slice(&[9u8; 32]).unwrap();
        assert_eq!(key.as_bytes(), &[9u8; 32]);
    }
}
