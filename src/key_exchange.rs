//! # Diffie-Hellman Key Exchange
//!
//! Finite-field exchange over a random modulus. The requester samples
//! `g`, `p` and a private exponent, and sends
//!
//! ```text
//! u32_le(len g) || u32_le(len p) || u32_le(len A) || g || p || A
//! ```
//!
//! with each integer as a big-endian magnitude. The responder replies with
//! the raw bytes of `B`. Both sides fold the shared secret into a 32-byte
//! AES key with [`fold_key`].
//!
//! ## Security Considerations
//!
//! Neither `p` nor `g` is validated (no safe-prime or subgroup checks), and
//! the parameters come from a fast non-cryptographic RNG. The exchange is
//! unauthenticated. This reproduces the protocol's wire behavior and is
//! not a hardened key agreement.

use bytes::{BufMut, BytesMut};
use num_bigint::{BigUint, RandBigInt};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use zeroize::Zeroize;

use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::{take_exact, take_u32_le};
use crate::KEY_SIZE;

/// Default modulus size in bytes
pub const DEFAULT_BYTE_SIZE: usize = 64;

/// Smallest modulus size accepted by [`DiffieHellman::new`]
pub const MIN_BYTE_SIZE: usize = 4;

/// One side of a key exchange
pub struct DiffieHellman {
    byte_size: usize,
    rng: SmallRng,
    p: Option<BigUint>,
    g: Option<BigUint>,
    exponent: u32,
    secret: Option<Vec<u8>>,
}

impl DiffieHellman {
    /// Create an exchange whose modulus has `byte_size` bytes
    pub fn new(byte_size: usize) -> Self {
        Self {
            byte_size: byte_size.max(MIN_BYTE_SIZE),
            rng: SmallRng::from_entropy(),
            p: None,
            g: None,
            exponent: 0,
            secret: None,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Private exponent drawn from the upper quarter of `[0, bits)`
    fn sample_exponent(&mut self) -> u32 {
        let bits = (self.byte_size * 8) as u32;
        self.rng.gen_range(bits / 4 * 3..bits)
    }

    fn sample_modulus(&mut self) -> BigUint {
        let bits = (self.byte_size * 8) as u64;
        // Top bit set so the secret keeps the full modulus width
        self.rng.gen_biguint(bits) | (BigUint::from(1u8) << (bits - 1))
    }

    /// Start an exchange; the returned bytes go to the peer
    pub fn generate_request(&mut self) -> Vec<u8> {
        self.secret = None;
        self.exponent = self.sample_exponent();

        let p = self.sample_modulus();
        let g = self.rng.gen_biguint((self.byte_size * 64) as u64);
        let a = g.modpow(&BigUint::from(self.exponent), &p);

        let g_bytes = g.to_bytes_be();
        let p_bytes = p.to_bytes_be();
        let a_bytes = a.to_bytes_be();

        let mut out = BytesMut::with_capacity(12 + g_bytes.len() + p_bytes.len() + a_bytes.len());
        out.put_u32_le(g_bytes.len() as u32);
        out.put_u32_le(p_bytes.len() as u32);
        out.put_u32_le(a_bytes.len() as u32);
        out.put_slice(&g_bytes);
        out.put_slice(&p_bytes);
        out.put_slice(&a_bytes);

        self.p = Some(p);
        self.g = Some(g);
        out.to_vec()
    }

    /// Answer a peer's request; derives the shared secret immediately
    pub fn generate_response(&mut self, request: &[u8]) -> ProtocolResult<Vec<u8>> {
        let mut cursor = request;
        let g_len = take_u32_le(&mut cursor)? as usize;
        let p_len = take_u32_le(&mut cursor)? as usize;
        let a_len = take_u32_le(&mut cursor)? as usize;

        let g = BigUint::from_bytes_be(take_exact(&mut cursor, g_len)?);
        let p = BigUint::from_bytes_be(take_exact(&mut cursor, p_len)?);
        let peer_public = BigUint::from_bytes_be(take_exact(&mut cursor, a_len)?);

        if p <= BigUint::from(1u8) {
            return Err(ProtocolError::KeyExchangeError(
                "Modulus must be greater than one".to_string(),
            ));
        }

        self.exponent = self.sample_exponent();
        let exponent = BigUint::from(self.exponent);

        let b = g.modpow(&exponent, &p);
        let shared = peer_public.modpow(&exponent, &p);
        self.secret = Some(shared.to_bytes_be());

        Ok(b.to_bytes_be())
    }

    /// Complete an exchange this side started
    ///
    /// `p` and `g` are released afterwards; a new exchange needs a new
    /// request.
    pub fn handle_response(&mut self, response: &[u8]) -> ProtocolResult<()> {
        let p = self.p.take().ok_or_else(|| {
            ProtocolError::KeyExchangeError("No request outstanding".to_string())
        })?;
        self.g = None;

        if response.is_empty() {
            return Err(ProtocolError::KeyExchangeError("Empty response".to_string()));
        }

        let peer_public = BigUint::from_bytes_be(response);
        let shared = peer_public.modpow(&BigUint::from(self.exponent), &p);
        self.secret = Some(shared.to_bytes_be());
        Ok(())
    }

    /// Raw shared secret, if an exchange has completed
    pub fn secret(&self) -> Option<&[u8]> {
        self.secret.as_deref()
    }

    /// The 32-byte key, or `None` if the secret is too short to use
    pub fn derived_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.secret.as_deref().and_then(fold_key)
    }

    pub fn has_outstanding_request(&self) -> bool {
        self.p.is_some()
    }
}

impl Default for DiffieHellman {
    fn default() -> Self {
        Self::new(DEFAULT_BYTE_SIZE)
    }
}

impl Drop for DiffieHellman {
    fn drop(&mut self) {
        if let Some(secret) = self.secret.as_mut() {
            secret.zeroize();
        }
        self.exponent.zeroize();
    }
}

/// Fold a shared secret into an AES-256 key
///
/// The first 32 bytes are the base; every later byte `i` is XORed into
/// position `(i - 32) % 32`. Secrets under 32 bytes are unusable.
pub fn fold_key(secret: &[u8]) -> Option<[u8; KEY_SIZE]> {
    if secret.len() < KEY_SIZE {
        return None;
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&secret[..KEY_SIZE]);
    for (i, byte) in secret[KEY_SIZE..].iter().enumerate() {
        key[i % KEY_SIZE] ^= byte;
    }
    Some(key)
}
