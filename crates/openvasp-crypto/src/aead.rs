//! AES-256-GCM authenticated encryption.
//!
//! The symmetric cipher for all encrypted message payloads:
//! - 256-bit keys (ECDH shared secrets used directly)
//! - 96-bit random nonce per call, prepended to the ciphertext
//! - 128-bit authentication tag
//!
//! Decryption fails closed: a wrong key or a tampered bit yields
//! [`CryptoError::DecryptionFailed`], never partial plaintext.

use crate::CryptoError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AEAD key size in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// Nonce size in bytes (96-bit GCM nonce)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// AES-256-GCM key, zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Generate a new random key
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a key from raw bytes (e.g. an ECDH shared secret)
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidLength`] if the slice is not
    /// exactly [`KEY_SIZE`] bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get the raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encrypt a plaintext, returning `nonce ‖ ciphertext ‖ tag`.
    ///
    /// A fresh random nonce is drawn for every call.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`]'s counterpart only on
    /// internal cipher failure, which cannot occur for valid keys.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::InvalidLength {
            expected: KEY_SIZE,
            actual: self.0.len(),
        })?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes).map_err(|_| CryptoError::RandomFailed)?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a `nonce ‖ ciphertext ‖ tag` blob.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CiphertextTooShort`] if the blob cannot
    /// even hold a nonce and tag, and [`CryptoError::DecryptionFailed`]
    /// on any authentication failure.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::CiphertextTooShort {
                expected: NONCE_SIZE + TAG_SIZE,
                actual: blob.len(),
            });
        }

        let cipher = Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::InvalidLength {
            expected: KEY_SIZE,
            actual: self.0.len(),
        })?;

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
