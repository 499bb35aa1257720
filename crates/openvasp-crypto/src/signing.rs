//! ECDSA/secp256k1 detached payload signatures.
//!
//! Message envelopes carry a detached signature over their canonical
//! encoding, produced with the sender's long-lived secp256k1 signing
//! key and verified against the counterpart's registry entry.
//! Signatures are deterministic (RFC 6979) over SHA-256.

use crate::CryptoError;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::{CryptoRng, RngCore};

/// Detached signature (64 bytes, fixed-size r ‖ s)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; 64]);

/// secp256k1 ECDSA signing key
pub struct SigningKey {
    inner: k256::ecdsa::SigningKey,
}

/// secp256k1 ECDSA verifying key (public)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyingKey {
    inner: k256::ecdsa::VerifyingKey,
}

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not
    /// exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != 64 {
            return Err(CryptoError::InvalidSignature);
        }
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get the raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl SigningKey {
    /// Generate a new random signing key
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            inner: k256::ecdsa::SigningKey::random(rng),
        }
    }

    /// Import a signing key from a raw private scalar.
    ///
    /// Deterministic: the same scalar always yields the same key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the scalar is zero
    /// or not reduced modulo the curve order.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        k256::ecdsa::SigningKey::from_slice(bytes)
            .map(|inner| Self { inner })
            .map_err(|_| CryptoError::InvalidKeyMaterial)
    }

    /// Sign a payload.
    ///
    /// Deterministic: the same payload and key always produce the same
    /// signature.
    #[must_use]
    pub fn sign(&self, payload: &[u8]) -> Signature {
        let sig: k256::ecdsa::Signature = self.inner.sign(payload);
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&sig.to_bytes());
        Signature(bytes)
    }

    /// Get the corresponding verifying key
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: *self.inner.verifying_key(),
        }
    }
}

impl VerifyingKey {
    /// Import a verifying key from a SEC1 encoding (compressed or not).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a
    /// valid curve point.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        k256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
            .map(|inner| Self { inner })
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Export as compressed SEC1 (33 bytes)
    #[must_use]
    pub fn to_compressed(&self) -> [u8; 33] {
        let point = self.inner.to_encoded_point(true);
        let mut bytes = [0u8; 33];
        bytes.copy_from_slice(point.as_bytes());
        bytes
    }

    /// Verify a detached signature over a payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::VerificationFailed`] if the signature does
    /// not match the payload under this key.
    pub fn verify(&self, payload: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let sig = k256::ecdsa::Signature::from_slice(&signature.0)
            .map_err(|_| CryptoError::InvalidSignature)?;
        self.inner
            .verify(payload, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}
