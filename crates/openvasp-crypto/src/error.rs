//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Ciphertext blob shorter than nonce + tag
    #[error("ciphertext too short: expected at least {expected}, got {actual}")]
    CiphertextTooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Invalid key material (corrupted or wrong format)
    #[error("invalid key material")]
    InvalidKeyMaterial,

    /// Invalid public key encoding (not a curve point)
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Key agreement produced a degenerate secret
    #[error("key agreement failed")]
    KeyAgreementFailed,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Invalid signature encoding or length
    #[error("invalid signature")]
    InvalidSignature,

    /// Signature did not verify against the payload
    #[error("signature verification failed")]
    VerificationFailed,

    /// Invalid input length
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },
}
