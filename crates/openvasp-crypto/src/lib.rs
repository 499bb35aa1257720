//! # OpenVASP Crypto
//!
//! Cryptographic primitives for the OpenVASP messaging protocol.
//!
//! This crate provides:
//! - secp256k1 key pairs, ECDH, and the compressed-point codec
//! - Curve25519 (X25519) key pairs and ECDH
//! - AES-256-GCM authenticated encryption
//! - ECDSA detached payload signatures
//!
//! The two curve families are supported independently and are never
//! mixed: secp256k1 carries blockchain-address-compatible identities
//! and the connection handshake, X25519 is available for pure key
//! agreement.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod error;
pub mod secp256k1;
pub mod signing;
pub mod x25519;

pub use aead::{AeadKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::CryptoError;
pub use signing::{Signature, SigningKey, VerifyingKey};
