//! Curve25519 Diffie-Hellman key agreement (RFC 7748).
//!
//! The second curve family supported by the protocol, used for pure key
//! agreement where blockchain-address compatibility is not required.
//! Never mixed with secp256k1 key material.

use crate::CryptoError;
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 public key (32 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

/// X25519 key pair
#[derive(Clone)]
pub struct KeyPair {
    secret: x25519_dalek::StaticSecret,
    public: PublicKey,
}

/// X25519 shared secret (32 bytes)
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl KeyPair {
    /// Generate a new random key pair with RFC 7748 clamping
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rng);
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Import a key pair from a raw scalar.
    ///
    /// Deterministic: the same scalar always yields the same key pair
    /// (the scalar is clamped per RFC 7748).
    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = x25519_dalek::StaticSecret::from(bytes);
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Get the public half of the key pair
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Export the raw private scalar.
    ///
    /// # Security
    ///
    /// The returned bytes contain the raw private key. Handle with care.
    #[must_use]
    pub fn to_secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Perform Diffie-Hellman key agreement with a peer's public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyAgreementFailed`] if the peer's public
    /// key is a low-order point.
    pub fn diffie_hellman(&self, peer: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.secret.diffie_hellman(&peer.0);

        // All-zero output means the peer key was a low-order point
        if shared.as_bytes() == &[0u8; 32] {
            return Err(CryptoError::KeyAgreementFailed);
        }

        Ok(SharedSecret(*shared.as_bytes()))
    }
}

impl PublicKey {
    /// Import a public key from bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Export the public key bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }
}

impl SharedSecret {
    /// Get the shared secret bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_ecdh_symmetry() {
        let alice = KeyPair::generate(&mut OsRng);
        let bob = KeyPair::generate(&mut OsRng);

        let ab = alice.diffie_hellman(&bob.public_key()).unwrap();
        let ba = bob.diffie_hellman(&alice.public_key()).unwrap();

        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_deterministic_import() {
        let original = KeyPair::generate(&mut OsRng);
        let restored = KeyPair::from_secret_bytes(original.to_secret_bytes());

        assert_eq!(
            original.public_key().to_bytes(),
            restored.public_key().to_bytes()
        );
    }

    #[test]
    fn test_low_order_point_rejected() {
        let pair = KeyPair::generate(&mut OsRng);
        let zero = PublicKey::from_bytes([0u8; 32]);

        assert!(pair.diffie_hellman(&zero).is_err());
    }

    // RFC 7748 section 6.1 test vector
    #[test]
    fn test_rfc7748_vector() {
        let alice_secret = [
            0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2,
            0x66, 0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5,
            0x1d, 0xb9, 0x2c, 0x2a,
        ];
        let bob_public = [
            0xde, 0x9e, 0xdb, 0x7d, 0x7b, 0x7d, 0xc1, 0xb4, 0xd3, 0x5b, 0x61, 0xc2, 0xec, 0xe4,
            0x35, 0x37, 0x3f, 0x83, 0x43, 0xc8, 0x5b, 0x78, 0x67, 0x4d, 0xad, 0xfc, 0x7e, 0x14,
            0x6f, 0x88, 0x2b, 0x4f,
        ];
        let expected = [
            0x4a, 0x5d, 0x9d, 0x5b, 0xa4, 0xce, 0x2d, 0xe1, 0x72, 0x8e, 0x3b, 0xf4, 0x80, 0x35,
            0x0f, 0x25, 0xe0, 0x7e, 0x21, 0xc9, 0x47, 0xd1, 0x9e, 0x33, 0x76, 0xf0, 0x9b, 0x3c,
            0x1e, 0x16, 0x17, 0x42,
        ];

        let alice = KeyPair::from_secret_bytes(alice_secret);
        let shared = alice
            .diffie_hellman(&PublicKey::from_bytes(bob_public))
            .unwrap();

        assert_eq!(shared.as_bytes(), &expected);
    }
}
