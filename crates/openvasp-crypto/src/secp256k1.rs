//! secp256k1 key pairs and ECDH key agreement.
//!
//! OpenVASP identities are blockchain-address-compatible, so connection
//! handshake keys and signing keys live on secp256k1. Peer public keys
//! are published compressed (33 bytes, SEC1); envelope framing and ECDH
//! need the full point, so this module also exposes the
//! compressed/uncompressed codec. Decompression recomputes the
//! y-coordinate from the curve equation and selects the root matching
//! the parity bit of the compressed encoding.

use crate::CryptoError;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::{CryptoRng, RngCore};

/// Compressed SEC1 public key length
pub const COMPRESSED_KEY_SIZE: usize = 33;

/// Uncompressed SEC1 public key length (0x04 || x || y)
pub const UNCOMPRESSED_KEY_SIZE: usize = 65;

/// secp256k1 public key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(k256::PublicKey);

/// secp256k1 key pair (private scalar + public point)
///
/// Immutable once generated or imported. The private scalar is zeroized
/// on drop by the underlying `k256::SecretKey`.
#[derive(Clone)]
pub struct KeyPair {
    secret: k256::SecretKey,
    public: PublicKey,
}

/// secp256k1 ECDH shared secret (32 bytes, the x-coordinate)
pub struct SharedSecret([u8; 32]);

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = k256::SecretKey::random(rng);
        let public = PublicKey(secret.public_key());
        Self { secret, public }
    }

    /// Import a key pair from a raw private scalar.
    ///
    /// Deterministic: the same scalar always yields the same key pair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the scalar is zero
    /// or not reduced modulo the curve order.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret =
            k256::SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidKeyMaterial)?;
        let public = PublicKey(secret.public_key());
        Ok(Self { secret, public })
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
        self.secret.to_bytes().into()
    }

    /// Perform Diffie-Hellman key agreement with a peer's public key.
    ///
    /// Both parties derive the same 32-byte secret:
    /// `a.diffie_hellman(B) == b.diffie_hellman(A)`.
    #[must_use]
    pub fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        let shared =
            k256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.0.as_affine());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(shared.raw_secret_bytes());
        SharedSecret(bytes)
    }
}

impl PublicKey {
    /// Parse a compressed SEC1 encoding (33 bytes, `0x02`/`0x03` prefix).
    ///
    /// The y-coordinate is recomputed from the curve equation; the square
    /// root whose parity matches the prefix bit is selected.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a
    /// valid compressed point on the curve.
    pub fn from_compressed(bytes: &[u8; COMPRESSED_KEY_SIZE]) -> Result<Self, CryptoError> {
        k256::PublicKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Parse an uncompressed SEC1 encoding (65 bytes, `0x04` prefix).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a
    /// valid point on the curve.
    pub fn from_uncompressed(bytes: &[u8; UNCOMPRESSED_KEY_SIZE]) -> Result<Self, CryptoError> {
        k256::PublicKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Parse either SEC1 encoding from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] for any encoding that is
    /// not a valid curve point.
    pub fn from_sec1_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        k256::PublicKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Export as compressed SEC1 (33 bytes)
    #[must_use]
    pub fn to_compressed(&self) -> [u8; COMPRESSED_KEY_SIZE] {
        let point = self.0.to_encoded_point(true);
        let mut bytes = [0u8; COMPRESSED_KEY_SIZE];
        bytes.copy_from_slice(point.as_bytes());
        bytes
    }

    /// Export as uncompressed SEC1 (65 bytes)
    #[must_use]
    pub fn to_uncompressed(&self) -> [u8; UNCOMPRESSED_KEY_SIZE] {
        let point = self.0.to_encoded_point(false);
        let mut bytes = [0u8; UNCOMPRESSED_KEY_SIZE];
        bytes.copy_from_slice(point.as_bytes());
        bytes
    }
}

impl SharedSecret {
    /// Get the shared secret bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl zeroize::Zeroize for SharedSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(self);
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

        let ab = alice.diffie_hellman(&bob.public_key());
        let ba = bob.diffie_hellman(&alice.public_key());

        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_deterministic_import() {
        let original = KeyPair::generate(&mut OsRng);
        let scalar = original.to_secret_bytes();

        let restored = KeyPair::from_secret_bytes(&scalar).unwrap();
        assert_eq!(
            original.public_key().to_compressed(),
            restored.public_key().to_compressed()
        );
    }

    #[test]
    fn test_zero_scalar_rejected() {
        assert!(KeyPair::from_secret_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_compression_roundtrip() {
        let pair = KeyPair::generate(&mut OsRng);
        let public = pair.public_key();

        let compressed = public.to_compressed();
        let restored = PublicKey::from_compressed(&compressed).unwrap();
        assert_eq!(restored, public);
        assert_eq!(restored.to_uncompressed(), public.to_uncompressed());
    }

    // Known interoperability vector: the secp256k1 generator point.
    // compressed G -> uncompressed G must reproduce the standard
    // coordinates exactly (parity-selected root).
    #[test]
    fn test_decompression_vector_generator() {
        let compressed = hex::decode(
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        )
        .unwrap();
        let expected_uncompressed = hex::decode(
            "0479be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798\
             483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8",
        )
        .unwrap();

        let mut bytes = [0u8; COMPRESSED_KEY_SIZE];
        bytes.copy_from_slice(&compressed);
        let key = PublicKey::from_compressed(&bytes).unwrap();

        assert_eq!(key.to_uncompressed().as_slice(), &expected_uncompressed[..]);
    }

    // Odd-y parity vector: 6G has an odd y-coordinate (0x03 prefix).
    #[test]
    fn test_decompression_vector_odd_parity() {
        let compressed = hex::decode(
            "03fff97bd5755eeea420453a14355235d382f6472f8568a18b2f057a1460297556",
        )
        .unwrap();
        let expected_y =
            hex::decode("ae12777aacfbb620f3be96017f45c560de80f0f6518fe4a03c870c36b075f297")
                .unwrap();

        let mut bytes = [0u8; COMPRESSED_KEY_SIZE];
        bytes.copy_from_slice(&compressed);
        let key = PublicKey::from_compressed(&bytes).unwrap();

        assert_eq!(&key.to_uncompressed()[33..], &expected_y[..]);
    }

    #[test]
    fn test_invalid_point_rejected() {
        // x = 0 is not on the curve for either parity
        let mut bad = [0u8; COMPRESSED_KEY_SIZE];
        bad[0] = 0x02;
        assert!(PublicKey::from_compressed(&bad).is_err());
    }
}
