//! Protocol identifier newtypes.
//!
//! All identifiers travel as lowercase hex on the wire. Each newtype
//! carries its exact byte length as a wire-format invariant.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

macro_rules! hex_id {
    ($(#[$doc:meta])* $name:ident, $len:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Byte length of this identifier
            pub const SIZE: usize = $len;

            /// Generate a fresh random identifier
            #[must_use]
            pub fn random() -> Self {
                let mut bytes = [0u8; $len];
                getrandom::getrandom(&mut bytes).expect("CSPRNG failure");
                Self(bytes)
            }

            /// Construct from raw bytes
            #[must_use]
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Parse from a lowercase hex string (no `0x` prefix).
            ///
            /// # Errors
            ///
            /// Returns `None` if the string is not exactly the right
            /// length or not valid hex.
            #[must_use]
            pub fn from_hex(s: &str) -> Option<Self> {
                let decoded = hex::decode(s).ok()?;
                let bytes: [u8; $len] = decoded.try_into().ok()?;
                Some(Self(bytes))
            }

            /// Get the raw bytes
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Hex-encode (lowercase, no prefix)
            #[must_use]
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).ok_or_else(|| {
                    D::Error::custom(concat!("invalid ", stringify!($name), " hex"))
                })
            }
        }
    };
}

hex_id!(
    /// Connection identifier (16 bytes), allocated by the inviter
    ConnectionId,
    16
);

hex_id!(
    /// Envelope identifier (16 bytes), one per reliable send
    EnvelopeId,
    16
);

hex_id!(
    /// Session identifier (16 bytes), allocated by the originator
    SessionId,
    16
);

hex_id!(
    /// Message identifier (16 bytes), fresh per typed message
    MessageId,
    16
);

hex_id!(
    /// Pub/sub topic (4 bytes), one inbound topic per connection side
    Topic,
    4
);

hex_id!(
    /// VASP identity code (6 bytes)
    VaspCode,
    6
);
