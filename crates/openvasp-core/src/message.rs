//! Typed protocol messages and their sealed wire form.
//!
//! A typed message is a header (ids, routing, type code, optional
//! ephemeral key) plus an opaque JSON body. Before transport it is
//! signed over its canonical encoding with the sender's long-lived
//! signing key, then AES-GCM-encrypted under the session's active
//! symmetric key. The canonical encoding is compact JSON in struct
//! declaration order; verification re-derives it from the parsed
//! message, so it is insensitive to whitespace or key order in
//! transit.

use crate::error::MessageError;
use crate::types::{MessageId, SessionId, VaspCode};
use openvasp_crypto::{AeadKey, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Application message types with their wire short codes.
///
/// Codes are a closed bidirectional table; wire position never depends
/// on enum ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Session handshake request ("110")
    SessionRequest,
    /// Session handshake reply ("150")
    SessionReply,
    /// Transfer request ("210")
    TransferRequest,
    /// Transfer reply ("250")
    TransferReply,
    /// Transfer dispatch notification ("310")
    TransferDispatch,
    /// Transfer confirmation ("350")
    TransferConfirmation,
    /// Session termination ("910")
    Termination,
}

impl MessageType {
    /// All message types, in protocol order
    pub const ALL: [Self; 7] = [
        Self::SessionRequest,
        Self::SessionReply,
        Self::TransferRequest,
        Self::TransferReply,
        Self::TransferDispatch,
        Self::TransferConfirmation,
        Self::Termination,
    ];

    /// The wire short code
    #[must_use]
    pub fn wire_code(self) -> &'static str {
        match self {
            Self::SessionRequest => "110",
            Self::SessionReply => "150",
            Self::TransferRequest => "210",
            Self::TransferReply => "250",
            Self::TransferDispatch => "310",
            Self::TransferConfirmation => "350",
            Self::Termination => "910",
        }
    }

    /// Parse a wire short code
    #[must_use]
    pub fn from_wire_code(code: &str) -> Option<Self> {
        match code {
            "110" => Some(Self::SessionRequest),
            "150" => Some(Self::SessionReply),
            "210" => Some(Self::TransferRequest),
            "250" => Some(Self::TransferReply),
            "310" => Some(Self::TransferDispatch),
            "350" => Some(Self::TransferConfirmation),
            "910" => Some(Self::Termination),
            _ => None,
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.wire_code())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Self::from_wire_code(&code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown message type code: {code}")))
    }
}

/// Header attached to every typed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Fresh id for this message
    pub message_id: MessageId,
    /// Session the message belongs to
    pub session_id: SessionId,
    /// Message type short code
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Sender identity
    pub sender: VaspCode,
    /// Receiver identity
    pub receiver: VaspCode,
    /// Compressed ephemeral public key hex (session handshake only)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ephemeral_key: Option<String>,
}

/// One typed message: header plus opaque JSON body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Message header
    pub header: MessageHeader,
    /// Opaque body (schemas are out of scope)
    pub body: serde_json::Value,
}

impl ProtocolMessage {
    /// Build a message with a fresh message id
    #[must_use]
    pub fn new(
        session_id: SessionId,
        message_type: MessageType,
        sender: VaspCode,
        receiver: VaspCode,
        body: serde_json::Value,
    ) -> Self {
        Self {
            header: MessageHeader {
                message_id: MessageId::random(),
                session_id,
                message_type,
                sender,
                receiver,
                ephemeral_key: None,
            },
            body,
        }
    }

    /// Canonical signing bytes: compact JSON, sorted object keys
    fn canonical_bytes(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::Malformed(e.to_string()))
    }
}

/// Signed wire envelope prior to encryption
#[derive(Serialize, Deserialize)]
struct SignedEnvelope {
    #[serde(flatten)]
    message: ProtocolMessage,
    signature: String,
}

/// Result of sealing one typed message for transport
#[derive(Debug, Clone)]
pub struct SealedMessage {
    /// Encrypted wire form, lowercase hex
    pub wire_hex: String,
    /// The signed plaintext JSON (for audit logging)
    pub plaintext_json: String,
}

/// Sign and encrypt a typed message for transport.
///
/// # Errors
///
/// Returns [`MessageError`] if serialization or encryption fails.
pub fn seal(
    message: &ProtocolMessage,
    signing_key: &SigningKey,
    key: &AeadKey,
) -> Result<SealedMessage, MessageError> {
    let canonical = message.canonical_bytes()?;
    let signature = signing_key.sign(&canonical);

    let envelope = SignedEnvelope {
        message: message.clone(),
        signature: hex::encode(signature.as_bytes()),
    };
    let plaintext =
        serde_json::to_string(&envelope).map_err(|e| MessageError::Malformed(e.to_string()))?;

    let ciphertext = key
        .encrypt(plaintext.as_bytes())
        .map_err(MessageError::DecryptionFailed)?;

    Ok(SealedMessage {
        wire_hex: hex::encode(ciphertext),
        plaintext_json: plaintext,
    })
}

/// Decrypt and verify an inbound typed message.
///
/// Verification failure is a hard rejection: a message whose detached
/// signature does not match the counterpart's known signing key is
/// never surfaced.
///
/// # Errors
///
/// Returns [`MessageError::InvalidHex`] for malformed hex,
/// [`MessageError::DecryptionFailed`] on any AEAD failure,
/// [`MessageError::Malformed`] for a non-envelope plaintext, and
/// [`MessageError::SignatureInvalid`] when verification fails.
pub fn open(
    wire_hex: &str,
    key: &AeadKey,
    counterpart: &VerifyingKey,
) -> Result<ProtocolMessage, MessageError> {
    let blob = hex::decode(wire_hex).map_err(|_| MessageError::InvalidHex)?;
    let plaintext = key.decrypt(&blob).map_err(MessageError::DecryptionFailed)?;

    let envelope: SignedEnvelope =
        serde_json::from_slice(&plaintext).map_err(|e| MessageError::Malformed(e.to_string()))?;

    let signature_bytes =
        hex::decode(&envelope.signature).map_err(|_| MessageError::SignatureInvalid)?;
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| MessageError::SignatureInvalid)?;

    let canonical = envelope.message.canonical_bytes()?;
    counterpart
        .verify(&canonical, &signature)
        .map_err(|_| MessageError::SignatureInvalid)?;

    Ok(envelope.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use serde_json::json;

    fn sample() -> ProtocolMessage {
        ProtocolMessage::new(
            SessionId::random(),
            MessageType::TransferRequest,
            VaspCode::from_bytes([1; 6]),
            VaspCode::from_bytes([2; 6]),
            json!({"amount": "10.5", "asset": "ETH"}),
        )
    }

    #[test]
    fn test_wire_code_table_bijective() {
        for message_type in MessageType::ALL {
            assert_eq!(
                MessageType::from_wire_code(message_type.wire_code()),
                Some(message_type)
            );
        }
        assert_eq!(MessageType::from_wire_code("999"), None);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let signing = SigningKey::generate(&mut OsRng);
        let key = AeadKey::generate(&mut OsRng);
        let message = sample();

        let sealed = seal(&message, &signing, &key).unwrap();
        let opened = open(&sealed.wire_hex, &key, &signing.verifying_key()).unwrap();

        assert_eq!(opened, message);
    }

    #[test]
    fn test_wrong_aead_key_rejected() {
        let signing = SigningKey::generate(&mut OsRng);
        let key = AeadKey::generate(&mut OsRng);
        let other = AeadKey::generate(&mut OsRng);

        let sealed = seal(&sample(), &signing, &key).unwrap();
        assert!(matches!(
            open(&sealed.wire_hex, &other, &signing.verifying_key()),
            Err(MessageError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let signing = SigningKey::generate(&mut OsRng);
        let impostor = SigningKey::generate(&mut OsRng);
        let key = AeadKey::generate(&mut OsRng);

        let sealed = seal(&sample(), &signing, &key).unwrap();
        assert!(matches!(
            open(&sealed.wire_hex, &key, &impostor.verifying_key()),
            Err(MessageError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let signing = SigningKey::generate(&mut OsRng);
        let key = AeadKey::generate(&mut OsRng);
        let message = sample();

        // Re-encrypt a forged plaintext under the right key but with
        // the original (now stale) signature
        let sealed = seal(&message, &signing, &key).unwrap();
        let mut envelope: serde_json::Value =
            serde_json::from_str(&sealed.plaintext_json).unwrap();
        envelope["body"]["amount"] = serde_json::json!("999999");
        let forged = key
            .encrypt(serde_json::to_string(&envelope).unwrap().as_bytes())
            .unwrap();

        assert!(matches!(
            open(&hex::encode(forged), &key, &signing.verifying_key()),
            Err(MessageError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_whitespace_insensitive_verification() {
        let signing = SigningKey::generate(&mut OsRng);
        let key = AeadKey::generate(&mut OsRng);
        let message = sample();

        let sealed = seal(&message, &signing, &key).unwrap();

        // Re-serialize the same envelope with extra whitespace; the
        // canonical encoding still verifies
        let envelope: serde_json::Value = serde_json::from_str(&sealed.plaintext_json).unwrap();
        let pretty = serde_json::to_string_pretty(&envelope).unwrap();
        let reencrypted = key.encrypt(pretty.as_bytes()).unwrap();

        let opened = open(&hex::encode(reencrypted), &key, &signing.verifying_key()).unwrap();
        assert_eq!(opened, message);
    }

    #[test]
    fn test_ephemeral_key_optional_in_header() {
        let mut message = sample();
        message.header.ephemeral_key = Some("02ab".into());

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["header"]["ephemeral_key"], "02ab");

        let plain = sample();
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json["header"].get("ephemeral_key").is_none());
    }
}
