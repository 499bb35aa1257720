//! Envelope frame encoding and decoding for the OpenVASP wire protocol.
//!
//! Frames are lowercase hex strings with a `0x` prefix. Byte layout
//! (hex chars after the prefix):
//!
//! ```text
//! version(2) | instr+flags(2) | senderId(12) | connectionId(32) |
//! envelopeId(32) | [ackTarget(32) | returnTopic(8) | ecdhPubKey(66)] |
//! body(variable)
//! ```
//!
//! Field presence is determined purely by the instruction: Ack carries
//! the ack-target id only; Deny carries neither return topic nor key;
//! Invite/Accept carry return topic and ephemeral key; Update/Close
//! carry return topic only. Byte lengths are a wire-format invariant -
//! a mis-length frame is a framing error, never a soft condition.

use crate::error::FrameError;
use crate::types::{ConnectionId, EnvelopeId, Topic, VaspCode};
use crate::{EPHEMERAL_KEY_SIZE, PROTOCOL_VERSION};

/// Connection-control instructions (3-bit wire codes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Instruction {
    /// Open a connection (carries the inviter's ephemeral key)
    Invite = 0x00,
    /// Accept an invite (carries the acceptor's ephemeral key)
    Accept = 0x01,
    /// Refuse an invite (fire-and-forget)
    Deny = 0x02,
    /// Application traffic on an established connection
    Update = 0x03,
    /// Close a connection
    Close = 0x04,
    /// Acknowledge a previously received envelope
    Ack = 0x05,
}

impl TryFrom<u8> for Instruction {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Invite),
            0x01 => Ok(Self::Accept),
            0x02 => Ok(Self::Deny),
            0x03 => Ok(Self::Update),
            0x04 => Ok(Self::Close),
            0x05 => Ok(Self::Ack),
            _ => Err(FrameError::InvalidInstruction(value)),
        }
    }
}

impl Instruction {
    /// Whether frames with this instruction carry an ack-target id
    #[must_use]
    pub fn carries_ack_target(self) -> bool {
        self == Self::Ack
    }

    /// Whether frames with this instruction carry a return topic
    #[must_use]
    pub fn carries_return_topic(self) -> bool {
        !matches!(self, Self::Deny | Self::Ack)
    }

    /// Whether frames with this instruction carry an ephemeral key
    #[must_use]
    pub fn carries_ephemeral_key(self) -> bool {
        matches!(self, Self::Invite | Self::Accept)
    }
}

/// Opaque message body trailing the fixed fields.
///
/// A tail that is valid UTF-8 and parses as JSON decodes as [`Json`];
/// anything else decodes as [`Raw`]. This sniffing is a documented
/// simplification of the wire format.
///
/// [`Json`]: MessageBody::Json
/// [`Raw`]: MessageBody::Raw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// UTF-8 JSON text
    Json(String),
    /// Raw bytes (surfaced as hex)
    Raw(Vec<u8>),
}

impl MessageBody {
    /// Empty body
    #[must_use]
    pub fn empty() -> Self {
        Self::Raw(Vec::new())
    }

    /// Classify raw tail bytes as JSON or raw
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        if let Ok(text) = std::str::from_utf8(&bytes) {
            if serde_json::from_str::<serde_json::Value>(text).is_ok() {
                return Self::Json(text.to_owned());
            }
        }
        Self::Raw(bytes)
    }

    /// Get the body as bytes for framing
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Json(text) => text.as_bytes(),
            Self::Raw(bytes) => bytes,
        }
    }

    /// Whether the body is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// One transport-level instruction envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Protocol version byte
    pub version: u8,
    /// Connection-control instruction
    pub instruction: Instruction,
    /// 5-bit flags field
    pub flags: u8,
    /// Sender identity code
    pub sender: VaspCode,
    /// Connection this frame belongs to
    pub connection_id: ConnectionId,
    /// Fresh id for this envelope
    pub envelope_id: EnvelopeId,
    /// Envelope being acknowledged (ack frames only)
    pub ack_target: Option<EnvelopeId>,
    /// Topic the sender listens on (all but deny/ack)
    pub return_topic: Option<Topic>,
    /// Compressed secp256k1 ephemeral key (invite/accept only)
    pub ephemeral_key: Option<[u8; EPHEMERAL_KEY_SIZE]>,
    /// Opaque encrypted message blob
    pub body: MessageBody,
}

impl Payload {
    /// Create a payload with a fresh envelope id and no optional fields
    #[must_use]
    pub fn new(instruction: Instruction, sender: VaspCode, connection_id: ConnectionId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            instruction,
            flags: 0,
            sender,
            connection_id,
            envelope_id: EnvelopeId::random(),
            ack_target: None,
            return_topic: None,
            ephemeral_key: None,
            body: MessageBody::empty(),
        }
    }

    /// Encode the frame to its `0x`-prefixed hex form.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::MissingField`] / [`FrameError::UnexpectedField`]
    /// when the optional fields do not match the instruction, and
    /// [`FrameError::InvalidFlags`] when flags exceed 5 bits.
    pub fn encode(&self) -> Result<String, FrameError> {
        if self.flags > 0x1f {
            return Err(FrameError::InvalidFlags(self.flags));
        }
        self.check_field_presence()?;

        let mut buf = Vec::with_capacity(
            1 + 1
                + VaspCode::SIZE
                + ConnectionId::SIZE
                + EnvelopeId::SIZE
                + EnvelopeId::SIZE
                + Topic::SIZE
                + EPHEMERAL_KEY_SIZE
                + self.body.as_bytes().len(),
        );

        buf.push(self.version);
        buf.push((self.flags << 3) | self.instruction as u8);
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(self.connection_id.as_bytes());
        buf.extend_from_slice(self.envelope_id.as_bytes());

        if let Some(target) = &self.ack_target {
            buf.extend_from_slice(target.as_bytes());
        }
        if let Some(topic) = &self.return_topic {
            buf.extend_from_slice(topic.as_bytes());
        }
        if let Some(key) = &self.ephemeral_key {
            buf.extend_from_slice(key);
        }
        buf.extend_from_slice(self.body.as_bytes());

        Ok(format!("0x{}", hex::encode(buf)))
    }

    /// Decode a `0x`-prefixed hex frame.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] for a missing prefix, non-hex content,
    /// an unknown instruction, or any mis-length field.
    pub fn decode(frame: &str) -> Result<Self, FrameError> {
        let hex_part = frame.strip_prefix("0x").ok_or(FrameError::InvalidPrefix)?;
        let bytes = hex::decode(hex_part).map_err(|_| FrameError::InvalidHex)?;

        let mut cursor = Cursor::new(&bytes);

        let version = cursor.take_byte()?;
        let packed = cursor.take_byte()?;
        let instruction = Instruction::try_from(packed & 0x07)?;
        let flags = packed >> 3;

        let sender = VaspCode::from_bytes(cursor.take_array::<{ VaspCode::SIZE }>()?);
        let connection_id =
            ConnectionId::from_bytes(cursor.take_array::<{ ConnectionId::SIZE }>()?);
        let envelope_id = EnvelopeId::from_bytes(cursor.take_array::<{ EnvelopeId::SIZE }>()?);

        let ack_target = if instruction.carries_ack_target() {
            Some(EnvelopeId::from_bytes(
                cursor.take_array::<{ EnvelopeId::SIZE }>()?,
            ))
        } else {
            None
        };

        let return_topic = if instruction.carries_return_topic() {
            Some(Topic::from_bytes(cursor.take_array::<{ Topic::SIZE }>()?))
        } else {
            None
        };

        let ephemeral_key = if instruction.carries_ephemeral_key() {
            Some(cursor.take_array::<EPHEMERAL_KEY_SIZE>()?)
        } else {
            None
        };

        let body = MessageBody::from_bytes(cursor.take_rest().to_vec());

        Ok(Self {
            version,
            instruction,
            flags,
            sender,
            connection_id,
            envelope_id,
            ack_target,
            return_topic,
            ephemeral_key,
            body,
        })
    }

    fn check_field_presence(&self) -> Result<(), FrameError> {
        let instr = self.instruction;

        match (instr.carries_ack_target(), self.ack_target.is_some()) {
            (true, false) => return Err(FrameError::MissingField("ack_target")),
            (false, true) => return Err(FrameError::UnexpectedField("ack_target")),
            _ => {}
        }
        match (instr.carries_return_topic(), self.return_topic.is_some()) {
            (true, false) => return Err(FrameError::MissingField("return_topic")),
            (false, true) => return Err(FrameError::UnexpectedField("return_topic")),
            _ => {}
        }
        match (instr.carries_ephemeral_key(), self.ephemeral_key.is_some()) {
            (true, false) => return Err(FrameError::MissingField("ephemeral_key")),
            (false, true) => return Err(FrameError::UnexpectedField("ephemeral_key")),
            _ => {}
        }
        Ok(())
    }
}

/// Byte cursor with exact-length error reporting
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take_byte(&mut self) -> Result<u8, FrameError> {
        let arr = self.take_array::<1>()?;
        Ok(arr[0])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        if self.pos + N > self.bytes.len() {
            return Err(FrameError::TooShort {
                expected: self.pos + N,
                actual: self.bytes.len(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(instruction: Instruction) -> Payload {
        let mut payload = Payload::new(
            instruction,
            VaspCode::from_bytes([0x11; 6]),
            ConnectionId::random(),
        );
        if instruction.carries_ack_target() {
            payload.ack_target = Some(EnvelopeId::random());
        }
        if instruction.carries_return_topic() {
            payload.return_topic = Some(Topic::random());
        }
        if instruction.carries_ephemeral_key() {
            payload.ephemeral_key = Some([0x02; EPHEMERAL_KEY_SIZE]);
        }
        payload
    }

    #[test]
    fn test_roundtrip_every_instruction() {
        for instruction in [
            Instruction::Invite,
            Instruction::Accept,
            Instruction::Deny,
            Instruction::Update,
            Instruction::Close,
            Instruction::Ack,
        ] {
            let mut payload = base(instruction);
            payload.body = MessageBody::Json("{\"msg\":\"hello\"}".to_owned());

            let encoded = payload.encode().unwrap();
            assert!(encoded.starts_with("0x"));
            let decoded = Payload::decode(&encoded).unwrap();
            assert_eq!(decoded, payload, "{instruction:?}");
        }
    }

    #[test]
    fn test_roundtrip_raw_body() {
        let mut payload = base(Instruction::Update);
        // 0xff is not valid UTF-8, so the body stays raw
        payload.body = MessageBody::Raw(vec![0xff, 0x00, 0xab]);

        let decoded = Payload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded.body, MessageBody::Raw(vec![0xff, 0x00, 0xab]));
    }

    #[test]
    fn test_missing_prefix_rejected() {
        assert_eq!(Payload::decode("0100"), Err(FrameError::InvalidPrefix));
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert_eq!(Payload::decode("0xzz"), Err(FrameError::InvalidHex));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let encoded = base(Instruction::Invite).encode().unwrap();
        // Drop the last 4 hex chars of the ephemeral key field
        let truncated = &encoded[..encoded.len() - 4];
        assert!(matches!(
            Payload::decode(truncated),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn test_unknown_instruction_rejected() {
        let mut payload = base(Instruction::Deny);
        payload.flags = 0;
        let encoded = payload.encode().unwrap();

        // Patch the instruction bits to the reserved code 0x07
        let mut bytes = hex::decode(&encoded[2..]).unwrap();
        bytes[1] = (bytes[1] & 0xf8) | 0x07;
        let patched = format!("0x{}", hex::encode(bytes));

        assert_eq!(
            Payload::decode(&patched),
            Err(FrameError::InvalidInstruction(0x07))
        );
    }

    #[test]
    fn test_field_presence_enforced() {
        // Ack without its target
        let mut payload = base(Instruction::Ack);
        payload.ack_target = None;
        assert_eq!(
            payload.encode(),
            Err(FrameError::MissingField("ack_target"))
        );

        // Deny with a topic it must not carry
        let mut payload = base(Instruction::Deny);
        payload.return_topic = Some(Topic::random());
        assert_eq!(
            payload.encode(),
            Err(FrameError::UnexpectedField("return_topic"))
        );

        // Update with an ephemeral key it must not carry
        let mut payload = base(Instruction::Update);
        payload.ephemeral_key = Some([0x03; EPHEMERAL_KEY_SIZE]);
        assert_eq!(
            payload.encode(),
            Err(FrameError::UnexpectedField("ephemeral_key"))
        );
    }

    #[test]
    fn test_flags_range_enforced() {
        let mut payload = base(Instruction::Update);
        payload.flags = 0x20;
        assert_eq!(payload.encode(), Err(FrameError::InvalidFlags(0x20)));

        payload.flags = 0x1f;
        let decoded = Payload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded.flags, 0x1f);
    }

    #[test]
    fn test_wire_layout_offsets() {
        let payload = base(Instruction::Invite);
        let encoded = payload.encode().unwrap();
        let hex_part = &encoded[2..];

        // version(2) | instr+flags(2) | sender(12) | connection(32) |
        // envelope(32) | topic(8) | key(66)
        assert_eq!(&hex_part[0..2], "01");
        assert_eq!(&hex_part[4..16], "111111111111");
        assert_eq!(
            &hex_part[16..48],
            payload.connection_id.to_hex().as_str()
        );
        assert_eq!(&hex_part[48..80], payload.envelope_id.to_hex().as_str());
        assert_eq!(
            &hex_part[80..88],
            payload.return_topic.unwrap().to_hex().as_str()
        );
        assert_eq!(hex_part.len(), 88 + 66);
    }
}
