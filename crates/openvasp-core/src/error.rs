//! Error types for the OpenVASP protocol core.

use crate::types::{ConnectionId, SessionId, VaspCode};
use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Frame parsing or construction error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Connection-level error
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Session-level error
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Typed-message formatting error
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] openvasp_crypto::CryptoError),
}

/// Frame-level errors (wire codec)
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Frame lacks the mandatory `0x` prefix
    #[error("missing 0x prefix")]
    InvalidPrefix,

    /// Frame is not valid hex
    #[error("invalid hex encoding")]
    InvalidHex,

    /// Frame too short for a required field
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Unknown instruction code
    #[error("invalid instruction: 0x{0:02x}")]
    InvalidInstruction(u8),

    /// Flags exceed the 5-bit field
    #[error("flags exceed 5 bits: 0x{0:02x}")]
    InvalidFlags(u8),

    /// A field required by the instruction is absent
    #[error("missing field for instruction: {0}")]
    MissingField(&'static str),

    /// A field not allowed for the instruction is present
    #[error("unexpected field for instruction: {0}")]
    UnexpectedField(&'static str),
}

/// Connection-level errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Unknown connection id
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Connection is passive (logically closed)
    #[error("connection is passive: {0}")]
    ConnectionPassive(ConnectionId),

    /// Registry has no key of the required kind for the counterpart
    #[error("missing registry key '{kind}' for {code}")]
    MissingRegistryKey {
        /// Key kind (transport, signing, message)
        kind: &'static str,
        /// Counterpart identity code
        code: VaspCode,
    },

    /// No symmetric key negotiated yet for a symmetric send
    #[error("no symmetric key negotiated for connection {0}")]
    NoSymmetricKey(ConnectionId),

    /// No counterpart ephemeral key known yet for an asymmetric send
    #[error("no counterpart ephemeral key for connection {0}")]
    NoCounterpartKey(ConnectionId),
}

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Unknown session id
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// Session already aborted
    #[error("session aborted: {0}")]
    Aborted(SessionId),

    /// Timer fired in a state with no defined retry behavior
    #[error("unexpected timeout in state {state:?} for session {session}")]
    UnexpectedTimeout {
        /// Session id
        session: SessionId,
        /// State at the time of expiry
        state: crate::session::SessionState,
    },
}

/// Typed-message formatting errors
#[derive(Debug, Error)]
pub enum MessageError {
    /// Payload is not valid hex
    #[error("invalid hex encoding")]
    InvalidHex,

    /// Decrypted payload is not a valid message envelope
    #[error("malformed message envelope: {0}")]
    Malformed(String),

    /// Unknown message type code
    #[error("unknown message type code: {0}")]
    UnknownType(String),

    /// Detached signature did not verify
    #[error("signature verification failed")]
    SignatureInvalid,

    /// Decryption failed (wrong key or tampered ciphertext)
    #[error("decryption failed")]
    DecryptionFailed(#[source] openvasp_crypto::CryptoError),
}
