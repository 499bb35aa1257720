//! OpenVASP inter-VASP messaging protocol core.
//!
//! Implements the transport-agnostic protocol machinery for the
//! "Travel Rule" message exchange between Virtual Asset Service
//! Providers: the binary envelope codec, reliable at-least-once
//! delivery, connection handshake and lifecycle, typed message
//! formatting with sign-then-encrypt, per-session dispatch, and the
//! originator/beneficiary session state machines.
//!
//! The crate talks to the outside world through two async traits:
//! [`transport::Transport`] (a topic-based pub/sub network) and
//! [`registry::KeyRegistry`] (counterparty public key lookup). An
//! in-process [`transport::MemoryTransport`] is included as a test
//! double and loopback.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod payload;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

/// Protocol version byte carried in every frame
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Compressed secp256k1 ephemeral key size in frames
pub const EPHEMERAL_KEY_SIZE: usize = 33;

pub use config::{MessageTimeouts, ProtocolConfig, TimeoutPolicy};
pub use connection::{ConnectionManager, ConnectionStatus, InboundMessage};
pub use delivery::{DeliveryFailure, ReliableDelivery};
pub use error::{ConnectionError, Error, FrameError, MessageError, SessionError};
pub use message::{MessageType, ProtocolMessage};
pub use payload::{Instruction, MessageBody, Payload};
pub use session::{
    AbortReason, BeneficiarySession, OriginatorSession, Role, SessionEvent, SessionState,
};
pub use types::{ConnectionId, EnvelopeId, MessageId, SessionId, Topic, VaspCode};
