//! Transport trait abstraction over the pub/sub messaging layer.
//!
//! The protocol core is transport-agnostic: any topic-based
//! store-and-forward network with publish/subscribe/fetch semantics and
//! arbitrary latency or loss can carry OpenVASP frames. The transport
//! performs envelope-level encryption itself (Whisper-style), so
//! `publish` receives the key and mode alongside the frame.
//!
//! [`MemoryTransport`] is an in-process implementation used as a test
//! double and loopback; it is not a production binding.

use crate::types::{Topic, VaspCode};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Subscription filter has expired and must be re-created
    #[error("subscription filter expired")]
    FilterExpired,

    /// Unknown filter handle
    #[error("unknown filter handle")]
    UnknownFilter,

    /// Transport is closed
    #[error("transport is closed")]
    Closed,

    /// Transport-specific error
    #[error("transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// How the transport should encrypt a published frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Asymmetric envelope encryption under the receiver's public key
    Asymmetric,
    /// Symmetric envelope encryption under a negotiated key
    Symmetric,
}

/// Key material handed to the transport for envelope encryption (hex)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKey(pub String);

/// Subscription criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterCriteria {
    /// Frames published to one 4-byte topic
    Topic(Topic),
    /// Frames addressed to a VASP identity (its derived identity topic)
    Identity(VaspCode),
}

/// Opaque handle to an active subscription filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterHandle(pub u64);

/// Hash of a published message, as reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHash(pub String);

/// One frame returned by a fetch
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    /// The `0x`-prefixed hex frame
    pub payload: String,
    /// The sender's public key as reported by the transport, if any
    pub sender_key: Option<String>,
}

/// The topic a VASP's connection invitations arrive on.
///
/// Derived deterministically from the identity code (first four bytes)
/// so that any peer can address an invite without prior contact.
#[must_use]
pub fn identity_topic(code: &VaspCode) -> Topic {
    let bytes = code.as_bytes();
    Topic::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Async pub/sub transport for OpenVASP frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a frame to a topic.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the publish fails.
    async fn publish(
        &self,
        topic: Topic,
        key: &EncryptionKey,
        mode: EncryptionMode,
        payload: &str,
    ) -> TransportResult<MessageHash>;

    /// Create a subscription filter.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the subscription fails.
    async fn subscribe(&self, criteria: FilterCriteria) -> TransportResult<FilterHandle>;

    /// Fetch frames accumulated on a filter since the last fetch.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::FilterExpired`] when the filter has
    /// lapsed and must be re-created; the caller is expected to
    /// resubscribe transparently.
    async fn fetch(&self, handle: FilterHandle) -> TransportResult<Vec<ReceivedFrame>>;
}

struct StoredFrame {
    payload: String,
}

struct FilterState {
    topic: Topic,
    cursor: usize,
    expired: bool,
}

/// Shared in-process message hub connecting [`MemoryTransport`] endpoints.
#[derive(Default)]
pub struct MemoryHub {
    topics: DashMap<Topic, Vec<StoredFrame>>,
}

impl MemoryHub {
    /// Create a new empty hub
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// In-process store-and-forward transport over a shared [`MemoryHub`].
///
/// Frames are kept per topic; each filter tracks its own read cursor,
/// so every subscriber on a topic sees every frame exactly once.
/// Envelope-level encryption is a pass-through: the in-process hub is
/// trusted, and end-to-end payload encryption happens above it.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    filters: DashMap<u64, FilterState>,
    next_handle: AtomicU64,
}

impl MemoryTransport {
    /// Create a transport endpoint attached to a hub
    #[must_use]
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self {
            hub,
            filters: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Force a filter to report expiry on its next fetch (test hook
    /// for the transparent-resubscribe path).
    pub fn expire_filter(&self, handle: FilterHandle) {
        if let Some(mut state) = self.filters.get_mut(&handle.0) {
            state.expired = true;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        topic: Topic,
        _key: &EncryptionKey,
        _mode: EncryptionMode,
        payload: &str,
    ) -> TransportResult<MessageHash> {
        self.hub.topics.entry(topic).or_default().push(StoredFrame {
            payload: payload.to_owned(),
        });
        // Content hash stand-in: topic + per-topic offset
        let offset = self.hub.topics.get(&topic).map_or(0, |v| v.len());
        Ok(MessageHash(format!("{topic}:{offset}")))
    }

    async fn subscribe(&self, criteria: FilterCriteria) -> TransportResult<FilterHandle> {
        let topic = match criteria {
            FilterCriteria::Topic(topic) => topic,
            FilterCriteria::Identity(code) => identity_topic(&code),
        };
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.filters.insert(
            id,
            FilterState {
                topic,
                cursor: 0,
                expired: false,
            },
        );
        Ok(FilterHandle(id))
    }

    async fn fetch(&self, handle: FilterHandle) -> TransportResult<Vec<ReceivedFrame>> {
        let mut state = self
            .filters
            .get_mut(&handle.0)
            .ok_or(TransportError::UnknownFilter)?;

        if state.expired {
            drop(state);
            self.filters.remove(&handle.0);
            return Err(TransportError::FilterExpired);
        }

        let Some(log) = self.hub.topics.get(&state.topic) else {
            return Ok(Vec::new());
        };

        let frames: Vec<ReceivedFrame> = log[state.cursor..]
            .iter()
            .map(|stored| ReceivedFrame {
                payload: stored.payload.clone(),
                sender_key: None,
            })
            .collect();
        state.cursor = log.len();
        Ok(frames)
    }
}
