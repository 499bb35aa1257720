//! Typed message dispatch.
//!
//! A [`MessageRouter`] maps message types to ordered handler lists,
//! built once through [`RouterBuilder`] and immutable afterwards. A
//! [`SessionWorker`] is the per-session FIFO task: inbound messages are
//! processed strictly in arrival order, and every handler of message N
//! completes before message N+1 is dequeued. Handler failures are
//! logged and never block the remaining handlers.

use crate::message::{MessageType, ProtocolMessage};
use crate::types::SessionId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Error type handlers may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by a handler invocation
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// A registered message handler
pub type Handler = Arc<dyn Fn(ProtocolMessage) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(ProtocolMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Accumulates handler registrations before freezing them into a
/// [`MessageRouter`].
#[derive(Default)]
pub struct RouterBuilder {
    handlers: HashMap<MessageType, Vec<Handler>>,
    fallback: Vec<Handler>,
}

impl RouterBuilder {
    /// Start an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one message type.
    ///
    /// Handlers for the same type run in registration order.
    #[must_use]
    pub fn on(mut self, message_type: MessageType, handler: Handler) -> Self {
        self.handlers.entry(message_type).or_default().push(handler);
        self
    }

    /// Register a fallback handler for types with no registration.
    #[must_use]
    pub fn fallback(mut self, handler: Handler) -> Self {
        self.fallback.push(handler);
        self
    }

    /// Freeze the registrations
    #[must_use]
    pub fn build(self) -> MessageRouter {
        MessageRouter {
            handlers: self.handlers,
            fallback: self.fallback,
        }
    }
}

/// Immutable type-to-handlers routing table.
pub struct MessageRouter {
    handlers: HashMap<MessageType, Vec<Handler>>,
    fallback: Vec<Handler>,
}

impl MessageRouter {
    /// Invoke every handler registered for the message's type, in
    /// registration order. A failing handler is logged and the rest
    /// still run. Types with no registration fall through to the
    /// fallback handlers.
    pub async fn dispatch(&self, message: &ProtocolMessage) {
        let message_type = message.header.message_type;
        let chain = match self.handlers.get(&message_type) {
            Some(chain) if !chain.is_empty() => chain,
            _ => &self.fallback,
        };
        if chain.is_empty() {
            debug!(?message_type, "no handler registered, message ignored");
            return;
        }

        for handler in chain {
            if let Err(error) = handler(message.clone()).await {
                warn!(?message_type, %error, "message handler failed");
            }
        }
    }
}

/// Per-session FIFO dispatch task.
///
/// Exactly one worker exists per session; it consumes decrypted
/// inbound messages in arrival order and awaits the full handler chain
/// of each message before dequeuing the next.
pub struct SessionWorker {
    queue: mpsc::UnboundedSender<ProtocolMessage>,
    task: JoinHandle<()>,
}

impl SessionWorker {
    /// Spawn the worker task for one session.
    #[must_use]
    pub fn spawn(session_id: SessionId, router: Arc<MessageRouter>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<ProtocolMessage>();
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                router.dispatch(&message).await;
            }
            debug!(%session_id, "session worker drained");
        });
        Self { queue, task }
    }

    /// Enqueue a message for in-order processing.
    ///
    /// Returns `false` if the worker has already been shut down.
    pub fn enqueue(&self, message: ProtocolMessage) -> bool {
        self.queue.send(message).is_ok()
    }

    /// Stop accepting new messages and wait for the queue to drain.
    ///
    /// In-flight handler invocations run to completion.
    pub async fn shutdown(self) {
        drop(self.queue);
        let _ = self.task.await;
    }
}
