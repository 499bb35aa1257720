//! Reliable at-least-once envelope delivery.
//!
//! Every tracked envelope is republished at a fixed interval until an
//! acknowledgement removes it from the pending table or the resend
//! ceiling is hit. One ceiling breach emits exactly one
//! [`DeliveryFailure`] for the owning connection; acknowledgements that
//! arrive late (after removal, or never tracked) are silently ignored.

use crate::config::ProtocolConfig;
use crate::transport::{EncryptionKey, EncryptionMode, Transport};
use crate::types::{ConnectionId, EnvelopeId, Topic};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where (and how) a tracked envelope is published
#[derive(Debug, Clone)]
pub struct EnvelopeTarget {
    /// Destination topic
    pub topic: Topic,
    /// Envelope encryption key handed to the transport
    pub key: EncryptionKey,
    /// Envelope encryption mode
    pub mode: EncryptionMode,
}

/// One envelope awaiting acknowledgement
#[derive(Debug, Clone)]
struct PendingEnvelope {
    connection_id: ConnectionId,
    target: EnvelopeTarget,
    frame: String,
}

/// Emitted when an envelope exhausts its resend budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Connection the failed envelope belonged to
    pub connection_id: ConnectionId,
    /// The envelope that was never acknowledged
    pub envelope_id: EnvelopeId,
}

/// At-least-once delivery tracker over a [`Transport`].
///
/// Cloneable handle; all clones share one pending table.
pub struct ReliableDelivery<T: Transport + 'static> {
    transport: Arc<T>,
    pending: Arc<DashMap<EnvelopeId, PendingEnvelope>>,
    retry_tasks: Arc<DashMap<EnvelopeId, JoinHandle<()>>>,
    config: ProtocolConfig,
    failures: mpsc::UnboundedSender<DeliveryFailure>,
}

impl<T: Transport + 'static> Clone for ReliableDelivery<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            pending: self.pending.clone(),
            retry_tasks: self.retry_tasks.clone(),
            config: self.config.clone(),
            failures: self.failures.clone(),
        }
    }
}

impl<T: Transport + 'static> ReliableDelivery<T> {
    /// Create a delivery tracker and its failure event stream
    #[must_use]
    pub fn new(
        transport: Arc<T>,
        config: ProtocolConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DeliveryFailure>) {
        let (failures, failure_rx) = mpsc::unbounded_channel();
        (
            Self {
                transport,
                pending: Arc::new(DashMap::new()),
                retry_tasks: Arc::new(DashMap::new()),
                config,
                failures,
            },
            failure_rx,
        )
    }

    /// Publish an envelope and track it until acknowledged.
    ///
    /// Spawns a retry task that republishes the frame every
    /// `envelope_expiry` until [`Self::acknowledge_received`] (or
    /// [`Self::remove_queued`]) clears it, or the resend ceiling fires
    /// a [`DeliveryFailure`].
    ///
    /// # Errors
    ///
    /// Returns the transport error if the initial publish fails; the
    /// envelope is not tracked in that case.
    pub async fn send_tracked(
        &self,
        envelope_id: EnvelopeId,
        connection_id: ConnectionId,
        target: EnvelopeTarget,
        frame: String,
    ) -> crate::transport::TransportResult<()> {
        self.transport
            .publish(target.topic, &target.key, target.mode, &frame)
            .await?;

        self.pending.insert(
            envelope_id,
            PendingEnvelope {
                connection_id,
                target,
                frame,
            },
        );

        let this = self.clone();
        let task = tokio::spawn(async move {
            this.retry_loop(envelope_id).await;
        });
        if self.pending.contains_key(&envelope_id) {
            self.retry_tasks.insert(envelope_id, task);
        } else {
            // Acknowledged before the task was registered
            task.abort();
        }
        Ok(())
    }

    /// Publish a fire-and-forget envelope (acks, denials).
    ///
    /// # Errors
    ///
    /// Returns the transport error if the publish fails.
    pub async fn send_untracked(
        &self,
        target: &EnvelopeTarget,
        frame: &str,
    ) -> crate::transport::TransportResult<()> {
        self.transport
            .publish(target.topic, &target.key, target.mode, frame)
            .await?;
        Ok(())
    }

    /// Record an inbound acknowledgement for `envelope_id`.
    ///
    /// Unknown or already-cleared targets are ignored; resent
    /// envelopes produce duplicate acks by design.
    pub fn acknowledge_received(&self, envelope_id: &EnvelopeId) {
        if self.pending.remove(envelope_id).is_some() {
            debug!(%envelope_id, "envelope acknowledged");
        }
        self.cancel_retry_task(envelope_id);
    }

    /// Stop tracking an envelope without an acknowledgement.
    ///
    /// Used when the owning connection is torn down. Idempotent; no
    /// republish escapes after the call returns.
    pub fn remove_queued(&self, envelope_id: &EnvelopeId) {
        self.pending.remove(envelope_id);
        self.cancel_retry_task(envelope_id);
    }

    fn cancel_retry_task(&self, envelope_id: &EnvelopeId) {
        if let Some((_, task)) = self.retry_tasks.remove(envelope_id) {
            task.abort();
        }
    }

    /// Number of envelopes currently awaiting acknowledgement
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop all tracked envelopes and cancel their retry tasks.
    pub fn shutdown(&self) {
        self.pending.clear();
        self.retry_tasks.retain(|_, task| {
            task.abort();
            false
        });
    }

    async fn retry_loop(&self, envelope_id: EnvelopeId) {
        let mut resends = 0u32;
        loop {
            tokio::time::sleep(self.config.envelope_expiry).await;

            // The ack may have landed while we slept; membership is
            // re-checked before every republish.
            let Some(entry) = self.pending.get(&envelope_id) else {
                break;
            };
            let envelope = entry.value().clone();
            drop(entry);

            if resends >= self.config.max_envelope_resends {
                if self.pending.remove(&envelope_id).is_some() {
                    warn!(
                        %envelope_id,
                        connection_id = %envelope.connection_id,
                        resends,
                        "envelope resend ceiling reached"
                    );
                    let _ = self.failures.send(DeliveryFailure {
                        connection_id: envelope.connection_id,
                        envelope_id,
                    });
                }
                break;
            }

            resends += 1;
            // A cancellation can land between the lookup above and
            // here; check once more right before the frame goes out
            if !self.pending.contains_key(&envelope_id) {
                break;
            }
            debug!(%envelope_id, resends, "republishing unacknowledged envelope");
            if let Err(error) = self
                .transport
                .publish(
                    envelope.target.topic,
                    &envelope.target.key,
                    envelope.target.mode,
                    &envelope.frame,
                )
                .await
            {
                warn!(%envelope_id, %error, "republish failed");
            }
        }
        self.retry_tasks.remove(&envelope_id);
    }
}
