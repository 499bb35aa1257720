//! Protocol configuration parameters.
//!
//! All timing behavior - envelope retries, transport polling, and the
//! per-message-type session timeouts - derives from this config. There
//! are no implicit transport timeouts.

use crate::message::MessageType;
use std::time::Duration;

/// Retry budget for one outbound session step
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    /// Time to wait for the counterpart's answer before acting
    pub timeout: Duration,
    /// Resends before the session is terminated. Zero still arms the
    /// timer once, giving the step exactly one abort opportunity.
    pub max_retries: u32,
}

impl TimeoutPolicy {
    /// Construct a policy
    #[must_use]
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
        }
    }
}

/// Per-message-type session timeout policies
#[derive(Debug, Clone)]
pub struct MessageTimeouts {
    /// After sending a session request (awaiting the reply)
    pub session_request: TimeoutPolicy,
    /// After sending a session reply (awaiting the transfer request)
    pub session_reply: TimeoutPolicy,
    /// After sending a transfer request (awaiting the transfer reply)
    pub transfer_request: TimeoutPolicy,
    /// After sending a transfer reply (awaiting the dispatch)
    pub transfer_reply: TimeoutPolicy,
    /// After sending a transfer dispatch (awaiting the confirmation)
    pub transfer_dispatch: TimeoutPolicy,
    /// After sending a transfer confirmation (awaiting termination)
    pub transfer_confirmation: TimeoutPolicy,
    /// After sending a termination (awaiting delivery)
    pub termination: TimeoutPolicy,
}

impl MessageTimeouts {
    /// The policy guarding the step that sent `message_type`
    #[must_use]
    pub fn for_type(&self, message_type: MessageType) -> TimeoutPolicy {
        match message_type {
            MessageType::SessionRequest => self.session_request,
            MessageType::SessionReply => self.session_reply,
            MessageType::TransferRequest => self.transfer_request,
            MessageType::TransferReply => self.transfer_reply,
            MessageType::TransferDispatch => self.transfer_dispatch,
            MessageType::TransferConfirmation => self.transfer_confirmation,
            MessageType::Termination => self.termination,
        }
    }
}

impl Default for MessageTimeouts {
    fn default() -> Self {
        let standard = TimeoutPolicy::new(Duration::from_secs(30), 3);
        Self {
            session_request: standard,
            session_reply: TimeoutPolicy::new(Duration::from_secs(60), 2),
            transfer_request: standard,
            transfer_reply: TimeoutPolicy::new(Duration::from_secs(60), 2),
            transfer_dispatch: standard,
            transfer_confirmation: TimeoutPolicy::new(Duration::from_secs(60), 2),
            termination: TimeoutPolicy::new(Duration::from_secs(30), 1),
        }
    }
}

/// Protocol configuration parameters
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Interval between envelope republishes while unacknowledged
    pub envelope_expiry: Duration,
    /// Republish ceiling before a connection is deactivated
    pub max_envelope_resends: u32,
    /// Transport polling interval for the connection manager tick
    pub tick_interval: Duration,
    /// Per-message-type session timeout policies
    pub message_timeouts: MessageTimeouts,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            envelope_expiry: Duration::from_secs(5),
            max_envelope_resends: 3,
            tick_interval: Duration::from_millis(500),
            message_timeouts: MessageTimeouts::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_sane() {
        let config = ProtocolConfig::default();
        assert!(config.envelope_expiry > Duration::ZERO);
        assert!(config.max_envelope_resends > 0);
        assert!(config.tick_interval < config.envelope_expiry);
    }

    #[test]
    fn test_policy_lookup_covers_all_types() {
        let timeouts = MessageTimeouts::default();
        for message_type in MessageType::ALL {
            let policy = timeouts.for_type(message_type);
            assert!(policy.timeout > Duration::ZERO);
        }
    }
}
