//! Session state machines for the transfer flow.
//!
//! A session is the application-level exchange riding on one
//! connection: request, reply, transfer request/reply,
//! dispatch/confirmation, termination. Both roles share one linear
//! state ladder; the numeric discriminants are ordered so that rank
//! comparisons implement the duplicate/premature guards directly.
//!
//! The guards live in the pure [`SessionCore`], which consumes inputs
//! (outbound step commands, inbound typed messages, timer expiry) and
//! emits ordered [`SessionAction`]s. The async role drivers
//! ([`OriginatorSession`], [`BeneficiarySession`]) execute those
//! actions through the connection manager and own the single re-armed
//! timeout timer. Sequence violations are dropped silently on the wire
//! but counted and logged locally.

use crate::config::MessageTimeouts;
use crate::connection::{ConnectionManager, InboundMessage};
use crate::error::{ConnectionError, Error, MessageError, SessionError};
use crate::message::{self, MessageType, ProtocolMessage};
use crate::payload::MessageBody;
use crate::registry::KeyRegistry;
use crate::transport::Transport;
use crate::types::{ConnectionId, SessionId, VaspCode};
use openvasp_crypto::secp256k1::{KeyPair, PublicKey};
use openvasp_crypto::{AeadKey, SigningKey, VerifyingKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Which side of the transfer this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The VASP initiating the transfer
    Originator,
    /// The VASP receiving the transfer
    Beneficiary,
}

/// Session lifecycle states.
///
/// Discriminants are ordered along the flow; each role only ever moves
/// to higher ranks, and `Aborted` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Nothing exchanged yet
    None = 0,
    /// Session request sent (originator)
    RequestSent = 1,
    /// Session request received (beneficiary)
    RequestReceived = 2,
    /// Session reply sent (beneficiary)
    ReplySent = 3,
    /// Session reply received (originator)
    ReplyReceived = 4,
    /// Transfer request sent (originator)
    TransferRequestSent = 5,
    /// Transfer request received (beneficiary)
    TransferRequestReceived = 6,
    /// Transfer reply sent (beneficiary)
    TransferReplySent = 7,
    /// Transfer reply received (originator)
    TransferReplyReceived = 8,
    /// Transfer dispatch sent (originator)
    TransferDispatchSent = 9,
    /// Transfer dispatch received (beneficiary)
    TransferDispatchReceived = 10,
    /// Transfer confirmation sent (beneficiary)
    TransferConfirmationSent = 11,
    /// Transfer confirmation received (originator)
    TransferConfirmationReceived = 12,
    /// Termination sent (originator)
    TerminationSent = 13,
    /// Termination received (beneficiary)
    TerminationReceived = 14,
    /// Session aborted (absorbing)
    Aborted = 15,
}

impl SessionState {
    fn rank(self) -> u8 {
        self as u8
    }
}

/// Why a session ended without completing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The originator gave up waiting for the beneficiary
    CancelledByOriginator,
    /// The beneficiary gave up waiting for the originator
    DeclinedByBeneficiary,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CancelledByOriginator => write!(f, "cancelled by originator"),
            Self::DeclinedByBeneficiary => write!(f, "declined by beneficiary"),
        }
    }
}

/// Session notifications surfaced to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The beneficiary answered the session request
    Accepted,
    /// The beneficiary side gave up on the session
    Declined(AbortReason),
    /// The originator side gave up on the session
    Aborted(AbortReason),
    /// The session completed with a termination
    Terminated,
    /// A typed message passed the sequence guards
    MessageReceived(MessageType),
}

/// One effect the state machine asks the runner to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// (Re)send the recorded message of this type
    Send(MessageType),
    /// Arm the timeout timer with this type's policy
    ArmTimer(MessageType),
    /// Cancel the pending timer
    DisarmTimer,
    /// Notify the application
    Emit(SessionEvent),
}

/// Pure session state machine.
///
/// Holds no I/O: every transition is a function from (state, input) to
/// (state, actions), so the guards are testable without a runtime.
pub struct SessionCore {
    session_id: SessionId,
    role: Role,
    state: SessionState,
    retries: u32,
    timeouts: MessageTimeouts,
    dropped: u64,
}

impl SessionCore {
    /// Create a fresh state machine in [`SessionState::None`]
    #[must_use]
    pub fn new(session_id: SessionId, role: Role, timeouts: MessageTimeouts) -> Self {
        Self {
            session_id,
            role,
            state: SessionState::None,
            retries: 0,
            timeouts,
            dropped: 0,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// This machine's role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Inputs dropped by the sequence guards so far
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// (predecessor state, resulting state) for a message this role sends
    fn outbound_transition(role: Role, message_type: MessageType) -> Option<(u8, SessionState)> {
        use MessageType as M;
        use SessionState as S;
        match (role, message_type) {
            (Role::Originator, M::SessionRequest) => Some((S::None.rank(), S::RequestSent)),
            (Role::Originator, M::TransferRequest) => {
                Some((S::ReplyReceived.rank(), S::TransferRequestSent))
            }
            (Role::Originator, M::TransferDispatch) => {
                Some((S::TransferReplyReceived.rank(), S::TransferDispatchSent))
            }
            (Role::Originator, M::Termination) => {
                Some((S::TransferConfirmationReceived.rank(), S::TerminationSent))
            }
            (Role::Beneficiary, M::SessionReply) => {
                Some((S::RequestReceived.rank(), S::ReplySent))
            }
            (Role::Beneficiary, M::TransferReply) => {
                Some((S::TransferRequestReceived.rank(), S::TransferReplySent))
            }
            (Role::Beneficiary, M::TransferConfirmation) => {
                Some((S::TransferDispatchReceived.rank(), S::TransferConfirmationSent))
            }
            _ => None,
        }
    }

    /// (floor state, resulting state) for a message this role receives
    fn inbound_transition(role: Role, message_type: MessageType) -> Option<(u8, SessionState)> {
        use MessageType as M;
        use SessionState as S;
        match (role, message_type) {
            (Role::Originator, M::SessionReply) => {
                Some((S::RequestSent.rank(), S::ReplyReceived))
            }
            (Role::Originator, M::TransferReply) => {
                Some((S::TransferRequestSent.rank(), S::TransferReplyReceived))
            }
            (Role::Originator, M::TransferConfirmation) => Some((
                S::TransferDispatchSent.rank(),
                S::TransferConfirmationReceived,
            )),
            (Role::Beneficiary, M::SessionRequest) => {
                Some((S::None.rank(), S::RequestReceived))
            }
            (Role::Beneficiary, M::TransferRequest) => {
                Some((S::ReplySent.rank(), S::TransferRequestReceived))
            }
            (Role::Beneficiary, M::TransferDispatch) => {
                Some((S::TransferReplySent.rank(), S::TransferDispatchReceived))
            }
            (Role::Beneficiary, M::Termination) => {
                Some((S::TransferConfirmationSent.rank(), S::TerminationReceived))
            }
            _ => None,
        }
    }

    /// The message type a "sent" state is waiting on
    fn awaited_type(state: SessionState) -> Option<MessageType> {
        use MessageType as M;
        use SessionState as S;
        match state {
            S::RequestSent => Some(M::SessionRequest),
            S::ReplySent => Some(M::SessionReply),
            S::TransferRequestSent => Some(M::TransferRequest),
            S::TransferReplySent => Some(M::TransferReply),
            S::TransferDispatchSent => Some(M::TransferDispatch),
            S::TransferConfirmationSent => Some(M::TransferConfirmation),
            S::TerminationSent => Some(M::Termination),
            _ => None,
        }
    }

    fn abort_event(&self, reason: AbortReason) -> SessionEvent {
        match self.role {
            Role::Originator => SessionEvent::Aborted(reason),
            Role::Beneficiary => SessionEvent::Declined(reason),
        }
    }

    fn drop_input(&mut self, message_type: MessageType, why: &'static str) -> Vec<SessionAction> {
        self.dropped += 1;
        debug!(
            session_id = %self.session_id,
            state = ?self.state,
            ?message_type,
            why,
            "session input dropped"
        );
        Vec::new()
    }

    /// Perform an outbound step.
    ///
    /// A step that was already performed, or whose predecessor has not
    /// been reached, is a logged no-op returning no actions. A legal
    /// step advances the state, resets the retry counter, and asks for
    /// a send plus a freshly armed timer.
    pub fn outbound_step(&mut self, message_type: MessageType) -> Vec<SessionAction> {
        if self.state == SessionState::Aborted {
            return self.drop_input(message_type, "aborted");
        }
        let Some((required, target)) = Self::outbound_transition(self.role, message_type) else {
            return self.drop_input(message_type, "wrong direction");
        };
        if self.state.rank() >= target.rank() {
            return self.drop_input(message_type, "already performed");
        }
        if self.state.rank() < required {
            return self.drop_input(message_type, "premature");
        }

        self.state = target;
        self.retries = 0;
        vec![
            SessionAction::Send(message_type),
            SessionAction::ArmTimer(message_type),
        ]
    }

    /// Process an inbound typed message that already passed decryption
    /// and signature verification.
    ///
    /// Messages below the floor (unexpected) or at/above the resulting
    /// state (duplicate/outdated) are dropped without any wire
    /// reaction.
    pub fn inbound_message(&mut self, message_type: MessageType) -> Vec<SessionAction> {
        if self.state == SessionState::Aborted {
            return self.drop_input(message_type, "aborted");
        }
        let Some((floor, target)) = Self::inbound_transition(self.role, message_type) else {
            return self.drop_input(message_type, "wrong direction");
        };
        if self.state.rank() >= target.rank() {
            return self.drop_input(message_type, "duplicate");
        }
        if self.state.rank() < floor {
            return self.drop_input(message_type, "unexpected");
        }

        self.state = target;
        self.retries = 0;

        let mut actions = vec![
            SessionAction::DisarmTimer,
            SessionAction::Emit(SessionEvent::MessageReceived(message_type)),
        ];
        match message_type {
            MessageType::SessionReply => actions.push(SessionAction::Emit(SessionEvent::Accepted)),
            MessageType::Termination => {
                actions.push(SessionAction::Emit(SessionEvent::Terminated));
            }
            _ => {}
        }
        actions
    }

    /// Process a timeout timer expiry.
    ///
    /// While the retry budget lasts, the recorded message is resent and
    /// the timer re-armed; once exhausted the session aborts with the
    /// role-specific reason (a sent termination instead completes the
    /// session). A zero budget yields exactly one timeout-triggered
    /// abort.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnexpectedTimeout`] when the timer fires
    /// in a state with no defined retry behavior.
    pub fn timer_expired(&mut self) -> Result<Vec<SessionAction>, SessionError> {
        if self.state == SessionState::Aborted {
            // Raced an abort; nothing left to do
            return Ok(Vec::new());
        }
        let Some(message_type) = Self::awaited_type(self.state) else {
            return Err(SessionError::UnexpectedTimeout {
                session: self.session_id,
                state: self.state,
            });
        };

        let policy = self.timeouts.for_type(message_type);
        if self.retries < policy.max_retries {
            self.retries += 1;
            return Ok(vec![
                SessionAction::Send(message_type),
                SessionAction::ArmTimer(message_type),
            ]);
        }

        if message_type == MessageType::Termination {
            // The counterpart owes nothing after a termination; running
            // out the clock completes the session
            return Ok(vec![SessionAction::Emit(SessionEvent::Terminated)]);
        }

        let reason = match self.role {
            Role::Originator => AbortReason::CancelledByOriginator,
            Role::Beneficiary => AbortReason::DeclinedByBeneficiary,
        };
        self.state = SessionState::Aborted;
        Ok(vec![SessionAction::Emit(self.abort_event(reason))])
    }

    /// Abort the session explicitly.
    pub fn abort(&mut self, reason: AbortReason) -> Vec<SessionAction> {
        if self.state == SessionState::Aborted {
            return Vec::new();
        }
        self.state = SessionState::Aborted;
        vec![
            SessionAction::DisarmTimer,
            SessionAction::Emit(self.abort_event(reason)),
        ]
    }
}

struct SessionShared<T: Transport + 'static, R: KeyRegistry + 'static> {
    session_id: SessionId,
    manager: Arc<ConnectionManager<T, R>>,
    connection_id: ConnectionId,
    identity: VaspCode,
    counterpart: VaspCode,
    signing: SigningKey,
    peer_verifying: VerifyingKey,
    temp_key: AeadKey,
    core: Mutex<SessionCore>,
    recorded: Mutex<HashMap<MessageType, MessageBody>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<T: Transport + 'static, R: KeyRegistry + 'static> SessionShared<T, R> {
    /// The AEAD key protecting a message of this type: the temporary
    /// handshake key for the session request/reply, the confirmed
    /// connection key afterwards.
    fn key_for(&self, message_type: MessageType) -> Result<AeadKey, Error> {
        match message_type {
            MessageType::SessionRequest | MessageType::SessionReply => Ok(self.temp_key.clone()),
            _ => self
                .manager
                .symmetric_key(&self.connection_id)
                .ok_or_else(|| ConnectionError::NoSymmetricKey(self.connection_id).into()),
        }
    }

    /// Decryption candidates for an inbound payload, most likely key
    /// first.
    ///
    /// The at-least-once delivery layer can redeliver handshake
    /// traffic sealed under the temporary key after the state has
    /// advanced past the handshake, so both keys are candidates; the
    /// sequence guard classifies whatever decrypts.
    fn inbound_keys(&self) -> Vec<AeadKey> {
        let rank = { self.core.lock().unwrap().state().rank() };
        let confirmed = self.manager.symmetric_key(&self.connection_id);
        let mut keys = Vec::with_capacity(2);
        if rank < SessionState::ReplySent.rank() {
            keys.push(self.temp_key.clone());
            keys.extend(confirmed);
        } else {
            keys.extend(confirmed);
            keys.push(self.temp_key.clone());
        }
        keys
    }

    async fn transmit(&self, message_type: MessageType, body: MessageBody) -> Result<(), Error> {
        match message_type {
            MessageType::SessionRequest => self.manager.invite(self.connection_id, body).await,
            MessageType::SessionReply => self.manager.accept(self.connection_id, body).await,
            _ => self
                .manager
                .send(self.connection_id, body)
                .await
                .map(|_| ()),
        }
    }

    fn disarm_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn arm_timer<T, R>(shared: &Arc<SessionShared<T, R>>, message_type: MessageType)
where
    T: Transport + 'static,
    R: KeyRegistry + 'static,
{
    let policy = {
        let core = shared.core.lock().unwrap();
        core.timeouts.for_type(message_type)
    };
    let fired = shared.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(policy.timeout).await;
        let result = { fired.core.lock().unwrap().timer_expired() };
        match result {
            Ok(actions) => {
                if let Err(err) = run_actions(&fired, actions).await {
                    warn!(session_id = %fired.session_id, %err, "timeout resend failed");
                }
            }
            Err(err) => {
                error!(session_id = %fired.session_id, %err, "session timer inconsistency");
            }
        }
    });
    if let Some(old) = shared.timer.lock().unwrap().replace(handle) {
        old.abort();
    }
}

async fn run_actions<T, R>(
    shared: &Arc<SessionShared<T, R>>,
    actions: Vec<SessionAction>,
) -> Result<(), Error>
where
    T: Transport + 'static,
    R: KeyRegistry + 'static,
{
    for action in actions {
        match action {
            SessionAction::Send(message_type) => {
                let body = shared.recorded.lock().unwrap().get(&message_type).cloned();
                if let Some(body) = body {
                    shared.transmit(message_type, body).await?;
                }
            }
            SessionAction::ArmTimer(message_type) => arm_timer(shared, message_type),
            SessionAction::DisarmTimer => shared.disarm_timer(),
            SessionAction::Emit(event) => {
                let _ = shared.events.send(event);
            }
        }
    }
    Ok(())
}

/// Run the outbound guard, then seal the typed message, record it for
/// retransmission, and execute the resulting state machine actions. A
/// guarded no-op step returns without touching any key material.
async fn step<T, R>(
    shared: &Arc<SessionShared<T, R>>,
    message_type: MessageType,
    body: serde_json::Value,
) -> Result<(), Error>
where
    T: Transport + 'static,
    R: KeyRegistry + 'static,
{
    let actions = { shared.core.lock().unwrap().outbound_step(message_type) };
    if actions.is_empty() {
        return Ok(());
    }

    let key = shared.key_for(message_type)?;
    let message = ProtocolMessage::new(
        shared.session_id,
        message_type,
        shared.identity,
        shared.counterpart,
        body,
    );
    let sealed = message::seal(&message, &shared.signing, &key)?;
    let wire = MessageBody::from_bytes(sealed.wire_hex.into_bytes());
    shared.recorded.lock().unwrap().insert(message_type, wire);
    run_actions(shared, actions).await
}

async fn handle_inbound<T, R>(
    shared: &Arc<SessionShared<T, R>>,
    raw: &MessageBody,
) -> Result<Option<ProtocolMessage>, Error>
where
    T: Transport + 'static,
    R: KeyRegistry + 'static,
{
    let wire_hex = std::str::from_utf8(raw.as_bytes()).map_err(|_| MessageError::InvalidHex)?;

    let mut parsed = None;
    for key in shared.inbound_keys() {
        match message::open(wire_hex, &key, &shared.peer_verifying) {
            Ok(message) => {
                parsed = Some(message);
                break;
            }
            Err(MessageError::DecryptionFailed(_)) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    let Some(parsed) = parsed else {
        warn!(
            session_id = %shared.session_id,
            "inbound payload decrypts under no session key, dropped"
        );
        return Ok(None);
    };

    if parsed.header.session_id != shared.session_id {
        debug!(
            session_id = %shared.session_id,
            inbound = %parsed.header.session_id,
            "message for another session dropped"
        );
        return Ok(None);
    }

    let actions = {
        shared
            .core
            .lock()
            .unwrap()
            .inbound_message(parsed.header.message_type)
    };
    if actions.is_empty() {
        return Ok(None);
    }
    run_actions(shared, actions).await?;
    Ok(Some(parsed))
}

async fn lookup_peer_keys<R: KeyRegistry>(
    registry: &R,
    counterpart: VaspCode,
) -> Result<(PublicKey, VerifyingKey), Error> {
    let message_hex =
        registry
            .message_key(&counterpart)
            .await
            .ok_or(ConnectionError::MissingRegistryKey {
                kind: "message",
                code: counterpart,
            })?;
    let signing_hex =
        registry
            .signing_key(&counterpart)
            .await
            .ok_or(ConnectionError::MissingRegistryKey {
                kind: "signing",
                code: counterpart,
            })?;

    let message_bytes = hex::decode(&message_hex).map_err(|_| MessageError::InvalidHex)?;
    let signing_bytes = hex::decode(&signing_hex).map_err(|_| MessageError::InvalidHex)?;
    let message_key = PublicKey::from_sec1_slice(&message_bytes)?;
    let verifying = VerifyingKey::from_sec1_bytes(&signing_bytes)?;
    Ok((message_key, verifying))
}

/// Originator-side session driver.
pub struct OriginatorSession<T: Transport + 'static, R: KeyRegistry + 'static> {
    shared: Arc<SessionShared<T, R>>,
}

impl<T: Transport + 'static, R: KeyRegistry + 'static> OriginatorSession<T, R> {
    /// Open a connection to the beneficiary and send the session
    /// request riding its invite.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::MissingRegistryKey`] when the
    /// beneficiary has not published its message or signing key, or a
    /// downstream connection/crypto error.
    pub async fn start(
        manager: Arc<ConnectionManager<T, R>>,
        registry: &R,
        identity: VaspCode,
        counterpart: VaspCode,
        signing: SigningKey,
        request_body: serde_json::Value,
        timeouts: MessageTimeouts,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), Error> {
        let (peer_message_key, peer_verifying) = lookup_peer_keys(registry, counterpart).await?;

        let connection_id = manager.open_connection(counterpart).await?;
        let temp_key = manager
            .handshake_key(&connection_id, &peer_message_key)
            .ok_or(ConnectionError::UnknownConnection(connection_id))?;

        let session_id = SessionId::random();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            session_id,
            manager,
            connection_id,
            identity,
            counterpart,
            signing,
            peer_verifying,
            temp_key,
            core: Mutex::new(SessionCore::new(session_id, Role::Originator, timeouts)),
            recorded: Mutex::new(HashMap::new()),
            timer: Mutex::new(None),
            events: events_tx,
        });

        step(&shared, MessageType::SessionRequest, request_body).await?;
        Ok((Self { shared }, events_rx))
    }

    /// Send the transfer request (requires the session reply).
    ///
    /// # Errors
    ///
    /// Returns a connection or message error if the send fails.
    pub async fn transfer_request(&self, body: serde_json::Value) -> Result<(), Error> {
        step(&self.shared, MessageType::TransferRequest, body).await
    }

    /// Send the transfer dispatch (requires the transfer reply).
    ///
    /// # Errors
    ///
    /// Returns a connection or message error if the send fails.
    pub async fn transfer_dispatch(&self, body: serde_json::Value) -> Result<(), Error> {
        step(&self.shared, MessageType::TransferDispatch, body).await
    }

    /// Send the termination (requires the transfer confirmation).
    ///
    /// # Errors
    ///
    /// Returns a connection or message error if the send fails.
    pub async fn terminate(&self, body: serde_json::Value) -> Result<(), Error> {
        step(&self.shared, MessageType::Termination, body).await
    }

    /// Feed an inbound connection payload into the session.
    ///
    /// Returns the parsed message when it passed the sequence guards,
    /// `None` when it was dropped.
    ///
    /// # Errors
    ///
    /// Returns a [`MessageError`] for undecryptable or forged payloads.
    pub async fn handle_inbound(
        &self,
        inbound: &InboundMessage,
    ) -> Result<Option<ProtocolMessage>, Error> {
        handle_inbound(&self.shared, &inbound.body).await
    }

    /// Abort the session locally.
    pub async fn abort(&self) {
        let actions = {
            self.shared
                .core
                .lock()
                .unwrap()
                .abort(AbortReason::CancelledByOriginator)
        };
        if let Err(err) = run_actions(&self.shared, actions).await {
            warn!(session_id = %self.shared.session_id, %err, "abort actions failed");
        }
    }

    /// The session id
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.shared.session_id
    }

    /// The connection the session rides on
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.core.lock().unwrap().state()
    }

    /// Cancel the timer; the session keeps its terminal state.
    pub fn close(&self) {
        self.shared.disarm_timer();
    }
}

/// Beneficiary-side session driver.
pub struct BeneficiarySession<T: Transport + 'static, R: KeyRegistry + 'static> {
    shared: Arc<SessionShared<T, R>>,
}

impl<T: Transport + 'static, R: KeyRegistry + 'static> BeneficiarySession<T, R> {
    /// Build a session from an inbound invite payload carrying a
    /// session request.
    ///
    /// `message_keys` is this VASP's registry message key pair; the
    /// temporary key is its agreement with the originator's connection
    /// ephemeral key. Returns the driver, the event stream, and the
    /// parsed session request.
    ///
    /// # Errors
    ///
    /// Returns a [`MessageError`] for an undecryptable, forged, or
    /// non-session-request payload, or a [`ConnectionError`] when the
    /// originator's keys are unknown.
    pub async fn from_session_request(
        manager: Arc<ConnectionManager<T, R>>,
        registry: &R,
        identity: VaspCode,
        message_keys: &KeyPair,
        signing: SigningKey,
        inbound: &InboundMessage,
        timeouts: MessageTimeouts,
    ) -> Result<
        (
            Self,
            mpsc::UnboundedReceiver<SessionEvent>,
            ProtocolMessage,
        ),
        Error,
    > {
        let counterpart = inbound.sender;
        let connection_id = inbound.connection_id;

        let peer_ephemeral = manager
            .peer_ephemeral_key(&connection_id)
            .ok_or(ConnectionError::NoCounterpartKey(connection_id))?;
        let temp_key =
            AeadKey::from_bytes(*message_keys.diffie_hellman(&peer_ephemeral).as_bytes());

        let signing_hex =
            registry
                .signing_key(&counterpart)
                .await
                .ok_or(ConnectionError::MissingRegistryKey {
                    kind: "signing",
                    code: counterpart,
                })?;
        let signing_bytes = hex::decode(&signing_hex).map_err(|_| MessageError::InvalidHex)?;
        let peer_verifying = VerifyingKey::from_sec1_bytes(&signing_bytes)?;

        let wire_hex =
            std::str::from_utf8(inbound.body.as_bytes()).map_err(|_| MessageError::InvalidHex)?;
        let request = message::open(wire_hex, &temp_key, &peer_verifying)?;
        if request.header.message_type != MessageType::SessionRequest {
            return Err(MessageError::Malformed(format!(
                "expected a session request, got {:?}",
                request.header.message_type
            ))
            .into());
        }

        let session_id = request.header.session_id;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            session_id,
            manager,
            connection_id,
            identity,
            counterpart,
            signing,
            peer_verifying,
            temp_key,
            core: Mutex::new(SessionCore::new(session_id, Role::Beneficiary, timeouts)),
            recorded: Mutex::new(HashMap::new()),
            timer: Mutex::new(None),
            events: events_tx,
        });

        let actions = {
            shared
                .core
                .lock()
                .unwrap()
                .inbound_message(MessageType::SessionRequest)
        };
        run_actions(&shared, actions).await?;

        Ok((Self { shared }, events_rx, request))
    }

    /// Answer the session request (rides the connection accept).
    ///
    /// # Errors
    ///
    /// Returns a connection or message error if the send fails.
    pub async fn session_reply(&self, body: serde_json::Value) -> Result<(), Error> {
        step(&self.shared, MessageType::SessionReply, body).await
    }

    /// Answer the transfer request.
    ///
    /// # Errors
    ///
    /// Returns a connection or message error if the send fails.
    pub async fn transfer_reply(&self, body: serde_json::Value) -> Result<(), Error> {
        step(&self.shared, MessageType::TransferReply, body).await
    }

    /// Confirm the transfer dispatch.
    ///
    /// # Errors
    ///
    /// Returns a connection or message error if the send fails.
    pub async fn transfer_confirmation(&self, body: serde_json::Value) -> Result<(), Error> {
        step(&self.shared, MessageType::TransferConfirmation, body).await
    }

    /// Feed an inbound connection payload into the session.
    ///
    /// Returns the parsed message when it passed the sequence guards,
    /// `None` when it was dropped.
    ///
    /// # Errors
    ///
    /// Returns a [`MessageError`] for undecryptable or forged payloads.
    pub async fn handle_inbound(
        &self,
        inbound: &InboundMessage,
    ) -> Result<Option<ProtocolMessage>, Error> {
        handle_inbound(&self.shared, &inbound.body).await
    }

    /// Abort the session locally.
    pub async fn abort(&self) {
        let actions = {
            self.shared
                .core
                .lock()
                .unwrap()
                .abort(AbortReason::DeclinedByBeneficiary)
        };
        if let Err(err) = run_actions(&self.shared, actions).await {
            warn!(session_id = %self.shared.session_id, %err, "abort actions failed");
        }
    }

    /// The session id
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.shared.session_id
    }

    /// The connection the session rides on
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.core.lock().unwrap().state()
    }

    /// Cancel the timer; the session keeps its terminal state.
    pub fn close(&self) {
        self.shared.disarm_timer();
    }
}
