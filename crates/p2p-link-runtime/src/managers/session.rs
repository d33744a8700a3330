//! Session manager for the p2p link layer
//!
//! Owns every piece of session state of this node:
//!
//! - the per-counterparty state machine (`Absent -> Pending -> Established`,
//!   `Pending -> Failed`, `Established -> Absent`),
//! - the handshakes this node initiated and the ones it is answering,
//! - the established sessions, indexed by session id for inbound traffic.
//!
//! All maps are `DashMap`s so unrelated counterparties never contend on the
//! same lock. Lock order is `outbound` before `pending_outbound`, `sessions`
//! and the pending-session queue; no code path acquires `outbound` while
//! holding one of the others.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use p2p_link_core::crypto::check_session_key_trust;
use p2p_link_core::records::{
    InitiatorHandshakeMessage, InitiatorHelloMessage, ResponderHandshakeMessage,
    ResponderHelloMessage,
};
use p2p_link_core::session::HandshakeStep;
use p2p_link_core::{
    AppMessage, AuthenticatedMessage, AuthenticationProtocolInitiator,
    AuthenticationProtocolResponder, CounterpartyKey, HandshakeError, HoldingIdentity, LinkError,
    LinkInMessage, LinkManagerConfig, LinkOutMessage, LinkPayload, LinkResult, MemberInfo,
    ProtocolMode, Session, SessionId, SignatureSpec, TimeSource, Timestamp,
};

use crate::collaborators::{
    GroupPolicyProvider, HostingMap, LinkCollaborators, MembershipLookup, SigningOracle,
};
use crate::converter::MessageConverter;
use crate::managers::partitions::PartitionAssignmentTracker;
use crate::managers::pending_queue::PendingSessionQueue;
use crate::managers::renewal::{renewal_policy_for, SessionActivity, SessionRenewalPolicy};

// ----------------------------------------------------------------------------
// Public State Types
// ----------------------------------------------------------------------------

/// Session init messages the caller must publish, one per started handshake
pub type NewSessions = SmallVec<[(SessionId, LinkOutMessage); 1]>;

/// What the caller must do with an outbound message
#[derive(Debug, Clone)]
pub enum SessionState {
    /// The message travels without a session
    NoSessionRequired,
    /// A handshake is in flight; the message was queued behind it
    SessionAlreadyPending { session_id: SessionId },
    /// Handshakes were started; the message was queued behind them
    NewSessionsNeeded { messages: NewSessions },
    /// Seal the message under this session
    SessionEstablished { session: Arc<dyn Session> },
    /// No session can be negotiated for this attempt
    CannotEstablishSession,
}

/// Which side of the handshake this node was on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionDirection {
    Outbound,
    Inbound,
}

/// Session found for an inbound data message
#[derive(Debug, Clone)]
pub struct InboundSession {
    pub session: Arc<dyn Session>,
    /// Our identity and the peer's, as negotiated
    pub counterparties: CounterpartyKey,
    pub direction: SessionDirection,
}

/// Coarse state of one counterparty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterpartyStatus {
    Absent,
    Pending,
    Established,
    Failed,
}

/// Session statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounts {
    /// Counterparties with a negotiation in flight
    pub pending: usize,
    /// Counterparties with at least one established session
    pub established: usize,
    /// Counterparties whose last negotiation failed
    pub failed: usize,
    /// Handshakes this node is answering
    pub inbound_handshakes: usize,
    /// Established sessions in either direction
    pub sessions: usize,
}

// ----------------------------------------------------------------------------
// Internal State
// ----------------------------------------------------------------------------

struct SessionEntry {
    session: Arc<dyn Session>,
    counterparties: CounterpartyKey,
    direction: SessionDirection,
    established_at: Timestamp,
    /// Milliseconds since epoch, zero when never used
    last_sent: AtomicU64,
    last_received: AtomicU64,
}

impl SessionEntry {
    fn new(
        session: Arc<dyn Session>,
        counterparties: CounterpartyKey,
        direction: SessionDirection,
        established_at: Timestamp,
    ) -> Self {
        Self {
            session,
            counterparties,
            direction,
            established_at,
            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
        }
    }

    fn activity(&self) -> SessionActivity {
        let load = |instant: &AtomicU64| match instant.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(Timestamp::new(millis)),
        };
        SessionActivity {
            session_id: self.session.session_id().clone(),
            established_at: self.established_at,
            last_sent: load(&self.last_sent),
            last_received: load(&self.last_received),
        }
    }
}

enum OutboundState {
    Pending {
        /// Reported to callers that find the negotiation in flight
        primary: SessionId,
        session_ids: Vec<SessionId>,
        failed: usize,
        started_at: Timestamp,
    },
    Established {
        sessions: Vec<Arc<SessionEntry>>,
    },
    Failed {
        reason: String,
        at: Timestamp,
    },
}

struct PendingOutbound {
    protocol: AuthenticationProtocolInitiator,
    our_key: [u8; 32],
    peer_key: [u8; 32],
}

struct PendingInbound {
    protocol: AuthenticationProtocolResponder,
    counterparties: CounterpartyKey,
    our_key: [u8; 32],
    peer_key: [u8; 32],
    /// Re-sent when the initiator hello is delivered twice
    hello_reply: LinkOutMessage,
    started_at: Timestamp,
}

struct ResolvedCounterparties {
    our: MemberInfo,
    peer: MemberInfo,
    /// Modes both our configuration and our directory entry allow
    our_modes: Vec<ProtocolMode>,
}

// ----------------------------------------------------------------------------
// Session Manager
// ----------------------------------------------------------------------------

/// Negotiates, caches and tears down sessions
pub struct SessionManager<T: TimeSource> {
    config: LinkManagerConfig,
    members: Arc<dyn MembershipLookup>,
    policies: Arc<dyn GroupPolicyProvider>,
    signer: Arc<dyn SigningOracle>,
    hosting: Arc<dyn HostingMap>,
    converter: Arc<MessageConverter>,
    partitions: Arc<PartitionAssignmentTracker>,
    queue: Arc<PendingSessionQueue<T>>,
    renewal: Box<dyn SessionRenewalPolicy>,
    time_source: T,
    outbound: DashMap<CounterpartyKey, OutboundState>,
    pending_outbound: DashMap<SessionId, PendingOutbound>,
    pending_inbound: DashMap<SessionId, PendingInbound>,
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    round_robin: AtomicUsize,
}

impl<T: TimeSource> SessionManager<T> {
    /// Create a session manager using the renewal policy the configuration selects
    pub fn new(
        config: LinkManagerConfig,
        collaborators: &LinkCollaborators,
        converter: Arc<MessageConverter>,
        partitions: Arc<PartitionAssignmentTracker>,
        queue: Arc<PendingSessionQueue<T>>,
        time_source: T,
    ) -> Self {
        let renewal = renewal_policy_for(&config);
        Self {
            config,
            members: collaborators.members.clone(),
            policies: collaborators.policies.clone(),
            signer: collaborators.signer.clone(),
            hosting: collaborators.hosting.clone(),
            converter,
            partitions,
            queue,
            renewal,
            time_source,
            outbound: DashMap::new(),
            pending_outbound: DashMap::new(),
            pending_inbound: DashMap::new(),
            sessions: DashMap::new(),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Replace the renewal policy
    pub fn with_renewal_policy(mut self, policy: Box<dyn SessionRenewalPolicy>) -> Self {
        self.renewal = policy;
        self
    }

    pub fn config(&self) -> &LinkManagerConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Resolve or start the session an outbound message needs
    ///
    /// While a negotiation is in flight the message is queued in the
    /// pending-session queue under the counterparty's entry lock, so it is
    /// guaranteed to be part of the flush when the first handshake completes.
    pub fn process_outbound_message(&self, message: &AppMessage) -> SessionState {
        match message {
            AppMessage::Authenticated(message) => self.process_authenticated_message(message),
            AppMessage::Unauthenticated(_) => SessionState::NoSessionRequired,
        }
    }

    /// `process_outbound_message` for a message known to need a session
    pub fn process_authenticated_message(&self, message: &AuthenticatedMessage) -> SessionState {
        let key = CounterpartyKey::new(
            message.header.source.clone(),
            message.header.destination.clone(),
        );

        if let Some(session) = self.established_session(&key) {
            return SessionState::SessionEstablished { session };
        }

        let now = self.time_source.now();
        match self.outbound.entry(key.clone()) {
            Entry::Occupied(mut entry) => match entry.get() {
                OutboundState::Established { sessions } => self
                    .pick(sessions)
                    .map_or(SessionState::CannotEstablishSession, |session| {
                        SessionState::SessionEstablished { session }
                    }),
                OutboundState::Pending { primary, .. } => {
                    let session_id = primary.clone();
                    self.queue.queue_message(message.clone(), &key);
                    debug!(counterparties = %key, %session_id, "session pending, message queued");
                    SessionState::SessionAlreadyPending { session_id }
                }
                OutboundState::Failed { .. } => match self.start_negotiation(&key, message, now) {
                    Ok((state, messages)) => {
                        entry.insert(state);
                        SessionState::NewSessionsNeeded { messages }
                    }
                    Err(error) => {
                        warn!(counterparties = %key, %error, "cannot establish session");
                        entry.insert(OutboundState::Failed {
                            reason: error.to_string(),
                            at: now,
                        });
                        SessionState::CannotEstablishSession
                    }
                },
            },
            Entry::Vacant(entry) => match self.start_negotiation(&key, message, now) {
                Ok((state, messages)) => {
                    entry.insert(state);
                    SessionState::NewSessionsNeeded { messages }
                }
                Err(error) => {
                    warn!(counterparties = %key, %error, "cannot establish session");
                    SessionState::CannotEstablishSession
                }
            },
        }
    }

    /// Record that a data message was transmitted on `session`
    pub fn data_message_sent(&self, session: &dyn Session) {
        if let Some(entry) = self.sessions.get(session.session_id()) {
            entry
                .last_sent
                .store(self.time_source.now().as_millis(), Ordering::Relaxed);
        }
    }

    fn established_session(&self, key: &CounterpartyKey) -> Option<Arc<dyn Session>> {
        let entry = self.outbound.get(key)?;
        match entry.value() {
            OutboundState::Established { sessions } => self.pick(sessions),
            _ => None,
        }
    }

    /// Round-robin across the established sessions of one counterparty
    fn pick(&self, sessions: &[Arc<SessionEntry>]) -> Option<Arc<dyn Session>> {
        if sessions.is_empty() {
            return None;
        }
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % sessions.len();
        sessions.get(index).map(|entry| entry.session.clone())
    }

    /// Resolve both sides of a counterparty pair and check the peer's key is trusted
    fn resolve_counterparties(&self, key: &CounterpartyKey) -> LinkResult<ResolvedCounterparties> {
        let our = self
            .members
            .resolve_member(&key.our_id)
            .ok_or_else(|| LinkError::unresolved(format!("member {}", key.our_id)))?;
        let peer = self
            .members
            .resolve_member(&key.counterparty_id)
            .ok_or_else(|| LinkError::unresolved(format!("member {}", key.counterparty_id)))?;
        let policy = self
            .policies
            .resolve_group_policy(&key.counterparty_id.group_id)
            .ok_or_else(|| {
                LinkError::unresolved(format!("group policy of {}", key.counterparty_id.group_id))
            })?;
        check_session_key_trust(&policy, &peer)?;

        let our_modes = self
            .config
            .protocol_modes
            .iter()
            .copied()
            .filter(|mode| our.protocol_modes.contains(mode))
            .collect();

        Ok(ResolvedCounterparties {
            our,
            peer,
            our_modes,
        })
    }

    /// Build the handshakes of a new negotiation and queue `message` behind them
    ///
    /// Called with the counterparty's entry lock held. Nothing is registered
    /// unless every handshake could be started.
    fn start_negotiation(
        &self,
        key: &CounterpartyKey,
        message: &AuthenticatedMessage,
        now: Timestamp,
    ) -> LinkResult<(OutboundState, NewSessions)> {
        if self.partitions.currently_assigned(None).is_empty() {
            return Err(LinkError::unresolved("assigned partitions of link.in"));
        }

        let resolved = self.resolve_counterparties(key)?;
        let offered: Vec<ProtocolMode> = resolved
            .our_modes
            .iter()
            .copied()
            .filter(|mode| resolved.peer.protocol_modes.contains(mode))
            .collect();
        if offered.is_empty() {
            return Err(HandshakeError::NoCommonProtocolMode {
                offered: format!("{:?}", resolved.our_modes),
                supported: format!("{:?}", resolved.peer.protocol_modes),
            }
            .into());
        }

        let mut protocols = Vec::with_capacity(self.config.sessions_per_counterparty);
        let mut messages = NewSessions::new();
        for _ in 0..self.config.sessions_per_counterparty {
            let session_id = SessionId::generate();
            let mut protocol = AuthenticationProtocolInitiator::new(
                session_id.clone(),
                key.clone(),
                offered.clone(),
                self.config.max_message_size,
            )?;
            let hello = protocol.generate_initiator_hello()?;
            let link_out = self.converter.link_out(
                &key.our_id,
                &key.counterparty_id,
                LinkPayload::InitiatorHello(hello),
            )?;
            messages.push((session_id, link_out));
            protocols.push(protocol);
        }

        let session_ids: Vec<SessionId> = messages.iter().map(|(id, _)| id.clone()).collect();
        let primary = session_ids
            .first()
            .cloned()
            .ok_or_else(|| LinkError::config_error("sessions_per_counterparty must be at least 1"))?;

        for protocol in protocols {
            self.pending_outbound.insert(
                protocol.session_id().clone(),
                PendingOutbound {
                    protocol,
                    our_key: resolved.our.session_public_key,
                    peer_key: resolved.peer.session_public_key,
                },
            );
        }
        if !self.queue.queue_message(message.clone(), key) {
            debug!(counterparties = %key, "new negotiation joined messages already queued");
        }

        info!(counterparties = %key, sessions = session_ids.len(), "starting session negotiation");
        Ok((
            OutboundState::Pending {
                primary,
                session_ids,
                failed: 0,
                started_at: now,
            },
            messages,
        ))
    }

    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    /// Feed a handshake message through its negotiation
    ///
    /// Returns the reply to send, or `None` when there is nothing to send:
    /// the handshake finished, the message was stale, or it was rejected.
    /// Rejections are logged, never returned.
    pub fn process_session_message(&self, message: &LinkInMessage) -> Option<LinkOutMessage> {
        match &message.payload {
            LinkPayload::InitiatorHello(hello) => self.process_initiator_hello(hello),
            LinkPayload::ResponderHello(hello) => self.process_responder_hello(hello),
            LinkPayload::InitiatorHandshake(handshake) => self.process_initiator_handshake(handshake),
            LinkPayload::ResponderHandshake(handshake) => {
                self.process_responder_handshake(handshake);
                None
            }
            LinkPayload::AuthenticatedData(_) | LinkPayload::Unauthenticated(_) => {
                warn!("session manager received a data message, dropping");
                None
            }
        }
    }

    fn process_initiator_hello(&self, hello: &InitiatorHelloMessage) -> Option<LinkOutMessage> {
        let session_id = &hello.session_id;
        if let Some(pending) = self.pending_inbound.get(session_id) {
            if pending.protocol.step() == HandshakeStep::HelloSent {
                debug!(%session_id, "duplicate initiator hello, resending responder hello");
                return Some(pending.hello_reply.clone());
            }
            warn!(%session_id, "stale initiator hello, dropping");
            return None;
        }
        if self.sessions.contains_key(session_id) {
            debug!(%session_id, "initiator hello for an established session, dropping");
            return None;
        }

        if !self.hosting.is_hosted_locally(&hello.destination) {
            warn!(%session_id, destination = %hello.destination, "initiator hello for an identity not hosted here, dropping");
            return None;
        }

        let now = self.time_source.now();
        let counterparties = CounterpartyKey::new(hello.destination.clone(), hello.source.clone());
        let pending = self
            .resolve_counterparties(&counterparties)
            .and_then(|resolved| {
                let mut protocol = AuthenticationProtocolResponder::new(
                    session_id.clone(),
                    resolved.our_modes,
                    self.config.max_message_size,
                )?;
                protocol.receive_initiator_hello(hello)?;
                let reply = protocol.generate_responder_hello()?;
                let hello_reply = self.converter.link_out(
                    &counterparties.our_id,
                    &counterparties.counterparty_id,
                    LinkPayload::ResponderHello(reply),
                )?;
                Ok(PendingInbound {
                    protocol,
                    counterparties: counterparties.clone(),
                    our_key: resolved.our.session_public_key,
                    peer_key: resolved.peer.session_public_key,
                    hello_reply,
                    started_at: now,
                })
            });

        let pending = match pending {
            Ok(pending) => pending,
            Err(error) => {
                warn!(%session_id, %counterparties, %error, "rejecting initiator hello");
                return None;
            }
        };

        match self.pending_inbound.entry(session_id.clone()) {
            Entry::Vacant(slot) => {
                let reply = pending.hello_reply.clone();
                slot.insert(pending);
                debug!(%session_id, %counterparties, "answering session negotiation");
                Some(reply)
            }
            Entry::Occupied(_) => {
                debug!(%session_id, "initiator hello raced a duplicate, dropping");
                None
            }
        }
    }

    fn process_responder_hello(&self, hello: &ResponderHelloMessage) -> Option<LinkOutMessage> {
        let session_id = &hello.session_id;
        let (stepped, key, our_key) = match self.pending_outbound.get_mut(session_id) {
            Some(mut pending) => {
                let pending = pending.value_mut();
                let stepped = pending
                    .protocol
                    .receive_responder_hello(hello)
                    .and_then(|()| pending.protocol.generate_our_handshake_message());
                (stepped, pending.protocol.counterparties().clone(), pending.our_key)
            }
            None => {
                warn!(%session_id, "responder hello for unknown session, dropping");
                return None;
            }
        };

        let unsigned = match stepped {
            Ok(unsigned) => unsigned,
            Err(error) if error.is_stale_handshake() => {
                warn!(%session_id, %error, "stale responder hello, dropping");
                return None;
            }
            Err(error) if error.is_malformed_handshake() => {
                warn!(%session_id, %error, "malformed responder hello, dropping");
                return None;
            }
            Err(error) => {
                self.abandon_outbound(session_id, &key, error);
                return None;
            }
        };

        let result = self
            .sign_handshake(&key.our_id, &our_key, unsigned.signing_payload())
            .map(|signature| unsigned.with_signature(signature))
            .and_then(|handshake| {
                self.converter.link_out(
                    &key.our_id,
                    &key.counterparty_id,
                    LinkPayload::InitiatorHandshake(handshake),
                )
            });
        match result {
            Ok(link_out) => Some(link_out),
            Err(error) => {
                self.abandon_outbound(session_id, &key, error);
                None
            }
        }
    }

    /// Our identity signature over a handshake transcript
    ///
    /// Callers release every map guard first; the oracle may be slow.
    fn sign_handshake(
        &self,
        our_id: &HoldingIdentity,
        our_key: &[u8; 32],
        payload: &[u8],
    ) -> LinkResult<Vec<u8>> {
        self.signer
            .sign(&our_id.short_hash(), our_key, SignatureSpec::Ed25519, payload)
    }

    fn process_initiator_handshake(
        &self,
        handshake: &InitiatorHandshakeMessage,
    ) -> Option<LinkOutMessage> {
        let session_id = &handshake.session_id;
        let stepped = match self.pending_inbound.get_mut(session_id) {
            Some(mut pending) => {
                let pending = pending.value_mut();
                let peer_key = pending.peer_key;
                pending
                    .protocol
                    .validate_peer_handshake_message(handshake, &peer_key)
                    .and_then(|()| pending.protocol.generate_our_handshake_message())
                    .map(|unsigned| (unsigned, pending.counterparties.our_id.clone(), pending.our_key))
            }
            None => {
                if self.sessions.contains_key(session_id) {
                    debug!(%session_id, "initiator handshake for an established session, dropping");
                } else {
                    warn!(%session_id, "initiator handshake for unknown session, dropping");
                }
                return None;
            }
        };

        let (unsigned, our_id, our_key) = match stepped {
            Ok(stepped) => stepped,
            Err(error) if error.is_stale_handshake() => {
                warn!(%session_id, %error, "stale initiator handshake, dropping");
                return None;
            }
            Err(error) if error.is_malformed_handshake() => {
                warn!(%session_id, %error, "malformed initiator handshake, dropping");
                return None;
            }
            Err(error) => {
                self.pending_inbound.remove(session_id);
                warn!(%session_id, %error, "session negotiation rejected");
                return None;
            }
        };

        let reply = match self.sign_handshake(&our_id, &our_key, unsigned.signing_payload()) {
            Ok(signature) => unsigned.with_signature(signature),
            Err(error) => {
                self.pending_inbound.remove(session_id);
                warn!(%session_id, %error, "could not sign responder handshake");
                return None;
            }
        };

        let (_, pending) = self.pending_inbound.remove(session_id)?;
        let counterparties = pending.counterparties;
        let session: Arc<dyn Session> = match pending.protocol.into_session() {
            Ok(session) => Arc::new(session),
            Err(error) => {
                warn!(%session_id, %error, "could not complete inbound session");
                return None;
            }
        };

        let now = self.time_source.now();
        self.sessions.insert(
            session_id.clone(),
            Arc::new(SessionEntry::new(
                session,
                counterparties.clone(),
                SessionDirection::Inbound,
                now,
            )),
        );
        info!(%session_id, %counterparties, "inbound session established");

        match self.converter.link_out(
            &counterparties.our_id,
            &counterparties.counterparty_id,
            LinkPayload::ResponderHandshake(reply),
        ) {
            Ok(link_out) => Some(link_out),
            Err(error) => {
                warn!(%session_id, %error, "could not address responder handshake");
                None
            }
        }
    }

    fn process_responder_handshake(&self, handshake: &ResponderHandshakeMessage) {
        let session_id = &handshake.session_id;
        let (result, key) = match self.pending_outbound.get_mut(session_id) {
            Some(mut pending) => {
                let pending = pending.value_mut();
                let result = pending
                    .protocol
                    .validate_peer_handshake_message(handshake, &pending.peer_key);
                (result, pending.protocol.counterparties().clone())
            }
            None => {
                if self.sessions.contains_key(session_id) {
                    debug!(%session_id, "duplicate responder handshake, dropping");
                } else {
                    warn!(%session_id, "responder handshake for unknown session, dropping");
                }
                return;
            }
        };

        match result {
            Ok(()) => {
                if let Some((_, pending)) = self.pending_outbound.remove(session_id) {
                    match pending.protocol.into_session() {
                        Ok(session) => self.complete_outbound(key, Arc::new(session)),
                        Err(error) => self.fail_outbound(&key, session_id, error),
                    }
                }
            }
            Err(error) if error.is_droppable_handshake() => {
                warn!(%session_id, %error, "unusable responder handshake, dropping");
            }
            Err(error) => self.abandon_outbound(session_id, &key, error),
        }
    }

    /// Register a completed outbound session, flushing the queue on the first one
    fn complete_outbound(&self, key: CounterpartyKey, session: Arc<dyn Session>) {
        let session_id = session.session_id().clone();
        let now = self.time_source.now();
        let entry = Arc::new(SessionEntry::new(
            session.clone(),
            key.clone(),
            SessionDirection::Outbound,
            now,
        ));

        let first = match self.outbound.entry(key.clone()) {
            Entry::Occupied(mut state) => match state.get_mut() {
                OutboundState::Pending { session_ids, .. } if session_ids.contains(&session_id) => {
                    self.sessions.insert(session_id.clone(), entry.clone());
                    state.insert(OutboundState::Established {
                        sessions: vec![entry],
                    });
                    true
                }
                OutboundState::Established { sessions } => {
                    self.sessions.insert(session_id.clone(), entry.clone());
                    sessions.push(entry);
                    false
                }
                _ => {
                    debug!(%session_id, counterparties = %key, "negotiation ended before session completed, discarding");
                    return;
                }
            },
            Entry::Vacant(_) => {
                debug!(%session_id, counterparties = %key, "counterparty invalidated before session completed, discarding");
                return;
            }
        };

        if !first {
            debug!(%session_id, counterparties = %key, "additional session established");
            return;
        }

        info!(%session_id, counterparties = %key, mode = ?session.mode(), "outbound session established");
        match self.queue.session_negotiated_callback(&key, session.as_ref()) {
            Ok(flushed) if flushed > 0 => self.data_message_sent(session.as_ref()),
            Ok(_) => {}
            Err(error) => {
                warn!(%session_id, counterparties = %key, %error, "could not publish queued messages")
            }
        }
    }

    /// Drop a failed outbound handshake and fail its negotiation
    fn abandon_outbound(&self, session_id: &SessionId, key: &CounterpartyKey, error: LinkError) {
        self.pending_outbound.remove(session_id);
        self.fail_outbound(key, session_id, error);
    }

    /// Count a handshake as failed; the negotiation fails once all of its handshakes have
    fn fail_outbound(&self, key: &CounterpartyKey, session_id: &SessionId, error: LinkError) {
        warn!(%session_id, counterparties = %key, %error, "session negotiation failed");
        let now = self.time_source.now();

        let discarded = match self.outbound.entry(key.clone()) {
            Entry::Occupied(mut state) => match state.get_mut() {
                OutboundState::Pending {
                    session_ids,
                    failed,
                    ..
                } if session_ids.contains(session_id) => {
                    *failed += 1;
                    if *failed >= session_ids.len() {
                        state.insert(OutboundState::Failed {
                            reason: error.to_string(),
                            at: now,
                        });
                        Some(self.queue.discard(key))
                    } else {
                        None
                    }
                }
                _ => None,
            },
            Entry::Vacant(_) => None,
        };

        if let Some(messages) = discarded {
            warn!(counterparties = %key, discarded = messages.len(), "discarding messages queued for failed negotiation");
            self.queue.publish_discarded(messages);
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Session a data message was sealed under, if this node knows it
    pub fn get_inbound_session(&self, session_id: &SessionId) -> Option<InboundSession> {
        let entry = self.sessions.get(session_id)?;
        entry
            .last_received
            .store(self.time_source.now().as_millis(), Ordering::Relaxed);
        Some(InboundSession {
            session: entry.session.clone(),
            counterparties: entry.counterparties.clone(),
            direction: entry.direction,
        })
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Fail negotiations whose handshake outlived the handshake timeout
    ///
    /// Returns how many counterparties were moved to `Failed`. Handshakes
    /// this node was answering are dropped as well.
    pub fn expire_stale_handshakes(&self) -> usize {
        let now = self.time_source.now();
        let timeout = self.config.session_timeouts.handshake_timeout;

        let stale: Vec<CounterpartyKey> = self
            .outbound
            .iter()
            .filter_map(|entry| match entry.value() {
                OutboundState::Pending { started_at, .. } if now.since(*started_at) > timeout => {
                    Some(entry.key().clone())
                }
                _ => None,
            })
            .collect();

        let mut expired = 0;
        for key in stale {
            let discarded = match self.outbound.entry(key.clone()) {
                Entry::Occupied(mut state) => match state.get() {
                    OutboundState::Pending {
                        session_ids,
                        started_at,
                        ..
                    } if now.since(*started_at) > timeout => {
                        for session_id in session_ids {
                            self.pending_outbound.remove(session_id);
                        }
                        state.insert(OutboundState::Failed {
                            reason: "handshake timed out".to_string(),
                            at: now,
                        });
                        Some(self.queue.discard(&key))
                    }
                    _ => None,
                },
                Entry::Vacant(_) => None,
            };

            if let Some(messages) = discarded {
                expired += 1;
                warn!(counterparties = %key, discarded = messages.len(), "session negotiation timed out");
                self.queue.publish_discarded(messages);
            }
        }

        let before = self.pending_inbound.len();
        self.pending_inbound
            .retain(|_, pending| now.since(pending.started_at) <= timeout);
        let dropped = before.saturating_sub(self.pending_inbound.len());
        if dropped > 0 {
            debug!(dropped, "dropped timed out inbound handshakes");
        }

        expired
    }

    /// Tear down every session the renewal policy selects
    ///
    /// A counterparty whose last outbound session is torn down returns to
    /// `Absent`, so its next message starts a new negotiation.
    pub fn renew_sessions(&self) -> usize {
        let now = self.time_source.now();
        let expiring: Vec<(SessionId, CounterpartyKey, SessionDirection)> = self
            .sessions
            .iter()
            .filter(|entry| self.renewal.should_renew(&entry.activity(), now))
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.counterparties.clone(),
                    entry.direction,
                )
            })
            .collect();

        for (session_id, key, direction) in &expiring {
            if *direction == SessionDirection::Outbound {
                if let Entry::Occupied(mut state) = self.outbound.entry(key.clone()) {
                    let now_empty = match state.get_mut() {
                        OutboundState::Established { sessions } => {
                            sessions.retain(|entry| entry.session.session_id() != session_id);
                            sessions.is_empty()
                        }
                        _ => false,
                    };
                    if now_empty {
                        state.remove();
                    }
                }
            }
            self.sessions.remove(session_id);
            info!(%session_id, counterparties = %key, ?direction, "session torn down for renewal");
        }

        expiring.len()
    }

    /// Forget everything about a counterparty
    ///
    /// Established sessions in both directions are torn down. A negotiation
    /// in flight is abandoned and its queued messages are discarded.
    pub fn invalidate(&self, key: &CounterpartyKey) -> bool {
        let mut discarded = Vec::new();
        let removed = match self.outbound.entry(key.clone()) {
            Entry::Occupied(state) => {
                match state.remove() {
                    OutboundState::Established { sessions } => {
                        for entry in sessions {
                            self.sessions.remove(entry.session.session_id());
                        }
                    }
                    OutboundState::Pending { .. } => discarded = self.queue.discard(key),
                    OutboundState::Failed { .. } => {}
                }
                self.pending_outbound
                    .retain(|_, pending| pending.protocol.counterparties() != key);
                true
            }
            Entry::Vacant(_) => false,
        };

        let before = self.sessions.len();
        self.sessions.retain(|_, entry| entry.counterparties != *key);
        let inbound_removed = before.saturating_sub(self.sessions.len());

        if !discarded.is_empty() {
            self.queue.publish_discarded(discarded);
        }
        if removed || inbound_removed > 0 {
            info!(counterparties = %key, "counterparty invalidated");
        }
        removed || inbound_removed > 0
    }

    // ------------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------------

    /// Coarse state of a counterparty
    pub fn counterparty_status(&self, key: &CounterpartyKey) -> CounterpartyStatus {
        match self.outbound.get(key).as_deref() {
            None => CounterpartyStatus::Absent,
            Some(OutboundState::Pending { .. }) => CounterpartyStatus::Pending,
            Some(OutboundState::Established { .. }) => CounterpartyStatus::Established,
            Some(OutboundState::Failed { .. }) => CounterpartyStatus::Failed,
        }
    }

    /// Why the last negotiation with a counterparty failed, and when
    pub fn failure_reason(&self, key: &CounterpartyKey) -> Option<(String, Timestamp)> {
        match self.outbound.get(key).as_deref() {
            Some(OutboundState::Failed { reason, at }) => Some((reason.clone(), *at)),
            _ => None,
        }
    }

    /// Get count of counterparties in each state
    pub fn session_counts(&self) -> SessionCounts {
        let mut counts = SessionCounts {
            inbound_handshakes: self.pending_inbound.len(),
            sessions: self.sessions.len(),
            ..SessionCounts::default()
        };
        for entry in self.outbound.iter() {
            match entry.value() {
                OutboundState::Pending { .. } => counts.pending += 1,
                OutboundState::Established { .. } => counts.established += 1,
                OutboundState::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }
}
