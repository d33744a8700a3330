//! Message bus records and wire messages
//!
//! The link layer consumes and produces typed records on named topics. This
//! module defines the topics, the record envelope, the application messages
//! carried on the `p2p.*` topics and the wire messages exchanged with the
//! gateway on the `link.*` topics.

use serde::{Deserialize, Serialize};

use crate::markers::AppMessageMarker;
use crate::membership::NetworkType;
use crate::session::{ProtocolMode, SealedPayload};
use crate::types::{HoldingIdentity, MessageId, SessionId, Timestamp};
use crate::{LinkError, Result};

// ----------------------------------------------------------------------------
// Topics
// ----------------------------------------------------------------------------

/// Outbound application messages
pub const P2P_OUT_TOPIC: &str = "p2p.out";
/// Inbound application messages
pub const P2P_IN_TOPIC: &str = "p2p.in";
/// Delivery markers for the replay tracker
pub const P2P_OUT_MARKERS_TOPIC: &str = "p2p.out.markers";
/// Wire messages towards the gateway
pub const LINK_OUT_TOPIC: &str = "link.out";
/// Wire messages from the gateway
pub const LINK_IN_TOPIC: &str = "link.in";
/// Which `link.in` partitions replies for a session must be routed to
pub const SESSION_OUT_PARTITIONS_TOPIC: &str = "session.out.partitions";

// ----------------------------------------------------------------------------
// Record Envelope
// ----------------------------------------------------------------------------

/// One keyed record on a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub key: String,
    pub value: RecordValue,
}

impl Record {
    pub fn new<T: Into<String>, K: Into<String>>(topic: T, key: K, value: RecordValue) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            value,
        }
    }
}

/// Typed payload of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordValue {
    AppMessage(AppMessage),
    LinkOut(LinkOutMessage),
    LinkIn(LinkInMessage),
    Marker(AppMessageMarker),
    SessionPartitions(SessionPartitions),
}

// ----------------------------------------------------------------------------
// Application Messages
// ----------------------------------------------------------------------------

/// Header of a message that must travel over an authenticated session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedMessageHeader {
    pub destination: HoldingIdentity,
    pub source: HoldingIdentity,
    /// Absolute instant after which the message must not be transmitted
    pub ttl: Option<Timestamp>,
    pub message_id: MessageId,
    pub trace_id: Option<String>,
    pub subsystem: String,
    /// Set when the sender does not want a delivery acknowledgement
    pub suppress_ack: bool,
}

/// Application message delivered over an authenticated session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedMessage {
    pub header: AuthenticatedMessageHeader,
    pub payload: Vec<u8>,
}

impl AuthenticatedMessage {
    pub fn message_id(&self) -> &MessageId {
        &self.header.message_id
    }

    /// Whether the TTL has elapsed at `now`
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.header.ttl.map_or(false, |ttl| now > ttl)
    }
}

/// Header of a message sent without a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnauthenticatedMessageHeader {
    pub destination: HoldingIdentity,
    pub source: HoldingIdentity,
    pub message_id: MessageId,
    pub subsystem: String,
}

/// Application message sent without a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnauthenticatedMessage {
    pub header: UnauthenticatedMessageHeader,
    pub payload: Vec<u8>,
}

/// Application message on the `p2p.*` topics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppMessage {
    Authenticated(AuthenticatedMessage),
    Unauthenticated(UnauthenticatedMessage),
}

impl AppMessage {
    pub fn source(&self) -> &HoldingIdentity {
        match self {
            AppMessage::Authenticated(message) => &message.header.source,
            AppMessage::Unauthenticated(message) => &message.header.source,
        }
    }

    pub fn destination(&self) -> &HoldingIdentity {
        match self {
            AppMessage::Authenticated(message) => &message.header.destination,
            AppMessage::Unauthenticated(message) => &message.header.destination,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            AppMessage::Authenticated(message) => &message.header.message_id,
            AppMessage::Unauthenticated(message) => &message.header.message_id,
        }
    }

    /// Wrap into a record for local delivery on `p2p.in`
    pub fn into_inbound_record(self) -> Record {
        let key = self.message_id().to_string();
        Record::new(P2P_IN_TOPIC, key, RecordValue::AppMessage(self))
    }
}

// ----------------------------------------------------------------------------
// Data Plane Payloads
// ----------------------------------------------------------------------------

/// Acknowledgement that an authenticated message reached its destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    pub message_id: MessageId,
}

/// Plaintext sealed inside an `AuthenticatedDataMessage`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataMessagePayload {
    Data(AuthenticatedMessage),
    Ack(MessageAck),
}

impl DataMessagePayload {
    /// Serialize to binary format for sealing
    pub fn to_binary(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(LinkError::from)
    }

    /// Deserialize from an opened payload
    pub fn from_binary(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(LinkError::from)
    }
}

/// Data-plane message sealed under a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedDataMessage {
    pub session_id: SessionId,
    pub sealed: SealedPayload,
}

// ----------------------------------------------------------------------------
// Handshake Messages
// ----------------------------------------------------------------------------

/// Step 1: initiator opens the Noise handshake and offers protocol modes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatorHelloMessage {
    pub session_id: SessionId,
    pub source: HoldingIdentity,
    pub destination: HoldingIdentity,
    pub protocol_modes: Vec<ProtocolMode>,
    pub max_message_size: u32,
    pub noise: Vec<u8>,
}

/// Step 2: responder answers with the selected mode and agreed size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderHelloMessage {
    pub session_id: SessionId,
    pub selected_mode: ProtocolMode,
    pub max_message_size: u32,
    pub noise: Vec<u8>,
}

/// Step 3: initiator finishes Noise and proves its identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatorHandshakeMessage {
    pub session_id: SessionId,
    pub noise: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Step 4: responder proves its identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderHandshakeMessage {
    pub session_id: SessionId,
    pub signature: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Link Messages
// ----------------------------------------------------------------------------

/// Payload of a wire message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkPayload {
    InitiatorHello(InitiatorHelloMessage),
    ResponderHello(ResponderHelloMessage),
    InitiatorHandshake(InitiatorHandshakeMessage),
    ResponderHandshake(ResponderHandshakeMessage),
    AuthenticatedData(AuthenticatedDataMessage),
    Unauthenticated(UnauthenticatedMessage),
}

impl LinkPayload {
    /// Session the payload belongs to, if any
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            LinkPayload::InitiatorHello(message) => Some(&message.session_id),
            LinkPayload::ResponderHello(message) => Some(&message.session_id),
            LinkPayload::InitiatorHandshake(message) => Some(&message.session_id),
            LinkPayload::ResponderHandshake(message) => Some(&message.session_id),
            LinkPayload::AuthenticatedData(message) => Some(&message.session_id),
            LinkPayload::Unauthenticated(_) => None,
        }
    }

    /// Whether this is one of the four handshake steps
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            LinkPayload::InitiatorHello(_)
                | LinkPayload::ResponderHello(_)
                | LinkPayload::InitiatorHandshake(_)
                | LinkPayload::ResponderHandshake(_)
        )
    }
}

/// Routing header the gateway uses to deliver a wire message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOutHeader {
    pub source: HoldingIdentity,
    pub destination: HoldingIdentity,
    pub network_type: NetworkType,
    pub endpoint: String,
}

/// Wire message handed to the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOutMessage {
    pub header: LinkOutHeader,
    pub payload: LinkPayload,
}

impl LinkOutMessage {
    /// Key used when publishing: the session id, or the destination for unauthenticated traffic
    pub fn record_key(&self) -> String {
        match self.payload.session_id() {
            Some(session_id) => session_id.to_string(),
            None => self.header.destination.to_string(),
        }
    }

    /// Wrap into a record on `link.out`
    pub fn into_record(self) -> Record {
        let key = self.record_key();
        Record::new(LINK_OUT_TOPIC, key, RecordValue::LinkOut(self))
    }

    /// What the receiving gateway hands to the peer's link layer
    pub fn into_link_in(self) -> LinkInMessage {
        LinkInMessage {
            payload: self.payload,
        }
    }
}

/// Wire message received from the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInMessage {
    pub payload: LinkPayload,
}

/// Partitions of `link.in` owned by the instance that started a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPartitions {
    pub session_id: SessionId,
    pub partitions: Vec<u32>,
}

impl SessionPartitions {
    pub fn into_record(self) -> Record {
        Record::new(
            SESSION_OUT_PARTITIONS_TOPIC,
            self.session_id.to_string(),
            RecordValue::SessionPartitions(self),
        )
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
