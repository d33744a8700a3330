//! p2p Link Layer Core
//!
//! This crate provides the foundational types of the link layer that moves
//! application messages between organizations: identities and counterparty
//! keys, bus records and wire messages, delivery markers, configuration,
//! errors, and the authentication protocol that negotiates sessions.
//!
//! The stateful engine (session manager, pending-session queue, message
//! processors) lives in `p2p-link-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod crypto;
pub mod errors;
pub mod markers;
pub mod membership;
pub mod records;
pub mod session;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{LinkManagerConfig, RenewalPolicyKind, SessionTimeouts};
pub use crypto::{IdentityKeyPair, SignatureSpec};
pub use errors::{
    CryptographicError, HandshakeError, LinkError, LinkResult, Result, SessionError,
};
pub use markers::{AppMessageMarker, DeliveryMarker, MarkerKind};
pub use membership::{GroupPolicy, MemberInfo, NetworkType, PkiMode};
pub use records::{
    AppMessage, AuthenticatedDataMessage, AuthenticatedMessage, AuthenticatedMessageHeader,
    DataMessagePayload, LinkInMessage, LinkOutHeader, LinkOutMessage, LinkPayload, MessageAck,
    Record, RecordValue, SessionPartitions, UnauthenticatedMessage, UnauthenticatedMessageHeader,
};
pub use session::{
    AuthenticationProtocolInitiator, AuthenticationProtocolResponder, NoiseSession, ProtocolMode,
    SealedPayload, Session, UnsignedInitiatorHandshake, UnsignedResponderHandshake,
};
pub use types::{
    CounterpartyKey, HoldingIdentity, MessageId, SessionId, SystemTimeSource, TimeSource,
    Timestamp,
};
