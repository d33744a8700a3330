//! p2p Link Layer Runtime
//!
//! This crate contains the stateful engine of the link layer:
//! - `SessionManager`: the per-counterparty session state machine
//! - `PendingSessionQueue`: messages waiting for a negotiation to finish
//! - `PartitionAssignmentTracker`: which `link.in` partitions this instance owns
//! - `OutboundMessageProcessor` / `InboundMessageProcessor`: the batch stages
//!   driven by the message bus consumer
//!
//! `p2p-link-core` provides the stable type and protocol definitions; the
//! membership directory, key store and message bus are reached through the
//! traits in [`collaborators`].

pub mod builder;
pub mod collaborators;
pub mod converter;
pub mod managers;
pub mod processors;

pub use builder::{LinkManager, LinkManagerBuilder};
pub use collaborators::{
    GroupPolicyProvider, HostingMap, LinkCollaborators, MembershipLookup, RecordPublisher,
    SigningOracle,
};
pub use converter::MessageConverter;
pub use managers::*;
pub use processors::{InboundMessageProcessor, OutboundMessageProcessor};

// Re-export core types for convenience
pub use p2p_link_core::{LinkError, LinkManagerConfig, LinkResult, Session, TimeSource};
