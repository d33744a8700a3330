//! Stateful managers of the link layer
//!
//! This module contains the structs that hold shared, concurrently accessed
//! state: partition ownership, messages waiting for sessions, and the
//! sessions themselves.

pub mod partitions;
pub mod pending_queue;
pub mod renewal;
pub mod session;

pub use partitions::PartitionAssignmentTracker;
pub use pending_queue::PendingSessionQueue;
pub use renewal::{IdleTimeout, NeverRenew, SessionActivity, SessionRenewalPolicy};
pub use session::{
    CounterpartyStatus, InboundSession, NewSessions, SessionCounts, SessionDirection,
    SessionManager, SessionState,
};
