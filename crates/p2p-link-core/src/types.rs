//! Core types for the p2p link layer
//!
//! This module defines the fundamental types used throughout the link layer,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::ops::{Add, Deref, Sub};
use core::time::Duration;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ----------------------------------------------------------------------------
// Holding Identity
// ----------------------------------------------------------------------------

/// An organization's identity inside one membership group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HoldingIdentity {
    /// X.500 name of the organization
    pub x500_name: String,
    /// Membership group the identity belongs to
    pub group_id: String,
}

impl HoldingIdentity {
    /// Create a new holding identity
    pub fn new<N: Into<String>, G: Into<String>>(x500_name: N, group_id: G) -> Self {
        Self {
            x500_name: x500_name.into(),
            group_id: group_id.into(),
        }
    }

    /// Short hash of the identity, used as the tenant id for key operations
    ///
    /// First 12 hex characters of SHA-256 over the length-prefixed name
    /// followed by the group id.
    pub fn short_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.x500_name.len() as u64).to_be_bytes());
        hasher.update(self.x500_name.as_bytes());
        hasher.update(self.group_id.as_bytes());
        let mut hash = hex::encode(hasher.finalize());
        hash.truncate(12);
        hash
    }
}

impl fmt::Display for HoldingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.x500_name, self.group_id)
    }
}

// ----------------------------------------------------------------------------
// Counterparty Key
// ----------------------------------------------------------------------------

/// The (our identity, peer identity) pair a session is negotiated for
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CounterpartyKey {
    pub our_id: HoldingIdentity,
    pub counterparty_id: HoldingIdentity,
}

impl CounterpartyKey {
    /// Create a new counterparty key
    pub fn new(our_id: HoldingIdentity, counterparty_id: HoldingIdentity) -> Self {
        Self {
            our_id,
            counterparty_id,
        }
    }
}

impl fmt::Display for CounterpartyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.our_id, self.counterparty_id)
    }
}

// ----------------------------------------------------------------------------
// Session Identifier
// ----------------------------------------------------------------------------

/// Identifier of one negotiated session
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for SessionId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Message Identifier
// ----------------------------------------------------------------------------

/// Application-chosen identifier of an authenticated message
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(other.as_millis() as u64))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get milliseconds since epoch
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to this instant, zero if `earlier` is later
    pub fn since(&self, earlier: Timestamp) -> Duration {
        *self - earlier
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Clock abstraction so TTL and timeout decisions can be driven by tests
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
