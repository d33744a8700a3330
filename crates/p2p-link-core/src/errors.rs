//! Error types for the p2p link layer
//!
//! This module contains all error types used by the link layer core,
//! including cryptographic errors, handshake errors, session errors and the
//! main LinkError type that unifies them all.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Specific cryptographic error types
#[derive(Debug, thiserror::Error)]
pub enum CryptographicError {
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key format")]
    InvalidKeyFormat,
    #[error("Session key is not endorsed by any trust root of group {group_id}")]
    UntrustedSessionKey { group_id: String },
    #[error("Group {group_id} has no trust roots configured")]
    MissingTrustRoots { group_id: String },
}

/// Specific handshake error types
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Handshake {session_id} received a message out of order: expected step {expected}, was at {actual}")]
    UnexpectedStep {
        session_id: String,
        expected: String,
        actual: String,
    },
    #[error("No protocol mode in common: offered {offered}, supported {supported}")]
    NoCommonProtocolMode { offered: String, supported: String },
    #[error("Peer selected protocol mode {mode} which was never offered")]
    UnsupportedProtocolMode { mode: String },
    #[error("Peer proposed an invalid maximum message size {size}")]
    InvalidMessageSize { size: u32 },
    #[error("Noise handshake did not finish after the final message")]
    Incomplete,
}

impl HandshakeError {
    /// Whether the error only means the message arrived late or twice.
    ///
    /// Stale messages are dropped without touching the negotiation; every
    /// other handshake error ends it.
    pub fn is_stale(&self) -> bool {
        matches!(self, HandshakeError::UnexpectedStep { .. })
    }
}

/// Specific session error types
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Payload of {size} bytes exceeds the session maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: u32 },
    #[error("Authenticated payload on session {session_id} carries no tag")]
    MissingTag { session_id: String },
    #[error("Message on session {session_id} does not belong to its counterparties")]
    CounterpartyMismatch { session_id: String },
}

/// Core error types for the link layer
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptographicError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    /// Directory or group policy lookup returned nothing
    #[error("Could not resolve {what}")]
    Resolution { what: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// The message bus refused a batch
    #[error("Publish failed: {reason}")]
    Publish { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl LinkError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        LinkError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a resolution error naming what could not be found
    pub fn unresolved<T: Into<String>>(what: T) -> Self {
        LinkError::Resolution { what: what.into() }
    }

    /// Create a publish error with a reason
    pub fn publish_failed<T: Into<String>>(reason: T) -> Self {
        LinkError::Publish {
            reason: reason.into(),
        }
    }

    /// Create a signature verification error
    pub fn signature_error() -> Self {
        LinkError::Crypto(CryptographicError::SignatureVerificationFailed)
    }

    /// Create an out-of-order handshake step error
    pub fn unexpected_step<S: Into<String>, E: Into<String>, A: Into<String>>(
        session_id: S,
        expected: E,
        actual: A,
    ) -> Self {
        LinkError::Handshake(HandshakeError::UnexpectedStep {
            session_id: session_id.into(),
            expected: expected.into(),
            actual: actual.into(),
        })
    }

    /// Whether this error only reports a late or duplicated handshake message
    pub fn is_stale_handshake(&self) -> bool {
        matches!(self, LinkError::Handshake(error) if error.is_stale())
    }

    /// Whether a handshake message was rejected for its bytes alone.
    ///
    /// Noise restores its state when a read fails, so a garbled or truncated
    /// frame leaves the negotiation able to accept the genuine one.
    pub fn is_malformed_handshake(&self) -> bool {
        matches!(
            self,
            LinkError::Noise(snow::Error::Decrypt | snow::Error::Input)
                | LinkError::Serialization(_)
                | LinkError::Crypto(CryptographicError::DecryptionFailed)
        )
    }

    /// Whether a handshake message can be dropped without ending its negotiation
    pub fn is_droppable_handshake(&self) -> bool {
        self.is_stale_handshake() || self.is_malformed_handshake()
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, LinkError>;
pub type LinkResult<T> = Result<T>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
