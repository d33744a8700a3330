//! Link manager configuration
//!
//! Consolidates the tunables of the session layer into one serde-friendly
//! structure with presets for tests and hardened deployments.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::session::{ProtocolMode, TAG_LEN};
use crate::{LinkError, Result};

/// Largest plaintext a single Noise frame can carry
pub const MAX_SUPPORTED_MESSAGE_SIZE: u32 = 65_535 - TAG_LEN as u32;

// ----------------------------------------------------------------------------
// Session Timeouts
// ----------------------------------------------------------------------------

/// Session timeout configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTimeouts {
    /// Maximum time for handshake completion
    pub handshake_timeout: Duration,
    /// Maximum idle time before a session is renewed
    pub idle_timeout: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

// ----------------------------------------------------------------------------
// Renewal
// ----------------------------------------------------------------------------

/// Built-in session renewal policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenewalPolicyKind {
    /// Established sessions live until invalidated
    Never,
    /// Sessions idle for longer than `SessionTimeouts::idle_timeout` are renewed
    IdleTimeout,
}

// ----------------------------------------------------------------------------
// Link Manager Configuration
// ----------------------------------------------------------------------------

/// Configuration of the session layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkManagerConfig {
    /// Largest payload this node accepts on a session
    pub max_message_size: u32,
    /// Protocol modes this node is willing to negotiate
    pub protocol_modes: Vec<ProtocolMode>,
    /// Handshakes started per negotiation with a counterparty
    pub sessions_per_counterparty: usize,
    pub session_timeouts: SessionTimeouts,
    pub renewal: RenewalPolicyKind,
}

impl Default for LinkManagerConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_SUPPORTED_MESSAGE_SIZE,
            protocol_modes: vec![
                ProtocolMode::AuthenticatedEncryption,
                ProtocolMode::Authentication,
            ],
            sessions_per_counterparty: 1,
            session_timeouts: SessionTimeouts::default(),
            renewal: RenewalPolicyKind::Never,
        }
    }
}

impl LinkManagerConfig {
    /// Create configuration optimized for testing
    pub fn for_testing() -> Self {
        Self {
            max_message_size: 16_384,
            session_timeouts: SessionTimeouts {
                handshake_timeout: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(60),
            },
            ..Self::default()
        }
    }

    /// Encryption only, short-lived sessions
    pub fn strict() -> Self {
        Self {
            protocol_modes: vec![ProtocolMode::AuthenticatedEncryption],
            session_timeouts: SessionTimeouts {
                handshake_timeout: Duration::from_secs(10),
                idle_timeout: Duration::from_secs(60),
            },
            renewal: RenewalPolicyKind::IdleTimeout,
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| LinkError::config_error(format!("invalid link manager config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 || self.max_message_size > MAX_SUPPORTED_MESSAGE_SIZE {
            return Err(LinkError::config_error(format!(
                "max_message_size must be between 1 and {}",
                MAX_SUPPORTED_MESSAGE_SIZE
            )));
        }
        if self.protocol_modes.is_empty() {
            return Err(LinkError::config_error("protocol_modes must not be empty"));
        }
        if self.sessions_per_counterparty == 0 {
            return Err(LinkError::config_error(
                "sessions_per_counterparty must be at least 1",
            ));
        }
        if self.session_timeouts.handshake_timeout.is_zero() {
            return Err(LinkError::config_error("handshake_timeout must be positive"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
