//! Directory and group policy views consumed by the link layer
//!
//! The membership directory and the group policy store live outside this
//! crate; these are the shapes of the answers they give.

use serde::{Deserialize, Serialize};

use crate::session::ProtocolMode;
use crate::types::HoldingIdentity;

/// Wire-format family a group's gateways speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    Standard,
    Legacy,
}

/// How members' session keys are anchored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PkiMode {
    /// Session keys published in the directory are trusted as-is
    NoPki,
    /// Session keys must be endorsed by one of the group's trust roots
    Standard,
}

/// A member as resolved from the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub holding_identity: HoldingIdentity,
    /// Ed25519 public key the member signs handshakes with
    pub session_public_key: [u8; 32],
    /// Trust-root signature over `session_public_key`
    pub session_key_endorsement: Option<Vec<u8>>,
    /// Gateway address the member is reachable at
    pub endpoint: String,
    /// Protocol modes the member accepts
    pub protocol_modes: Vec<ProtocolMode>,
}

/// Group-wide policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPolicy {
    pub group_id: String,
    pub network_type: NetworkType,
    /// Ed25519 public keys allowed to endorse members' session keys
    pub trust_roots: Vec<[u8; 32]>,
    pub pki_mode: PkiMode,
}
