//! Interfaces of the services the link layer depends on
//!
//! The membership directory, group policy store, key store, hosting map and
//! message bus all live outside this crate. The runtime only ever talks to
//! them through these traits.

use std::fmt;
use std::sync::Arc;

use p2p_link_core::{
    GroupPolicy, HoldingIdentity, LinkResult, MemberInfo, Record, SignatureSpec,
};

/// Looks members up in the membership directory
pub trait MembershipLookup: Send + Sync {
    fn resolve_member(&self, identity: &HoldingIdentity) -> Option<MemberInfo>;
}

/// Looks group-wide policy up
pub trait GroupPolicyProvider: Send + Sync {
    fn resolve_group_policy(&self, group_id: &str) -> Option<GroupPolicy>;
}

/// Signs with keys held by the key store
///
/// May block; the session manager never calls it while holding handshake
/// state locked.
pub trait SigningOracle: Send + Sync {
    fn sign(
        &self,
        tenant_id: &str,
        public_key: &[u8; 32],
        spec: SignatureSpec,
        data: &[u8],
    ) -> LinkResult<Vec<u8>>;
}

/// Knows which identities this node hosts
pub trait HostingMap: Send + Sync {
    fn is_hosted_locally(&self, identity: &HoldingIdentity) -> bool;
}

/// Publishes records to the message bus, returning once they are acknowledged
pub trait RecordPublisher: Send + Sync {
    fn publish(&self, records: Vec<Record>) -> LinkResult<()>;
}

/// Handles to every collaborator, shared by the managers and processors
#[derive(Clone)]
pub struct LinkCollaborators {
    pub members: Arc<dyn MembershipLookup>,
    pub policies: Arc<dyn GroupPolicyProvider>,
    pub signer: Arc<dyn SigningOracle>,
    pub hosting: Arc<dyn HostingMap>,
    pub publisher: Arc<dyn RecordPublisher>,
}

impl fmt::Debug for LinkCollaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkCollaborators").finish_non_exhaustive()
    }
}
