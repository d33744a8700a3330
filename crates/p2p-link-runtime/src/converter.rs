//! Conversion between application messages and wire messages
//!
//! Every wire message needs a routing header built from the destination's
//! directory entry and its group's network type. The converter owns those
//! lookups and the sealing of data-plane payloads under a session.

use std::sync::Arc;

use tracing::warn;

use p2p_link_core::{
    AuthenticatedDataMessage, AuthenticatedMessage, DataMessagePayload, HoldingIdentity,
    LinkError, LinkOutHeader, LinkOutMessage, LinkPayload, LinkResult, MessageAck, Session,
    UnauthenticatedMessage,
};

use crate::collaborators::{GroupPolicyProvider, MembershipLookup};

/// Builds wire messages addressed through the membership directory
pub struct MessageConverter {
    members: Arc<dyn MembershipLookup>,
    policies: Arc<dyn GroupPolicyProvider>,
}

impl MessageConverter {
    pub fn new(members: Arc<dyn MembershipLookup>, policies: Arc<dyn GroupPolicyProvider>) -> Self {
        Self { members, policies }
    }

    /// Routing header for a wire message from `source` to `destination`
    pub fn link_out_header(
        &self,
        source: &HoldingIdentity,
        destination: &HoldingIdentity,
    ) -> LinkResult<LinkOutHeader> {
        let member = self
            .members
            .resolve_member(destination)
            .ok_or_else(|| LinkError::unresolved(format!("member {}", destination)))?;
        let policy = self
            .policies
            .resolve_group_policy(&destination.group_id)
            .ok_or_else(|| LinkError::unresolved(format!("group policy of {}", destination.group_id)))?;

        Ok(LinkOutHeader {
            source: source.clone(),
            destination: destination.clone(),
            network_type: policy.network_type,
            endpoint: member.endpoint,
        })
    }

    /// Address `payload` from `source` to `destination`
    pub fn link_out(
        &self,
        source: &HoldingIdentity,
        destination: &HoldingIdentity,
        payload: LinkPayload,
    ) -> LinkResult<LinkOutMessage> {
        Ok(LinkOutMessage {
            header: self.link_out_header(source, destination)?,
            payload,
        })
    }

    /// Seal a data-plane payload under `session`
    pub fn seal(session: &dyn Session, payload: &DataMessagePayload) -> LinkResult<LinkPayload> {
        let sealed = session.seal(&payload.to_binary()?)?;
        Ok(LinkPayload::AuthenticatedData(AuthenticatedDataMessage {
            session_id: session.session_id().clone(),
            sealed,
        }))
    }

    /// Seal an application message for its destination
    ///
    /// Returns `None`, after logging, when the payload exceeds the session's
    /// maximum or the destination cannot be addressed.
    pub fn authenticated_link_out(
        &self,
        message: &AuthenticatedMessage,
        session: &dyn Session,
    ) -> Option<LinkOutMessage> {
        let result = Self::seal(session, &DataMessagePayload::Data(message.clone())).and_then(
            |payload| self.link_out(&message.header.source, &message.header.destination, payload),
        );

        match result {
            Ok(link_out) => Some(link_out),
            Err(error) => {
                warn!(
                    message_id = %message.message_id(),
                    session_id = %session.session_id(),
                    %error,
                    "could not seal message, dropping it"
                );
                None
            }
        }
    }

    /// Seal an acknowledgement of `message` back to its sender
    ///
    /// Returns `None`, after logging, when the sender is no longer resolvable.
    pub fn ack_link_out(
        &self,
        message: &AuthenticatedMessage,
        session: &dyn Session,
    ) -> Option<LinkOutMessage> {
        let ack = DataMessagePayload::Ack(MessageAck {
            message_id: message.message_id().clone(),
        });
        let result = Self::seal(session, &ack).and_then(|payload| {
            self.link_out(&message.header.destination, &message.header.source, payload)
        });

        match result {
            Ok(link_out) => Some(link_out),
            Err(error) => {
                warn!(
                    message_id = %message.message_id(),
                    source = %message.header.source,
                    %error,
                    "could not acknowledge message, delivering without ack"
                );
                None
            }
        }
    }

    /// Wrap an unauthenticated message for its destination
    pub fn unauthenticated_link_out(&self, message: &UnauthenticatedMessage) -> Option<LinkOutMessage> {
        match self.link_out(
            &message.header.source,
            &message.header.destination,
            LinkPayload::Unauthenticated(message.clone()),
        ) {
            Ok(link_out) => Some(link_out),
            Err(error) => {
                warn!(
                    message_id = %message.header.message_id,
                    destination = %message.header.destination,
                    %error,
                    "dropping unauthenticated message"
                );
                None
            }
        }
    }
}
