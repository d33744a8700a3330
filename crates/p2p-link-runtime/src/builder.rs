//! Link manager builder
//!
//! Wires the partition tracker, pending-session queue, session manager and
//! both processors around one set of collaborators, so lifecycle code only
//! has to feed batches and rebalance callbacks into the result.

use std::sync::Arc;

use tracing::info;

use p2p_link_core::{LinkManagerConfig, LinkResult, TimeSource};

use crate::collaborators::LinkCollaborators;
use crate::converter::MessageConverter;
use crate::managers::{
    PartitionAssignmentTracker, PendingSessionQueue, SessionManager, SessionRenewalPolicy,
};
use crate::processors::{InboundMessageProcessor, OutboundMessageProcessor};

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builder for a fully wired link manager
pub struct LinkManagerBuilder {
    collaborators: LinkCollaborators,
    config: LinkManagerConfig,
    renewal: Option<Box<dyn SessionRenewalPolicy>>,
}

impl LinkManagerBuilder {
    /// Create a new builder with default configuration
    pub fn new(collaborators: LinkCollaborators) -> Self {
        Self {
            collaborators,
            config: LinkManagerConfig::default(),
            renewal: None,
        }
    }

    /// Set the link manager configuration
    pub fn with_config(mut self, config: LinkManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a renewal policy other than the one the configuration selects
    pub fn with_renewal_policy(mut self, policy: Box<dyn SessionRenewalPolicy>) -> Self {
        self.renewal = Some(policy);
        self
    }

    /// Validate the configuration and wire every component
    pub fn build<T: TimeSource + Clone>(self, time_source: T) -> LinkResult<LinkManager<T>> {
        self.config.validate()?;

        let collaborators = self.collaborators;
        let converter = Arc::new(MessageConverter::new(
            collaborators.members.clone(),
            collaborators.policies.clone(),
        ));
        let partitions = Arc::new(PartitionAssignmentTracker::new());
        let queue = Arc::new(PendingSessionQueue::new(
            converter.clone(),
            collaborators.publisher.clone(),
            time_source.clone(),
        ));

        let mut sessions = SessionManager::new(
            self.config,
            &collaborators,
            converter.clone(),
            partitions.clone(),
            queue.clone(),
            time_source.clone(),
        );
        if let Some(policy) = self.renewal {
            sessions = sessions.with_renewal_policy(policy);
        }
        let sessions = Arc::new(sessions);

        let outbound = OutboundMessageProcessor::new(
            sessions.clone(),
            collaborators.hosting.clone(),
            partitions.clone(),
            converter.clone(),
            time_source.clone(),
        );
        let inbound = InboundMessageProcessor::new(
            sessions.clone(),
            collaborators.hosting.clone(),
            converter,
            time_source,
        );

        info!(
            max_message_size = sessions.config().max_message_size,
            sessions_per_counterparty = sessions.config().sessions_per_counterparty,
            "link manager ready"
        );

        Ok(LinkManager {
            partitions,
            queue,
            sessions,
            outbound,
            inbound,
        })
    }
}

// ----------------------------------------------------------------------------
// Link Manager
// ----------------------------------------------------------------------------

/// The wired link layer of one node
pub struct LinkManager<T: TimeSource> {
    partitions: Arc<PartitionAssignmentTracker>,
    queue: Arc<PendingSessionQueue<T>>,
    sessions: Arc<SessionManager<T>>,
    outbound: OutboundMessageProcessor<T>,
    inbound: InboundMessageProcessor<T>,
}

impl<T: TimeSource> LinkManager<T> {
    /// Processor for `p2p.out`
    pub fn outbound(&self) -> &OutboundMessageProcessor<T> {
        &self.outbound
    }

    /// Processor for `link.in`
    pub fn inbound(&self) -> &InboundMessageProcessor<T> {
        &self.inbound
    }

    pub fn sessions(&self) -> &Arc<SessionManager<T>> {
        &self.sessions
    }

    pub fn queue(&self) -> &Arc<PendingSessionQueue<T>> {
        &self.queue
    }

    /// Tracker the bus consumer's rebalance callbacks must be forwarded to
    pub fn partitions(&self) -> &Arc<PartitionAssignmentTracker> {
        &self.partitions
    }
}
