//! Outbound message processor
//!
//! Consumes application messages from `p2p.out` and decides the fate of
//! each one: loop it back to a co-located identity, drop it because its TTL
//! elapsed, queue it behind a negotiation, or seal it under an established
//! session. Every decision is expressed as output records.

use std::sync::Arc;

use tracing::{debug, warn};

use p2p_link_core::{
    AppMessage, AppMessageMarker, AuthenticatedMessage, Record, RecordValue, SessionPartitions,
    TimeSource, UnauthenticatedMessage,
};

use crate::collaborators::HostingMap;
use crate::converter::MessageConverter;
use crate::managers::{PartitionAssignmentTracker, SessionManager, SessionState};

/// Turns outbound application records into wire records and markers
pub struct OutboundMessageProcessor<T: TimeSource> {
    manager: Arc<SessionManager<T>>,
    hosting: Arc<dyn HostingMap>,
    partitions: Arc<PartitionAssignmentTracker>,
    converter: Arc<MessageConverter>,
    time_source: T,
}

impl<T: TimeSource> OutboundMessageProcessor<T> {
    pub fn new(
        manager: Arc<SessionManager<T>>,
        hosting: Arc<dyn HostingMap>,
        partitions: Arc<PartitionAssignmentTracker>,
        converter: Arc<MessageConverter>,
        time_source: T,
    ) -> Self {
        Self {
            manager,
            hosting,
            partitions,
            converter,
            time_source,
        }
    }

    /// Process a batch of `p2p.out` records
    pub fn on_next(&self, records: Vec<Record>) -> Vec<Record> {
        let mut output = Vec::new();
        for record in records {
            match record.value {
                RecordValue::AppMessage(AppMessage::Authenticated(message)) => {
                    output.extend(self.process_authenticated(message, false));
                }
                RecordValue::AppMessage(AppMessage::Unauthenticated(message)) => {
                    output.extend(self.process_unauthenticated(message));
                }
                _ => warn!(topic = %record.topic, key = %record.key, "unexpected record on outbound path, skipping"),
            }
        }
        output
    }

    /// Process a retransmission requested by the replay tracker
    ///
    /// Identical to a first attempt except that the attempt is recorded as
    /// `Sent` rather than `Processed`.
    pub fn process_replayed_message(&self, message: AuthenticatedMessage) -> Vec<Record> {
        self.process_authenticated(message, true)
    }

    fn process_authenticated(&self, message: AuthenticatedMessage, replay: bool) -> Vec<Record> {
        let now = self.time_source.now();

        if message.is_expired(now) {
            debug!(message_id = %message.message_id(), replay, "message TTL elapsed, not sending");
            let mut output = vec![AppMessageMarker::ttl_expired(message.message_id().clone(), now).into_record()];
            if replay {
                output.push(AppMessageMarker::sent(&message, now).into_record());
            }
            return output;
        }

        let attempt = AppMessageMarker::for_attempt(&message, replay, now).into_record();

        if self.hosting.is_hosted_locally(&message.header.destination) {
            debug!(message_id = %message.message_id(), "destination hosted locally, looping back");
            let received = AppMessageMarker::received(message.message_id().clone(), now).into_record();
            return vec![
                AppMessage::Authenticated(message).into_inbound_record(),
                attempt,
                received,
            ];
        }

        let state = self.manager.process_authenticated_message(&message);
        let mut output = Vec::new();
        match state {
            SessionState::SessionEstablished { session } => {
                if let Some(link_out) = self.converter.authenticated_link_out(&message, session.as_ref()) {
                    output.push(link_out.into_record());
                    self.manager.data_message_sent(session.as_ref());
                }
            }
            SessionState::NewSessionsNeeded { messages } => {
                let partitions: Vec<u32> = self.partitions.currently_assigned(None).into_iter().collect();
                for (session_id, link_out) in messages {
                    output.push(link_out.into_record());
                    output.push(
                        SessionPartitions {
                            session_id,
                            partitions: partitions.clone(),
                        }
                        .into_record(),
                    );
                }
            }
            SessionState::SessionAlreadyPending { session_id } => {
                debug!(message_id = %message.message_id(), %session_id, "message queued behind pending session");
            }
            SessionState::CannotEstablishSession => {
                debug!(message_id = %message.message_id(), "no session can be established, dropping message");
            }
            SessionState::NoSessionRequired => {
                warn!(message_id = %message.message_id(), "authenticated message reported as needing no session, dropping");
            }
        }
        output.push(attempt);
        output
    }

    fn process_unauthenticated(&self, message: UnauthenticatedMessage) -> Vec<Record> {
        if self.hosting.is_hosted_locally(&message.header.destination) {
            return vec![AppMessage::Unauthenticated(message).into_inbound_record()];
        }
        self.converter
            .unauthenticated_link_out(&message)
            .map(|link_out| link_out.into_record())
            .into_iter()
            .collect()
    }
}
