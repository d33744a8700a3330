//! Inbound message processor
//!
//! Consumes wire messages from `link.in`. Handshake steps go to the session
//! manager and their replies back out on `link.out`. Data messages are
//! opened under the session they name; application payloads are delivered
//! on `p2p.in` and acknowledged, acknowledgements become `Received` markers.

use std::sync::Arc;

use tracing::{debug, warn};

use p2p_link_core::{
    AppMessage, AppMessageMarker, AuthenticatedDataMessage, AuthenticatedMessage,
    DataMessagePayload, LinkInMessage, LinkPayload, Record, RecordValue, SessionError, TimeSource,
    UnauthenticatedMessage,
};

use crate::collaborators::HostingMap;
use crate::converter::MessageConverter;
use crate::managers::{InboundSession, SessionManager};

/// Turns inbound wire records into deliveries, replies and markers
pub struct InboundMessageProcessor<T: TimeSource> {
    manager: Arc<SessionManager<T>>,
    hosting: Arc<dyn HostingMap>,
    converter: Arc<MessageConverter>,
    time_source: T,
}

impl<T: TimeSource> InboundMessageProcessor<T> {
    pub fn new(
        manager: Arc<SessionManager<T>>,
        hosting: Arc<dyn HostingMap>,
        converter: Arc<MessageConverter>,
        time_source: T,
    ) -> Self {
        Self {
            manager,
            hosting,
            converter,
            time_source,
        }
    }

    /// Process a batch of `link.in` records
    pub fn on_next(&self, records: Vec<Record>) -> Vec<Record> {
        let mut output = Vec::new();
        for record in records {
            match record.value {
                RecordValue::LinkIn(message) => output.extend(self.process(message)),
                _ => warn!(topic = %record.topic, key = %record.key, "unexpected record on inbound path, skipping"),
            }
        }
        output
    }

    fn process(&self, message: LinkInMessage) -> Vec<Record> {
        if message.payload.is_handshake() {
            return self
                .manager
                .process_session_message(&message)
                .map(|reply| reply.into_record())
                .into_iter()
                .collect();
        }

        match message.payload {
            LinkPayload::AuthenticatedData(data) => self.process_data(data),
            LinkPayload::Unauthenticated(message) => self.process_unauthenticated(message),
            // Handshake steps were dispatched above
            _ => Vec::new(),
        }
    }

    fn process_data(&self, data: AuthenticatedDataMessage) -> Vec<Record> {
        let Some(inbound) = self.manager.get_inbound_session(&data.session_id) else {
            warn!(session_id = %data.session_id, "data message for unknown session, discarding");
            return Vec::new();
        };

        let payload = inbound
            .session
            .open(&data.sealed)
            .and_then(|plaintext| DataMessagePayload::from_binary(&plaintext));
        let payload = match payload {
            Ok(payload) => payload,
            Err(error) => {
                warn!(session_id = %data.session_id, %error, "could not open data message, discarding");
                return Vec::new();
            }
        };

        match payload {
            DataMessagePayload::Data(message) => {
                let expected = &inbound.counterparties;
                if message.header.source != expected.counterparty_id
                    || message.header.destination != expected.our_id
                {
                    let error = SessionError::CounterpartyMismatch {
                        session_id: data.session_id.to_string(),
                    };
                    warn!(message_id = %message.message_id(), %error, "discarding data message");
                    return Vec::new();
                }

                debug!(message_id = %message.message_id(), session_id = %data.session_id, "delivering message");
                let ack = if message.header.suppress_ack {
                    None
                } else {
                    self.acknowledge(&message, &inbound)
                };

                let mut output = vec![AppMessage::Authenticated(message).into_inbound_record()];
                output.extend(ack);
                output
            }
            DataMessagePayload::Ack(ack) => {
                debug!(message_id = %ack.message_id, session_id = %data.session_id, "message acknowledged");
                vec![AppMessageMarker::received(ack.message_id, self.time_source.now()).into_record()]
            }
        }
    }

    fn acknowledge(
        &self,
        message: &AuthenticatedMessage,
        inbound: &InboundSession,
    ) -> Option<Record> {
        let link_out = self.converter.ack_link_out(message, inbound.session.as_ref())?;
        self.manager.data_message_sent(inbound.session.as_ref());
        Some(link_out.into_record())
    }

    fn process_unauthenticated(&self, message: UnauthenticatedMessage) -> Vec<Record> {
        if !self.hosting.is_hosted_locally(&message.header.destination) {
            warn!(
                message_id = %message.header.message_id,
                destination = %message.header.destination,
                "unauthenticated message for an identity not hosted here, discarding"
            );
            return Vec::new();
        }
        vec![AppMessage::Unauthenticated(message).into_inbound_record()]
    }
}
