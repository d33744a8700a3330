//! Pending-session queue
//!
//! Outbound messages wait here, per counterparty, while a session is being
//! negotiated. When the session manager completes the first handshake for a
//! counterparty it hands the session to `session_negotiated_callback`, which
//! drains the queue and publishes the sealed messages in enqueue order.
//!
//! The queue is drained by removing the whole entry from the map, so the
//! per-key lock is released before any sealing or publishing happens.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use p2p_link_core::{
    AppMessageMarker, AuthenticatedMessage, CounterpartyKey, LinkResult, Session, TimeSource,
};

use crate::collaborators::RecordPublisher;
use crate::converter::MessageConverter;

/// Messages waiting for a session, keyed by counterparty
pub struct PendingSessionQueue<T: TimeSource> {
    queues: DashMap<CounterpartyKey, VecDeque<AuthenticatedMessage>>,
    converter: Arc<MessageConverter>,
    publisher: Arc<dyn RecordPublisher>,
    time_source: T,
}

impl<T: TimeSource> PendingSessionQueue<T> {
    pub fn new(
        converter: Arc<MessageConverter>,
        publisher: Arc<dyn RecordPublisher>,
        time_source: T,
    ) -> Self {
        Self {
            queues: DashMap::new(),
            converter,
            publisher,
            time_source,
        }
    }

    /// Queue `message` for `key`; true when it is the first message queued for that key
    pub fn queue_message(&self, message: AuthenticatedMessage, key: &CounterpartyKey) -> bool {
        match self.queues.entry(key.clone()) {
            Entry::Occupied(mut queue) => {
                queue.get_mut().push_back(message);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::from([message]));
                true
            }
        }
    }

    /// Number of messages waiting for `key`
    pub fn queued_count(&self, key: &CounterpartyKey) -> usize {
        self.queues.get(key).map_or(0, |queue| queue.len())
    }

    /// Drain the queue of `key` and publish every message sealed under `session`
    ///
    /// Messages whose TTL elapsed while waiting are replaced by a `TtlExpired`
    /// marker. Returns how many messages were sealed and published.
    pub fn session_negotiated_callback(
        &self,
        key: &CounterpartyKey,
        session: &dyn Session,
    ) -> LinkResult<usize> {
        let Some((_, messages)) = self.queues.remove(key) else {
            debug!(counterparties = %key, "no messages queued for negotiated session");
            return Ok(0);
        };

        let now = self.time_source.now();
        let mut records = Vec::with_capacity(messages.len());
        let mut flushed = 0;
        for message in messages {
            if message.is_expired(now) {
                debug!(message_id = %message.message_id(), "queued message expired before session was ready");
                records.push(AppMessageMarker::ttl_expired(message.message_id().clone(), now).into_record());
                continue;
            }
            if let Some(link_out) = self.converter.authenticated_link_out(&message, session) {
                records.push(link_out.into_record());
                flushed += 1;
            }
        }

        debug!(
            counterparties = %key,
            session_id = %session.session_id(),
            flushed,
            "flushing pending-session queue"
        );
        if !records.is_empty() {
            self.publisher.publish(records)?;
        }
        Ok(flushed)
    }

    /// Remove the queue of `key` without sending anything
    pub fn discard(&self, key: &CounterpartyKey) -> Vec<AuthenticatedMessage> {
        self.queues
            .remove(key)
            .map(|(_, queue)| Vec::from(queue))
            .unwrap_or_default()
    }

    /// Publish a terminal `Sent` marker for each discarded message so it is replayed later
    pub fn publish_discarded(&self, messages: Vec<AuthenticatedMessage>) {
        if messages.is_empty() {
            return;
        }
        let now = self.time_source.now();
        let records: Vec<_> = messages
            .iter()
            .map(|message| AppMessageMarker::sent(message, now).into_record())
            .collect();

        if let Err(error) = self.publisher.publish(records) {
            warn!(count = messages.len(), %error, "could not publish markers for discarded messages");
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use p2p_link_core::{
        AuthenticatedMessageHeader, GroupPolicy, HoldingIdentity, MarkerKind, MemberInfo,
        MessageId, NetworkType, PkiMode, Record, RecordValue, SystemTimeSource,
    };
    use parking_lot::Mutex;

    use crate::collaborators::{GroupPolicyProvider, MembershipLookup};

    struct Directory;

    impl MembershipLookup for Directory {
        fn resolve_member(&self, identity: &HoldingIdentity) -> Option<MemberInfo> {
            Some(MemberInfo {
                holding_identity: identity.clone(),
                session_public_key: [0; 32],
                session_key_endorsement: None,
                endpoint: "https://peer".into(),
                protocol_modes: vec![],
            })
        }
    }

    impl GroupPolicyProvider for Directory {
        fn resolve_group_policy(&self, group_id: &str) -> Option<GroupPolicy> {
            Some(GroupPolicy {
                group_id: group_id.into(),
                network_type: NetworkType::Standard,
                trust_roots: vec![],
                pki_mode: PkiMode::NoPki,
            })
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Record>>);

    impl RecordPublisher for Recorder {
        fn publish(&self, records: Vec<Record>) -> LinkResult<()> {
            self.0.lock().extend(records);
            Ok(())
        }
    }

    fn queue() -> (PendingSessionQueue<SystemTimeSource>, Arc<Recorder>) {
        let directory = Arc::new(Directory);
        let recorder = Arc::new(Recorder::default());
        let converter = Arc::new(MessageConverter::new(directory.clone(), directory));
        (
            PendingSessionQueue::new(converter, recorder.clone(), SystemTimeSource),
            recorder,
        )
    }

    fn key(peer: &str) -> CounterpartyKey {
        CounterpartyKey::new(HoldingIdentity::new("O=Alice", "g"), HoldingIdentity::new(peer, "g"))
    }

    fn message(id: &str, peer: &str) -> AuthenticatedMessage {
        AuthenticatedMessage {
            header: AuthenticatedMessageHeader {
                destination: HoldingIdentity::new(peer, "g"),
                source: HoldingIdentity::new("O=Alice", "g"),
                ttl: None,
                message_id: MessageId::new(id),
                trace_id: None,
                subsystem: "flow".into(),
                suppress_ack: false,
            },
            payload: id.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_first_message_starts_queue() {
        let (queue, _) = queue();
        assert!(queue.queue_message(message("m1", "O=Bob"), &key("O=Bob")));
        assert!(!queue.queue_message(message("m2", "O=Bob"), &key("O=Bob")));
        assert!(queue.queue_message(message("m3", "O=Carol"), &key("O=Carol")));

        assert_eq!(queue.queued_count(&key("O=Bob")), 2);
        assert_eq!(queue.queued_count(&key("O=Carol")), 1);
    }

    #[test]
    fn test_discard_publishes_sent_markers() {
        let (queue, recorder) = queue();
        queue.queue_message(message("m1", "O=Bob"), &key("O=Bob"));
        queue.queue_message(message("m2", "O=Bob"), &key("O=Bob"));

        let discarded = queue.discard(&key("O=Bob"));
        assert_eq!(discarded.len(), 2);
        assert_eq!(queue.queued_count(&key("O=Bob")), 0);

        queue.publish_discarded(discarded);
        let published = recorder.0.lock();
        let kinds: Vec<_> = published
            .iter()
            .map(|record| match &record.value {
                RecordValue::Marker(marker) => (record.key.clone(), marker.kind()),
                other => panic!("unexpected record {:?}", other),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![("m1".to_string(), MarkerKind::Sent), ("m2".to_string(), MarkerKind::Sent)]
        );

        // A fresh queue starts after a discard
        assert!(queue.queue_message(message("m3", "O=Bob"), &key("O=Bob")));
    }
}
