//! Property tests for the pending-session queue
//!
//! Whatever mix of messages waits behind a negotiation, the flush keeps
//! their order and replaces exactly the expired ones with `TtlExpired`.
//! Messages queued for another counterparty stay where they are.

use std::sync::Arc;

use p2p_link_core::{CounterpartyKey, MarkerKind, RecordValue, Timestamp};
use p2p_link_runtime::{MessageConverter, PendingSessionQueue};
use proptest::prelude::*;

mod test_utils;
use test_utils::{
    authenticated, plain_message_id, MockTimeSource, PlainSession, RecordingPublisher,
    TestNetwork,
};

struct QueueFixture {
    net: TestNetwork,
    publisher: Arc<RecordingPublisher>,
    queue: PendingSessionQueue<MockTimeSource>,
    key: CounterpartyKey,
}

fn fixture() -> QueueFixture {
    let net = TestNetwork::new(&["Alice", "Bob", "Carol"]);
    let converter = Arc::new(MessageConverter::new(net.directory.clone(), net.directory.clone()));
    let publisher = Arc::new(RecordingPublisher::default());
    let queue = PendingSessionQueue::new(converter, publisher.clone(), net.time.clone());
    let key = CounterpartyKey::new(net.node(0).identity.clone(), net.node(1).identity.clone());
    QueueFixture {
        net,
        publisher,
        queue,
        key,
    }
}

/// What the flush published, in order: `(message id, flushed or expired)`
fn flush_outcome(fixture: &QueueFixture) -> Vec<(String, bool)> {
    fixture
        .publisher
        .drain()
        .iter()
        .map(|record| match &record.value {
            RecordValue::Marker(marker) => {
                assert_eq!(marker.kind(), MarkerKind::TtlExpired);
                (marker.message_id.to_string(), false)
            }
            _ => (plain_message_id(record).unwrap().to_string(), true),
        })
        .collect()
}

proptest! {
    #[test]
    fn test_flush_preserves_queue_order(
        entries in prop::collection::vec((prop::option::of(0u64..2_000), any::<bool>()), 1..40)
    ) {
        let fixture = fixture();
        let alice = fixture.net.node(0).identity.clone();
        let bob = fixture.net.node(1).identity.clone();
        let carol = fixture.net.node(2).identity.clone();
        let other_key = CounterpartyKey::new(alice.clone(), carol.clone());
        let start = fixture.net.time.current_time();

        let (mut seen_bob, mut seen_carol) = (false, false);
        for (index, (lifetime, to_bob)) in entries.iter().enumerate() {
            let ttl = lifetime.map(|millis| Timestamp::new(start + millis));
            let id = format!("m{}", index);
            if *to_bob {
                let is_new = fixture
                    .queue
                    .queue_message(authenticated(&alice, &bob, &id, ttl), &fixture.key);
                prop_assert_eq!(is_new, !seen_bob);
                seen_bob = true;
            } else {
                let is_new = fixture
                    .queue
                    .queue_message(authenticated(&alice, &carol, &id, ttl), &other_key);
                prop_assert_eq!(is_new, !seen_carol);
                seen_carol = true;
            }
        }
        let for_bob = entries.iter().filter(|(_, to_bob)| *to_bob).count();
        let for_carol = entries.len() - for_bob;
        prop_assert_eq!(fixture.queue.queued_count(&fixture.key), for_bob);
        prop_assert_eq!(fixture.queue.queued_count(&other_key), for_carol);

        fixture.net.time.advance(1_000);
        let flushed = fixture
            .queue
            .session_negotiated_callback(&fixture.key, &PlainSession::new("s-1"))
            .unwrap();

        let expected: Vec<(String, bool)> = entries
            .iter()
            .enumerate()
            .filter(|(_, (_, to_bob))| *to_bob)
            .map(|(index, (lifetime, _))| {
                (format!("m{}", index), lifetime.map_or(true, |millis| millis >= 1_000))
            })
            .collect();
        prop_assert_eq!(flushed, expected.iter().filter(|(_, sent)| *sent).count());
        prop_assert_eq!(flush_outcome(&fixture), expected);
        prop_assert_eq!(fixture.queue.queued_count(&fixture.key), 0);
        prop_assert_eq!(fixture.queue.queued_count(&other_key), for_carol);
    }
}

#[test]
fn test_flush_of_empty_queue_publishes_nothing() {
    let fixture = fixture();
    let flushed = fixture
        .queue
        .session_negotiated_callback(&fixture.key, &PlainSession::new("s-1"))
        .unwrap();
    assert_eq!(flushed, 0);
    assert!(fixture.publisher.published().is_empty());
}

#[test]
fn test_failed_publish_is_reported() {
    let fixture = fixture();
    let alice = fixture.net.node(0).identity.clone();
    let bob = fixture.net.node(1).identity.clone();
    fixture
        .queue
        .queue_message(authenticated(&alice, &bob, "m1", None), &fixture.key);
    fixture.publisher.fail_publishes(true);

    let result = fixture
        .queue
        .session_negotiated_callback(&fixture.key, &PlainSession::new("s-1"));
    assert!(result.is_err());
}

#[test]
fn test_discard_returns_messages_in_order() {
    let fixture = fixture();
    let alice = fixture.net.node(0).identity.clone();
    let bob = fixture.net.node(1).identity.clone();
    for id in ["m1", "m2", "m3"] {
        fixture
            .queue
            .queue_message(authenticated(&alice, &bob, id, None), &fixture.key);
    }

    let discarded = fixture.queue.discard(&fixture.key);
    let ids: Vec<_> = discarded.iter().map(|message| message.message_id().to_string()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);

    fixture.queue.publish_discarded(discarded);
    let kinds: Vec<_> = fixture
        .publisher
        .drain()
        .iter()
        .filter_map(|record| match &record.value {
            RecordValue::Marker(marker) => Some(marker.kind()),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec![MarkerKind::Sent; 3]);
}
