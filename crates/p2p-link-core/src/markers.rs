//! Delivery markers
//!
//! Markers are immutable facts about an authenticated message's lifecycle,
//! published on `p2p.out.markers` keyed by message id and consumed by the
//! replay tracker that decides when a message must be retransmitted.

use serde::{Deserialize, Serialize};

use crate::records::{AuthenticatedMessage, Record, RecordValue, P2P_OUT_MARKERS_TOPIC};
use crate::types::{MessageId, Timestamp};

/// Lifecycle event of one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMarker {
    /// A replayed message was handed to the session manager
    Sent { message: AuthenticatedMessage },
    /// A message was accepted for transmission or looped back locally
    Processed { message: AuthenticatedMessage },
    /// The destination acknowledged the message
    Received,
    /// The message was discarded before transmission because its TTL elapsed
    TtlExpired,
}

impl DeliveryMarker {
    pub fn kind(&self) -> MarkerKind {
        match self {
            DeliveryMarker::Sent { .. } => MarkerKind::Sent,
            DeliveryMarker::Processed { .. } => MarkerKind::Processed,
            DeliveryMarker::Received => MarkerKind::Received,
            DeliveryMarker::TtlExpired => MarkerKind::TtlExpired,
        }
    }
}

/// Payload-free discriminant of `DeliveryMarker`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    Sent,
    Processed,
    Received,
    TtlExpired,
}

/// A marker as published on the markers topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMessageMarker {
    pub message_id: MessageId,
    pub marker: DeliveryMarker,
    pub timestamp: Timestamp,
}

impl AppMessageMarker {
    pub fn new(message_id: MessageId, marker: DeliveryMarker, timestamp: Timestamp) -> Self {
        Self {
            message_id,
            marker,
            timestamp,
        }
    }

    /// Marker for the first processing attempt, or for a replay
    pub fn for_attempt(message: &AuthenticatedMessage, replay: bool, timestamp: Timestamp) -> Self {
        let marker = if replay {
            DeliveryMarker::Sent {
                message: message.clone(),
            }
        } else {
            DeliveryMarker::Processed {
                message: message.clone(),
            }
        };
        Self::new(message.message_id().clone(), marker, timestamp)
    }

    pub fn sent(message: &AuthenticatedMessage, timestamp: Timestamp) -> Self {
        Self::for_attempt(message, true, timestamp)
    }

    pub fn received(message_id: MessageId, timestamp: Timestamp) -> Self {
        Self::new(message_id, DeliveryMarker::Received, timestamp)
    }

    pub fn ttl_expired(message_id: MessageId, timestamp: Timestamp) -> Self {
        Self::new(message_id, DeliveryMarker::TtlExpired, timestamp)
    }

    pub fn kind(&self) -> MarkerKind {
        self.marker.kind()
    }

    /// Wrap into a record on the markers topic
    pub fn into_record(self) -> Record {
        Record::new(
            P2P_OUT_MARKERS_TOPIC,
            self.message_id.to_string(),
            RecordValue::Marker(self),
        )
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::AuthenticatedMessageHeader;
    use crate::types::HoldingIdentity;

    fn message() -> AuthenticatedMessage {
        AuthenticatedMessage {
            header: AuthenticatedMessageHeader {
                destination: HoldingIdentity::new("O=Bob", "g"),
                source: HoldingIdentity::new("O=Alice", "g"),
                ttl: None,
                message_id: MessageId::new("m-7"),
                trace_id: None,
                subsystem: "flow".into(),
                suppress_ack: false,
            },
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_attempt_markers() {
        let now = Timestamp::new(5);
        assert_eq!(AppMessageMarker::for_attempt(&message(), false, now).kind(), MarkerKind::Processed);
        assert_eq!(AppMessageMarker::for_attempt(&message(), true, now).kind(), MarkerKind::Sent);
    }

    #[test]
    fn test_marker_record_is_keyed_by_message_id() {
        let record = AppMessageMarker::received(MessageId::new("m-7"), Timestamp::new(5)).into_record();
        assert_eq!(record.topic, P2P_OUT_MARKERS_TOPIC);
        assert_eq!(record.key, "m-7");
        assert!(matches!(
            record.value,
            RecordValue::Marker(AppMessageMarker { marker: DeliveryMarker::Received, .. })
        ));
    }
}
