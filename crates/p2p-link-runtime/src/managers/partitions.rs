//! Partition assignment tracking
//!
//! Replies to a session-init message must reach the instance that started
//! the negotiation, so every init is published together with the `link.in`
//! partitions this instance currently owns. The tracker follows rebalance
//! callbacks from the bus consumer and answers reads from the outbound path.

use std::collections::BTreeSet;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};

use p2p_link_core::records::LINK_IN_TOPIC;

/// Partitions owned by this instance, per topic
#[derive(Debug)]
pub struct PartitionAssignmentTracker {
    assigned: RwLock<HashMap<String, BTreeSet<u32>>>,
    ready: watch::Sender<bool>,
}

impl Default for PartitionAssignmentTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionAssignmentTracker {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            assigned: RwLock::new(HashMap::new()),
            ready,
        }
    }

    /// Rebalance callback: partitions were assigned to this instance
    pub fn on_partitions_assigned(&self, partitions: &[(String, u32)]) {
        {
            let mut assigned = self.assigned.write();
            for (topic, partition) in partitions {
                assigned.entry(topic.clone()).or_default().insert(*partition);
            }
        }
        debug!(count = partitions.len(), "partitions assigned");
        self.mark_ready();
    }

    /// Rebalance callback: partitions were taken away from this instance
    pub fn on_partitions_unassigned(&self, partitions: &[(String, u32)]) {
        {
            let mut assigned = self.assigned.write();
            for (topic, partition) in partitions {
                if let Some(owned) = assigned.get_mut(topic) {
                    owned.remove(partition);
                    if owned.is_empty() {
                        assigned.remove(topic);
                    }
                }
            }
        }
        debug!(count = partitions.len(), "partitions unassigned");
        self.mark_ready();
    }

    /// Partitions currently owned for `topic`, `link.in` when not given
    pub fn currently_assigned(&self, topic: Option<&str>) -> BTreeSet<u32> {
        let topic = topic.unwrap_or(LINK_IN_TOPIC);
        self.assigned
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any rebalance callback has run yet
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once the first rebalance callback has run
    pub async fn ready(&self) {
        let mut receiver = self.ready.subscribe();
        let _ = receiver.wait_for(|ready| *ready).await;
    }

    fn mark_ready(&self) {
        let first = self.ready.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });
        if first {
            info!("partition assignment received, instance can receive routed replies");
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
