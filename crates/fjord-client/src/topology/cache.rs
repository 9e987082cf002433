//! The client's last known topology.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use fjord_time::SharedTimeProvider;
use fjord_time::duration_to_ms;
use tokio::sync::watch;
use tracing::debug;

use super::TopologySnapshot;
use crate::types::BrokerAddress;
use crate::types::PartitionId;
use crate::types::TopicName;

/// Holds the current [`TopologySnapshot`].
///
/// The snapshot lives in a watch channel: installing a new one is a single
/// pointer swap, so a reader sees either the old or the new snapshot, never
/// a mix. The same channel lets subscriptions react to topology changes.
#[derive(Debug)]
pub struct TopologyCache {
    current: watch::Sender<Arc<TopologySnapshot>>,
    clock: SharedTimeProvider,
    /// Snapshots older than this answer lookups as a miss.
    max_age_ms: Option<u64>,
}

impl TopologyCache {
    pub fn new(clock: SharedTimeProvider, max_age: Option<Duration>) -> Self {
        let (current, _) = watch::channel(Arc::new(TopologySnapshot::empty()));
        Self {
            current,
            clock,
            max_age_ms: max_age.map(duration_to_ms),
        }
    }

    /// Leader of `partition_id` in the current snapshot.
    pub fn get(&self, partition_id: PartitionId) -> Option<BrokerAddress> {
        self.fresh_snapshot()?.leader_for(partition_id).cloned()
    }

    /// Partition set of `topic` in the current snapshot.
    pub fn partitions_of(&self, topic: &TopicName) -> Option<BTreeSet<PartitionId>> {
        self.fresh_snapshot()?.partitions_of(topic).filter(|p| !p.is_empty()).cloned()
    }

    /// The current snapshot regardless of age.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.current.borrow().clone()
    }

    /// Replace the snapshot.
    pub fn install(&self, snapshot: Arc<TopologySnapshot>) {
        debug!(
            partitions = snapshot.partition_count(),
            captured_at_ms = snapshot.captured_at_ms,
            "installing topology snapshot"
        );
        self.current.send_replace(snapshot);
    }

    /// Discard the snapshot so the next lookup misses.
    pub fn invalidate(&self) {
        debug!("invalidating topology snapshot");
        self.current.send_replace(Arc::new(TopologySnapshot::empty()));
    }

    /// Receiver notified on every install and invalidation.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologySnapshot>> {
        self.current.subscribe()
    }

    fn fresh_snapshot(&self) -> Option<Arc<TopologySnapshot>> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return None;
        }
        if let Some(max_age_ms) = self.max_age_ms {
            let age_ms = self.clock.now_unix_ms().saturating_sub(snapshot.captured_at_ms);
            if age_ms >= max_age_ms {
                return None;
            }
        }
        Some(snapshot)
    }
}
