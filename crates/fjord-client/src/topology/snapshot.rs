//! Immutable partition → leader mapping.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::transport::TopologyResponse;
use crate::types::BrokerAddress;
use crate::types::PartitionId;
use crate::types::TopicName;

/// The cluster topology as answered by one topology query.
///
/// Snapshots are never modified after construction; the cache replaces
/// them wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    /// Leader of every known partition.
    leaders: BTreeMap<PartitionId, BrokerAddress>,
    /// Partition set of every known topic.
    topics: BTreeMap<TopicName, BTreeSet<PartitionId>>,
    /// When the snapshot was captured (Unix milliseconds, client clock).
    pub captured_at_ms: u64,
}

impl TopologySnapshot {
    /// A snapshot with no partitions, as held before the first refresh.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from a topology answer.
    ///
    /// If a partition is listed more than once, the last entry wins.
    pub fn from_response(response: TopologyResponse, captured_at_ms: u64) -> Self {
        let mut leaders = BTreeMap::new();
        let mut topics: BTreeMap<TopicName, BTreeSet<PartitionId>> = BTreeMap::new();
        for entry in response.partitions {
            leaders.insert(entry.partition_id, entry.leader);
            topics.entry(entry.topic).or_default().insert(entry.partition_id);
        }
        Self {
            leaders,
            topics,
            captured_at_ms,
        }
    }

    /// Leader of `partition_id`, if known.
    pub fn leader_for(&self, partition_id: PartitionId) -> Option<&BrokerAddress> {
        self.leaders.get(&partition_id)
    }

    /// Partitions of `topic`, if the topic is known.
    pub fn partitions_of(&self, topic: &TopicName) -> Option<&BTreeSet<PartitionId>> {
        self.topics.get(topic)
    }

    pub fn leaders(&self) -> &BTreeMap<PartitionId, BrokerAddress> {
        &self.leaders
    }

    pub fn topics(&self) -> impl Iterator<Item = &TopicName> {
        self.topics.keys()
    }

    pub fn partition_count(&self) -> usize {
        self.leaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PartitionLeader;

    fn leader(topic: &str, partition: u32, port: u16) -> PartitionLeader {
        PartitionLeader {
            topic: TopicName::new(topic),
            partition_id: PartitionId(partition),
            leader: BrokerAddress::new("broker", port),
        }
    }

    #[test]
    fn test_from_response_groups_topics() {
        let response = TopologyResponse {
            partitions: vec![leader("orders", 0, 1), leader("orders", 1, 2), leader("audit", 2, 1)],
        };
        let snapshot = TopologySnapshot::from_response(response, 42);

        assert_eq!(snapshot.captured_at_ms, 42);
        assert_eq!(snapshot.partition_count(), 3);
        assert_eq!(snapshot.leader_for(PartitionId(1)), Some(&BrokerAddress::new("broker", 2)));
        assert_eq!(
            snapshot.partitions_of(&TopicName::new("orders")).unwrap().iter().copied().collect::<Vec<_>>(),
            vec![PartitionId(0), PartitionId(1)]
        );
        assert!(snapshot.partitions_of(&TopicName::new("missing")).is_none());
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = TopologySnapshot::empty();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.leader_for(PartitionId(0)), None);
        assert_eq!(snapshot.topics().count(), 0);
    }
}
