//! Boundary to the broker transport.
//!
//! The client never encodes requests itself: a [`BrokerTransport`]
//! implementation owns connections and the wire format. The client only
//! relies on three exchanges:
//!
//! - a topology query answered by any reachable node,
//! - a command request answered by the partition leader,
//! - a partition-scoped subscription yielding ordered events.
//!
//! A transport may leave a request unanswered forever; the client detects
//! that with its own deadlines and drops the request future.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::TransportError;
use crate::types::BrokerAddress;
use crate::types::Command;
use crate::types::CommandResponse;
use crate::types::Event;
use crate::types::PartitionId;
use crate::types::StartPosition;
use crate::types::TopicName;

/// Leader of one partition as reported by a topology query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLeader {
    /// Topic owning the partition.
    pub topic: TopicName,
    /// The partition.
    pub partition_id: PartitionId,
    /// Node currently leading the partition.
    pub leader: BrokerAddress,
}

/// Answer to a topology query: every partition of every topic with its leader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyResponse {
    pub partitions: Vec<PartitionLeader>,
}

/// Request to open a subscription on one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSubscriptionRequest {
    /// Subscription name, shared by all partitions of a topic subscription.
    pub name: String,
    /// Subscribed topic.
    pub topic: TopicName,
    /// The partition to read.
    pub partition_id: PartitionId,
    /// First event to deliver.
    pub start_position: StartPosition,
}

/// Sends requests to cluster nodes.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Ask `contact` for the current cluster topology.
    async fn request_topology(&self, contact: &BrokerAddress) -> Result<TopologyResponse, TransportError>;

    /// Send a command to the leader of its partition.
    async fn execute_command(&self, leader: &BrokerAddress, command: &Command)
    -> Result<CommandResponse, TransportError>;

    /// Open a partition-scoped event stream on the partition leader.
    async fn open_subscription(
        &self,
        leader: &BrokerAddress,
        request: &PartitionSubscriptionRequest,
    ) -> Result<Box<dyn EventSource>, TransportError>;
}

/// A stream of ordered events from one partition.
///
/// `next_event` must be cancel-safe: the client polls it inside
/// `tokio::select!` and may drop the future before it completes.
#[async_trait]
pub trait EventSource: Send + 'static {
    /// The next event, an error if the stream broke, or `None` once the
    /// broker ended the stream.
    async fn next_event(&mut self) -> Option<Result<Event, TransportError>>;

    /// Mark every event up to and including `position` as processed.
    async fn acknowledge(&mut self, position: u64) -> Result<(), TransportError>;

    /// Close the stream. Further calls to `next_event` return `None`.
    async fn close(&mut self);

    /// Position of the first event this stream delivers, if the broker
    /// reported it when the stream opened.
    ///
    /// A stream opened at the tail is re-opened from here, so events written
    /// while it was down are not skipped.
    fn first_position(&self) -> Option<u64> {
        None
    }
}
