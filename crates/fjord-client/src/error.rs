//! Error types surfaced by the client and reported by transports.
//!
//! Uses snafu for structured error handling with context.

use snafu::Snafu;

use crate::types::BrokerAddress;
use crate::types::EventType;
use crate::types::PartitionId;
use crate::types::TopicName;

/// Errors reported by a [`BrokerTransport`](crate::transport::BrokerTransport).
///
/// Timeouts are not transport errors: a request that never answers is
/// detected by the client's own deadline tracking.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    /// The node could not be reached.
    #[snafu(display("broker {address} is unreachable: {reason}"))]
    Unreachable {
        /// The node that was contacted.
        address: BrokerAddress,
        /// Why the connection failed.
        reason: String,
    },

    /// The broker answered with an error response.
    #[snafu(display("broker rejected request ({code}): {message}"))]
    Rejected {
        /// Broker error code, e.g. `PARTITION_NOT_FOUND`.
        code: String,
        /// Human-readable detail.
        message: String,
    },

    /// A subscription stream broke off.
    #[snafu(display("event stream for partition {partition_id} closed: {reason}"))]
    StreamClosed {
        /// The partition whose stream closed.
        partition_id: PartitionId,
        /// Why the stream closed.
        reason: String,
    },
}

/// Errors surfaced to applications.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
    /// No leader is known for the partition after refreshing the topology.
    #[snafu(display(
        "Cannot determine leader for partition (timeout {timeout_secs} seconds). Request was: [ topic = {topic}, partition = {partition_id}, event type = {event_type} ]"
    ))]
    LeaderUnresolved {
        /// Topic of the request.
        topic: TopicName,
        /// Partition of the request.
        partition_id: PartitionId,
        /// Resolution budget in seconds.
        timeout_secs: u64,
        /// Kind of record the request targets.
        event_type: EventType,
    },

    /// The topic's partition set is unknown after refreshing the topology.
    #[snafu(display("Cannot determine partitions of topic (timeout {timeout_secs} seconds). Request was: [ topic = {topic} ]"))]
    TopicUnresolved {
        /// The topic that could not be resolved.
        topic: TopicName,
        /// Resolution budget in seconds.
        timeout_secs: u64,
    },

    /// The topology query did not answer in time.
    #[snafu(display("topology request timed out after {timeout_ms}ms"))]
    RefreshTimeout {
        /// The refresh timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The topology query failed.
    #[snafu(display("topology request failed: {source}"))]
    RefreshFailed {
        /// The transport failure.
        source: TransportError,
    },

    /// A dispatched command received no response before its deadline.
    #[snafu(display(
        "Request timed out (timeout {timeout_secs} seconds). Request was: [ topic = {topic}, partition = {partition_id}, event type = {event_type} ]"
    ))]
    RequestTimeout {
        /// Topic of the request.
        topic: TopicName,
        /// Partition of the request.
        partition_id: PartitionId,
        /// Command timeout in seconds.
        timeout_secs: u64,
        /// Kind of record the request targets.
        event_type: EventType,
    },

    /// The broker rejected or errored the request.
    #[snafu(display("{source}"))]
    Transport {
        /// The transport failure.
        source: TransportError,
    },

    /// The client is closing.
    #[snafu(display("client is closed"))]
    Shutdown,

    /// A partition subscription exhausted its re-open budget.
    #[snafu(display("subscription '{name}' on topic '{topic}' failed for partition {partition_id}: {reason}"))]
    SubscriptionFailed {
        /// Subscription name.
        name: String,
        /// Subscribed topic.
        topic: TopicName,
        /// The failed partition.
        partition_id: PartitionId,
        /// The last failure observed.
        reason: String,
    },

    /// The request was malformed before it reached the broker.
    #[snafu(display("invalid request: {reason}"))]
    InvalidRequest {
        /// What is wrong with the request.
        reason: String,
    },
}

impl ClientError {
    /// Whether this error means the client is shutting down.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ClientError::Shutdown)
    }
}

/// Result alias for client operations.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;
