//! Core data types shared by dispatch, topology, and subscriptions.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Identifier of a partition, unique within the cluster topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Get the raw identifier.
    #[inline]
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl From<u32> for PartitionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a logical topic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicName(String);

impl TopicName {
    /// Create a topic name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TopicName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TopicName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network address of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BrokerAddress {
    /// Hostname or IP address.
    pub host: String,
    /// Port of the client API.
    pub port: u16,
}

impl BrokerAddress {
    /// Create an address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BrokerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| format!("broker address '{}' is not host:port", s))?;
        if host.is_empty() {
            return Err(format!("broker address '{}' has an empty host", s));
        }
        let port = port.parse::<u16>().map_err(|e| format!("broker address '{}' has an invalid port: {}", s, e))?;
        Ok(Self::new(host, port))
    }
}

/// Kind of record a command or event refers to.
///
/// Displays as the upper-case name the broker uses (`TASK`, `WORKFLOW`, ..).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Task,
    Workflow,
    WorkflowInstance,
    Incident,
    Raft,
    Topic,
    Subscription,
    Other(String),
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Task => f.write_str("TASK"),
            EventType::Workflow => f.write_str("WORKFLOW"),
            EventType::WorkflowInstance => f.write_str("WORKFLOW_INSTANCE"),
            EventType::Incident => f.write_str("INCIDENT"),
            EventType::Raft => f.write_str("RAFT"),
            EventType::Topic => f.write_str("TOPIC"),
            EventType::Subscription => f.write_str("SUBSCRIPTION"),
            EventType::Other(name) => f.write_str(name),
        }
    }
}

/// A command bound to one partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Topic the partition belongs to.
    pub topic: TopicName,
    /// Partition whose leader must process the command.
    pub partition_id: PartitionId,
    /// Kind of record the command targets.
    pub event_type: EventType,
    /// Command name, e.g. `COMPLETE`.
    pub command: String,
    /// Key of the record the command refers to, if it exists already.
    pub key: Option<u64>,
    /// Opaque command body.
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Command {
    /// Create a command without key or payload.
    pub fn new(
        topic: impl Into<TopicName>,
        partition_id: impl Into<PartitionId>,
        event_type: EventType,
        command: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition_id: partition_id.into(),
            event_type,
            command: command.into(),
            key: None,
            payload: Vec::new(),
        }
    }

    /// Set the record key.
    pub fn with_key(mut self, key: u64) -> Self {
        self.key = Some(key);
        self
    }

    /// Set the command body.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// The broker's answer to a successfully processed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Partition that processed the command.
    pub partition_id: PartitionId,
    /// Key of the affected record.
    pub key: u64,
    /// Log position of the resulting event.
    pub position: u64,
    /// Resulting record state, e.g. `COMPLETED`.
    pub state: String,
    /// Resulting record body.
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// An event read from a partition's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Partition the event was written to.
    pub partition_id: PartitionId,
    /// Position in the partition log; increases monotonically per partition.
    pub position: u64,
    /// Key of the record the event belongs to.
    pub key: u64,
    /// Kind of record.
    pub event_type: EventType,
    /// Record state carried by the event, e.g. `CREATED`.
    pub state: String,
    /// Opaque event body.
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Where a partition subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// The first event still in the partition log.
    Head,
    /// Only events written after the subscription opens.
    #[default]
    Tail,
    /// The first event at or after this position.
    Sequence(u64),
}

impl StartPosition {
    /// Whether an event at `position` is visible from this start position.
    ///
    /// `Tail` admits nothing that already exists; the caller decides what
    /// counts as existing.
    pub fn admits(&self, position: u64) -> bool {
        match self {
            StartPosition::Head => true,
            StartPosition::Tail => false,
            StartPosition::Sequence(first) => position >= *first,
        }
    }
}

impl FromStr for StartPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "head" => Ok(StartPosition::Head),
            "tail" => Ok(StartPosition::Tail),
            other => other
                .parse::<u64>()
                .map(StartPosition::Sequence)
                .map_err(|_| format!("invalid start position: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_address_parse() {
        let addr: BrokerAddress = "broker-1:51015".parse().unwrap();
        assert_eq!(addr, BrokerAddress::new("broker-1", 51015));
        assert_eq!(addr.to_string(), "broker-1:51015");
    }

    #[test]
    fn test_broker_address_parse_invalid() {
        assert!("broker-1".parse::<BrokerAddress>().is_err());
        assert!(":51015".parse::<BrokerAddress>().is_err());
        assert!("broker-1:99999".parse::<BrokerAddress>().is_err());
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::Task.to_string(), "TASK");
        assert_eq!(EventType::WorkflowInstance.to_string(), "WORKFLOW_INSTANCE");
        assert_eq!(EventType::Other("CUSTOM".into()).to_string(), "CUSTOM");
    }

    #[test]
    fn test_start_position_parse() {
        assert_eq!("head".parse::<StartPosition>().unwrap(), StartPosition::Head);
        assert_eq!("TAIL".parse::<StartPosition>().unwrap(), StartPosition::Tail);
        assert_eq!("42".parse::<StartPosition>().unwrap(), StartPosition::Sequence(42));
        assert!("middle".parse::<StartPosition>().is_err());
    }

    #[test]
    fn test_start_position_admits() {
        assert!(StartPosition::Head.admits(1));
        assert!(!StartPosition::Tail.admits(1));
        assert!(!StartPosition::Sequence(5).admits(4));
        assert!(StartPosition::Sequence(5).admits(5));
    }

    #[test]
    fn test_command_builder() {
        let command = Command::new("orders", 3, EventType::Task, "COMPLETE").with_key(7).with_payload(b"{}".to_vec());
        assert_eq!(command.topic.as_str(), "orders");
        assert_eq!(command.partition_id, PartitionId(3));
        assert_eq!(command.key, Some(7));
        assert_eq!(command.payload, b"{}");
    }
}
