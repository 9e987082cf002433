//! Topology-aware client runtime for a partitioned, clustered broker.
//!
//! This crate bundles the workspace crates:
//!
//! - [`client`]: the client runtime ([`FjordClient`] and friends)
//! - [`time`]: injectable clock sources
//!
//! The in-memory stub broker used by the integration tests lives in the
//! `fjord-testing` crate.

pub use fjord_client as client;
pub use fjord_client::ClientConfig;
pub use fjord_client::ClientError;
pub use fjord_client::Command;
pub use fjord_client::CommandFuture;
pub use fjord_client::CommandResponse;
pub use fjord_client::Event;
pub use fjord_client::EventHandler;
pub use fjord_client::EventType;
pub use fjord_client::FjordClient;
pub use fjord_client::PartitionId;
pub use fjord_client::StartPosition;
pub use fjord_client::SubscriptionConfig;
pub use fjord_client::SubscriptionHandle;
pub use fjord_client::TopicName;
pub use fjord_time as time;
