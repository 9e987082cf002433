//! Client runtime for a partitioned, clustered broker.
//!
//! The client keeps a cached view of which node leads each partition, routes
//! commands to those leaders and merges the event streams of all partitions
//! of a topic into one handler.
//!
//! # Key Components
//!
//! - [`FjordClient`]: entry point; dispatches commands and opens subscriptions
//! - [`topology`]: snapshot cache, single-flight refresh, leader resolution
//! - [`PendingRequestRegistry`]: correlation of requests with their outcome
//! - [`CommandDispatcher`]: one command attempt against a partition leader
//! - [`SubscriptionAggregator`]: per-partition streams merged per topic
//! - [`BrokerTransport`]: boundary to the wire layer, supplied by the caller
//!
//! All timeouts are measured with the [`TimeProvider`](fjord_time::TimeProvider)
//! given to [`FjordClientBuilder::time_provider`].

mod client;
mod config;
mod constants;
mod dispatch;
mod error;
mod pending;
mod transport;
mod types;

pub mod subscription;
pub mod topology;

pub use client::FjordClient;
pub use client::FjordClientBuilder;
pub use config::ClientConfig;
pub use config::ConfigError;
pub use constants::*;
pub use dispatch::CommandDispatcher;
pub use dispatch::CommandFuture;
pub use error::ClientError;
pub use error::Result;
pub use error::TransportError;
pub use pending::Completion;
pub use pending::Expirable;
pub use pending::PendingRequest;
pub use pending::PendingRequestRegistry;
pub use pending::RequestId;
pub use pending::RequestKind;
pub use pending::spawn_timeout_sweeper;
pub use subscription::EventHandler;
pub use subscription::SubscriptionAggregator;
pub use subscription::SubscriptionConfig;
pub use subscription::SubscriptionHandle;
pub use topology::TopologySnapshot;
pub use transport::BrokerTransport;
pub use transport::EventSource;
pub use transport::PartitionLeader;
pub use transport::PartitionSubscriptionRequest;
pub use transport::TopologyResponse;
pub use types::BrokerAddress;
pub use types::Command;
pub use types::CommandResponse;
pub use types::Event;
pub use types::EventType;
pub use types::PartitionId;
pub use types::StartPosition;
pub use types::TopicName;
