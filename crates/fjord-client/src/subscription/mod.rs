//! Topic-level subscriptions over partition-scoped event streams.
//!
//! A topic subscription runs one task per partition plus a merge task that
//! feeds the application's [`EventHandler`]. Partition tasks fail and
//! recover independently; a discovery task adds partitions that appear in
//! the topology after the subscription opened.

mod aggregator;
mod handler;
mod partition;

use std::sync::Arc;
use std::time::Duration;

pub use aggregator::SubscriptionAggregator;
pub use aggregator::SubscriptionHandle;
pub use handler::EventHandler;
pub use handler::SubscriptionConfig;

use crate::topology::LeaderResolver;
use crate::topology::RefreshCoordinator;
use crate::topology::TopologyCache;
use crate::transport::BrokerTransport;
use crate::types::StartPosition;

/// Collaborators and settings shared by every subscription of a client.
pub(crate) struct SubscriptionContext {
    pub(crate) transport: Arc<dyn BrokerTransport>,
    pub(crate) cache: Arc<TopologyCache>,
    pub(crate) coordinator: Arc<RefreshCoordinator>,
    pub(crate) resolver: Arc<LeaderResolver>,
    pub(crate) default_start: StartPosition,
    /// Consecutive failed opens tolerated before a partition gives up.
    pub(crate) reopen_attempts: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) discovery_interval: Duration,
    pub(crate) buffer_size: usize,
}
