//! Cluster topology: which node leads which partition.
//!
//! - [`TopologySnapshot`]: one immutable answer to a topology query
//! - [`TopologyCache`]: the current snapshot, swapped atomically
//! - [`RefreshCoordinator`]: single-flight topology queries
//! - [`LeaderResolver`]: bounded waits for a leader or a topic's partitions

mod cache;
mod refresh;
mod resolver;
mod snapshot;

pub use cache::TopologyCache;
pub use refresh::RefreshCoordinator;
pub use refresh::RefreshOutcome;
pub use resolver::LeaderResolver;
pub use snapshot::TopologySnapshot;
