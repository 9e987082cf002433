//! Client defaults and fixed limits.

/// Topic used by commands that do not name one.
pub const DEFAULT_TOPIC: &str = "default-topic";

/// Default contact point for topology queries.
pub const DEFAULT_BOOTSTRAP_BROKER: &str = "127.0.0.1:51015";

/// Default topology refresh timeout (5 seconds).
pub const DEFAULT_TOPOLOGY_REFRESH_TIMEOUT_MS: u64 = 5_000;

/// Default per-command timeout (15 seconds).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Topology snapshots never expire by age unless configured.
pub const DEFAULT_TOPOLOGY_MAX_AGE_MS: u64 = 0;

/// Pause between leader-resolution attempts within one budget.
pub const DEFAULT_REFRESH_RETRY_DELAY_MS: u64 = 100;

/// Period of the timeout-detection sweep.
pub const DEFAULT_TIMEOUT_SWEEP_INTERVAL_MS: u64 = 50;

/// Consecutive failed re-opens a partition subscription tolerates.
pub const DEFAULT_SUBSCRIPTION_REOPEN_ATTEMPTS: u32 = 5;

/// How often an open subscription looks for new partitions.
pub const DEFAULT_PARTITION_DISCOVERY_INTERVAL_MS: u64 = 30_000;

/// Capacity of a subscription's merge channel.
pub const DEFAULT_SUBSCRIPTION_BUFFER_SIZE: usize = 1024;

/// Upper bound on the merge channel capacity.
pub const MAX_SUBSCRIPTION_BUFFER_SIZE: usize = 65_536;

/// Upper bound on the number of bootstrap brokers.
pub const MAX_BOOTSTRAP_BROKERS: usize = 64;
