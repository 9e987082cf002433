//! The application-facing client.

use std::sync::Arc;

use fjord_time::SharedTimeProvider;
use fjord_time::system_clock;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::config::ClientConfig;
use crate::config::ConfigError;
use crate::dispatch::CommandDispatcher;
use crate::dispatch::CommandFuture;
use crate::error::ClientError;
use crate::error::Result;
use crate::pending::Expirable;
use crate::pending::PendingRequestRegistry;
use crate::pending::spawn_timeout_sweeper;
use crate::subscription::SubscriptionAggregator;
use crate::subscription::SubscriptionConfig;
use crate::subscription::SubscriptionContext;
use crate::subscription::SubscriptionHandle;
use crate::topology::LeaderResolver;
use crate::topology::RefreshCoordinator;
use crate::topology::TopologyCache;
use crate::topology::TopologySnapshot;
use crate::transport::BrokerTransport;
use crate::types::Command;
use crate::types::EventType;
use crate::types::PartitionId;
use crate::types::TopicName;

/// Builder for [`FjordClient`].
pub struct FjordClientBuilder {
    transport: Arc<dyn BrokerTransport>,
    config: ClientConfig,
    clock: SharedTimeProvider,
}

impl FjordClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for every deadline and snapshot age. Defaults to the
    /// system clock.
    pub fn time_provider(mut self, clock: SharedTimeProvider) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and start the client.
    ///
    /// Must be called within a tokio runtime: it starts the timeout sweep
    /// and an initial topology refresh in the background.
    pub fn build(self) -> std::result::Result<FjordClient, ConfigError> {
        self.config.validate()?;
        let Self {
            transport,
            config,
            clock,
        } = self;

        let shutdown = CancellationToken::new();
        let cache = Arc::new(TopologyCache::new(clock.clone(), config.topology_max_age()));
        let topology_requests = PendingRequestRegistry::new(clock.clone());
        let command_requests = PendingRequestRegistry::new(clock.clone());
        let resolution_deadlines = PendingRequestRegistry::new(clock.clone());

        let coordinator = RefreshCoordinator::new(
            Arc::clone(&transport),
            Arc::clone(&cache),
            Arc::clone(&topology_requests),
            clock.clone(),
            config.bootstrap_addresses(),
            config.topology_refresh_timeout(),
        );
        let resolver = Arc::new(LeaderResolver::new(
            Arc::clone(&cache),
            Arc::clone(&coordinator),
            Arc::clone(&resolution_deadlines),
            config.topology_refresh_timeout(),
            config.refresh_retry_delay(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&transport),
            Arc::clone(&cache),
            Arc::clone(&resolver),
            Arc::clone(&command_requests),
            config.request_timeout(),
            shutdown.clone(),
        ));
        let subscriptions = SubscriptionAggregator::new(
            Arc::new(SubscriptionContext {
                transport,
                cache: Arc::clone(&cache),
                coordinator: Arc::clone(&coordinator),
                resolver,
                default_start: config.subscription_start_position,
                reopen_attempts: config.subscription_reopen_attempts,
                retry_delay: config.refresh_retry_delay(),
                discovery_interval: config.partition_discovery_interval(),
                buffer_size: config.subscription_buffer_size,
            }),
            shutdown.clone(),
        );

        let registries: Vec<Arc<dyn Expirable>> = vec![
            topology_requests as Arc<dyn Expirable>,
            command_requests as Arc<dyn Expirable>,
            resolution_deadlines as Arc<dyn Expirable>,
        ];
        let sweeper = spawn_timeout_sweeper(
            registries.clone(),
            clock.clone(),
            config.timeout_sweep_interval(),
            shutdown.clone(),
        );

        {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                if let Err(error) = coordinator.refresh().await {
                    debug!(%error, "initial topology refresh failed");
                }
            });
        }

        info!(
            bootstrap_brokers = ?config.bootstrap_brokers,
            refresh_timeout_ms = config.topology_refresh_timeout_ms,
            request_timeout_ms = config.request_timeout_ms,
            "client started"
        );

        Ok(FjordClient {
            config,
            clock,
            cache,
            coordinator,
            dispatcher,
            subscriptions,
            registries,
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }
}

/// Client of a partitioned broker cluster.
///
/// Commands are routed to the leader of their partition; subscriptions
/// merge the event streams of every partition of a topic.
///
/// # Example
///
/// ```rust,ignore
/// use fjord_client::{EventType, FjordClient};
///
/// let client = FjordClient::builder(transport).build()?;
/// let command = client.command(0u32, EventType::Task, "CREATE");
/// let response = client.dispatch(command).await?;
/// client.close().await;
/// ```
pub struct FjordClient {
    config: ClientConfig,
    clock: SharedTimeProvider,
    cache: Arc<TopologyCache>,
    coordinator: Arc<RefreshCoordinator>,
    dispatcher: Arc<CommandDispatcher>,
    subscriptions: SubscriptionAggregator,
    registries: Vec<Arc<dyn Expirable>>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl FjordClient {
    pub fn builder(transport: Arc<dyn BrokerTransport>) -> FjordClientBuilder {
        FjordClientBuilder {
            transport,
            config: ClientConfig::default(),
            clock: system_clock(),
        }
    }

    /// A command on the configured default topic.
    pub fn command(
        &self,
        partition_id: impl Into<PartitionId>,
        event_type: EventType,
        command: impl Into<String>,
    ) -> Command {
        Command::new(self.config.default_topic(), partition_id, event_type, command)
    }

    /// Send `command` to the leader of its partition.
    ///
    /// The command runs in the background; the returned future yields its
    /// outcome.
    pub fn dispatch(&self, command: Command) -> CommandFuture {
        CommandFuture::spawn(Arc::clone(&self.dispatcher), command)
    }

    /// The current topology snapshot, possibly empty.
    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.cache.snapshot()
    }

    /// Query the cluster for its topology now.
    pub async fn refresh_topology(&self) -> Result<Arc<TopologySnapshot>> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Shutdown);
        }
        self.coordinator.refresh().await
    }

    /// Number of topology queries sent so far.
    pub fn topology_queries_issued(&self) -> u64 {
        self.coordinator.queries_issued()
    }

    /// Subscribe to every partition of `topic`.
    pub async fn open_subscription(
        &self,
        topic: impl Into<TopicName>,
        config: SubscriptionConfig,
    ) -> Result<SubscriptionHandle> {
        self.subscriptions.open(topic.into(), config).await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn time_provider(&self) -> &SharedTimeProvider {
        &self.clock
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Shut the client down.
    ///
    /// Pending commands and topology queries fail with
    /// [`ClientError::Shutdown`] and every subscription is closed. Calling
    /// `close` again has no further effect.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let failed: usize = self.registries.iter().map(|registry| registry.cancel_all(ClientError::Shutdown)).sum();
        self.subscriptions.close_all().await;

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
            info!(failed_requests = failed, "client closed");
        }
    }
}

impl Drop for FjordClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for registry in &self.registries {
            registry.cancel_all(ClientError::Shutdown);
        }
    }
}

impl std::fmt::Debug for FjordClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FjordClient")
            .field("config", &self.config)
            .field("coordinator", &self.coordinator)
            .field("subscriptions", &self.subscriptions)
            .field("closed", &self.is_closed())
            .finish()
    }
}
