//! Topic subscriptions merged across partitions.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::SubscriptionContext;
use super::handler::EventHandler;
use super::handler::SubscriptionConfig;
use super::partition::PartitionExit;
use super::partition::PartitionTask;
use crate::error::ClientError;
use crate::error::Result;
use crate::types::Event;
use crate::types::PartitionId;
use crate::types::StartPosition;
use crate::types::TopicName;

type HandleMap = Mutex<HashMap<u64, Arc<HandleInner>>>;

/// Opens topic subscriptions and closes them all on shutdown.
pub struct SubscriptionAggregator {
    ctx: Arc<SubscriptionContext>,
    handles: Arc<HandleMap>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl SubscriptionAggregator {
    pub(crate) fn new(ctx: Arc<SubscriptionContext>, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            handles: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Subscribe to every partition of `topic`.
    ///
    /// Returns once each partition known at call time has an open stream.
    /// If any of them cannot be opened within its re-open budget, the
    /// partitions opened so far are closed again and the call fails.
    pub async fn open(&self, topic: TopicName, config: SubscriptionConfig) -> Result<SubscriptionHandle> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Shutdown);
        }
        if config.name().trim().is_empty() {
            return Err(ClientError::InvalidRequest {
                reason: "subscription name must not be empty".to_string(),
            });
        }

        let partitions = self.ctx.resolver.partitions_of(&topic).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::channel(self.ctx.buffer_size);
        let inner = Arc::new(HandleInner {
            id,
            name: config.name().to_string(),
            topic: topic.clone(),
            start: config.resolve_start(self.ctx.default_start),
            handler: config.handler(),
            cancel: self.shutdown.child_token(),
            events: events_tx,
            acks: Mutex::new(HashMap::new()),
            partitions: Mutex::new(BTreeSet::new()),
            tasks: Mutex::new(Vec::new()),
            ctx: Arc::clone(&self.ctx),
            registry: Arc::downgrade(&self.handles),
        });
        {
            let mut handles = self.handles.lock();
            handles.retain(|_, handle| !handle.cancel.is_cancelled());
            handles.insert(id, Arc::clone(&inner));
        }

        // Dropping the open future part way through closes what it started.
        let guard = inner.cancel.clone().drop_guard();

        let merge = tokio::spawn(Arc::clone(&inner).merge(events_rx));
        inner.tasks.lock().push(merge);

        let pending: Vec<(PartitionId, oneshot::Receiver<Result<()>>)> = partitions
            .iter()
            .filter_map(|partition_id| inner.spawn_partition(*partition_id).map(|ready| (*partition_id, ready)))
            .collect();

        for (partition_id, ready) in pending {
            let outcome = ready.await.unwrap_or(Err(ClientError::Shutdown));
            if let Err(error) = outcome {
                warn!(
                    subscription = %inner.name,
                    %topic,
                    %partition_id,
                    %error,
                    "closing partially opened subscription"
                );
                inner.shutdown().await;
                self.handles.lock().remove(&id);
                return Err(error);
            }
        }

        let discovery = tokio::spawn(Arc::clone(&inner).discover());
        inner.tasks.lock().push(discovery);
        guard.disarm();

        info!(
            subscription = %inner.name,
            %topic,
            partitions = partitions.len(),
            start = ?inner.start,
            "subscription opened"
        );
        Ok(SubscriptionHandle { inner })
    }

    /// Number of subscriptions not yet closed.
    pub fn open_count(&self) -> usize {
        self.handles.lock().values().filter(|handle| !handle.cancel.is_cancelled()).count()
    }

    /// Close every subscription and wait for their tasks to stop.
    pub async fn close_all(&self) {
        let handles: Vec<Arc<HandleInner>> = self.handles.lock().drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

impl std::fmt::Debug for SubscriptionAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionAggregator").field("open", &self.open_count()).finish()
    }
}

/// An open topic subscription.
///
/// Clones refer to the same subscription. Dropping the handle does not
/// close it; call [`SubscriptionHandle::close`], or close the client.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &TopicName {
        &self.inner.topic
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Partitions currently subscribed, including ones discovered after open.
    pub fn partitions(&self) -> BTreeSet<PartitionId> {
        self.inner.partitions.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Close every partition stream of this subscription.
    pub async fn close(&self) {
        self.inner.shutdown().await;
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.lock().remove(&self.inner.id);
        }
        info!(subscription = %self.inner.name, topic = %self.inner.topic, "subscription closed");
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("topic", &self.inner.topic)
            .field("partitions", &self.partitions())
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct HandleInner {
    id: u64,
    name: String,
    topic: TopicName,
    start: StartPosition,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
    /// Merge point shared by every partition task.
    events: mpsc::Sender<Event>,
    /// Acknowledgement channel of each partition task.
    acks: Mutex<HashMap<PartitionId, mpsc::UnboundedSender<u64>>>,
    partitions: Mutex<BTreeSet<PartitionId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ctx: Arc<SubscriptionContext>,
    /// The aggregator's handle map, left on close.
    registry: Weak<HandleMap>,
}

impl HandleInner {
    /// Start a partition task unless the partition is already subscribed.
    ///
    /// A partition whose task gives up is forgotten again, so discovery may
    /// subscribe to it afresh.
    fn spawn_partition(self: &Arc<Self>, partition_id: PartitionId) -> Option<oneshot::Receiver<Result<()>>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let mut partitions = self.partitions.lock();
        if !partitions.insert(partition_id) {
            return None;
        }

        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        self.acks.lock().insert(partition_id, ack_tx);
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = PartitionTask {
            ctx: Arc::clone(&self.ctx),
            name: self.name.clone(),
            topic: self.topic.clone(),
            partition_id,
            start: self.start,
            events: self.events.clone(),
            acks: ack_rx,
            handler: Arc::clone(&self.handler),
            cancel: self.cancel.clone(),
            ready: Some(ready_tx),
        };
        let inner = Arc::clone(self);
        self.tasks.lock().push(tokio::spawn(async move {
            if task.run().await == PartitionExit::GaveUp {
                inner.forget_partition(partition_id);
            }
        }));
        Some(ready_rx)
    }

    fn forget_partition(&self, partition_id: PartitionId) {
        let mut partitions = self.partitions.lock();
        partitions.remove(&partition_id);
        self.acks.lock().remove(&partition_id);
        debug!(subscription = %self.name, %partition_id, "partition dropped from subscription");
    }

    /// Invoke the handler for merged events, one at a time.
    async fn merge(self: Arc<Self>, mut events: mpsc::Receiver<Event>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let partition_id = event.partition_id;
            let position = event.position;
            self.handler.on_event(event);
            if let Some(ack) = self.acks.lock().get(&partition_id) {
                let _ = ack.send(position);
            }
        }
        debug!(subscription = %self.name, "merge task stopped");
    }

    /// Pick up partitions added to the topic after open.
    async fn discover(self: Arc<Self>) {
        let mut topology = self.ctx.cache.subscribe();
        let period = self.ctx.discovery_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // The first pass covers snapshots installed while open was waiting.
            let snapshot = topology.borrow_and_update().clone();
            if let Some(known) = snapshot.partitions_of(&self.topic) {
                for partition_id in known {
                    if self.spawn_partition(*partition_id).is_some() {
                        info!(subscription = %self.name, topic = %self.topic, %partition_id, "subscribing to new partition");
                    }
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                changed = topology.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if !self.poll_topology().await {
                        break;
                    }
                }
            }
        }
        debug!(subscription = %self.name, "partition discovery stopped");
    }

    /// Periodic forced refresh. Returns `false` once the handle is closed.
    async fn poll_topology(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            outcome = self.ctx.coordinator.refresh() => {
                if let Err(error) = outcome {
                    debug!(subscription = %self.name, %error, "partition discovery refresh failed");
                }
                true
            }
        }
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        loop {
            let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                match task.await {
                    Err(error) if error.is_panic() => {
                        warn!(subscription = %self.name, "subscription task panicked");
                    }
                    _ => {}
                }
            }
        }
        self.acks.lock().clear();
    }
}
