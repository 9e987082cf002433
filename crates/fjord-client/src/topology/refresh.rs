//! Single-flight topology refresh.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use fjord_time::SharedTimeProvider;
use fjord_time::duration_to_ms;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::TopologyCache;
use super::TopologySnapshot;
use crate::error::ClientError;
use crate::pending::Completion;
use crate::pending::PendingRequestRegistry;
use crate::pending::RequestKind;
use crate::transport::BrokerTransport;
use crate::transport::TopologyResponse;
use crate::types::BrokerAddress;

/// Result shared by every caller joined on one refresh.
pub type RefreshOutcome = Result<Arc<TopologySnapshot>, ClientError>;

type InFlight = watch::Receiver<Option<RefreshOutcome>>;

/// Issues topology queries on behalf of every component of the client.
///
/// At most one query is outstanding at a time. Callers arriving while a
/// query is in flight wait for that query's outcome instead of issuing
/// their own. The query itself runs on a spawned task so a caller giving
/// up does not cancel it for the others.
pub struct RefreshCoordinator {
    transport: Arc<dyn BrokerTransport>,
    cache: Arc<TopologyCache>,
    registry: Arc<PendingRequestRegistry<TopologyResponse>>,
    clock: SharedTimeProvider,
    contacts: Vec<BrokerAddress>,
    next_contact: AtomicUsize,
    refresh_timeout: Duration,
    in_flight: Mutex<Option<InFlight>>,
    queries_issued: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        cache: Arc<TopologyCache>,
        registry: Arc<PendingRequestRegistry<TopologyResponse>>,
        clock: SharedTimeProvider,
        contacts: Vec<BrokerAddress>,
        refresh_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            cache,
            registry,
            clock,
            contacts,
            next_contact: AtomicUsize::new(0),
            refresh_timeout,
            in_flight: Mutex::new(None),
            queries_issued: AtomicU64::new(0),
        })
    }

    /// Refresh the topology, joining the in-flight query if there is one.
    ///
    /// On success the new snapshot is already installed in the cache when
    /// this returns.
    pub async fn refresh(self: &Arc<Self>) -> RefreshOutcome {
        let mut outcome_rx = self.join_or_start();
        let outcome = match outcome_rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            // The query task was dropped with the runtime.
            Err(_) => None,
        };
        outcome.unwrap_or(Err(ClientError::Shutdown))
    }

    /// Whether a query is outstanding right now.
    pub fn is_refreshing(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Number of topology queries sent since creation.
    pub fn queries_issued(&self) -> u64 {
        self.queries_issued.load(Ordering::Relaxed)
    }

    pub fn refresh_timeout(&self) -> Duration {
        self.refresh_timeout
    }

    fn join_or_start(self: &Arc<Self>) -> InFlight {
        let mut slot = self.in_flight.lock();
        if let Some(rx) = slot.as_ref() {
            debug!("joining in-flight topology refresh");
            return rx.clone();
        }

        let (tx, rx) = watch::channel(None);
        *slot = Some(rx.clone());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = this.query().await;
            // Clear the slot before publishing so that anyone woken by the
            // outcome and refreshing again starts a fresh query.
            this.in_flight.lock().take();
            tx.send_replace(Some(outcome));
        });
        rx
    }

    async fn query(&self) -> RefreshOutcome {
        let Some(contact) = self.next_contact() else {
            return Err(ClientError::InvalidRequest {
                reason: "no bootstrap brokers configured".to_string(),
            });
        };
        let issued = self.queries_issued.fetch_add(1, Ordering::Relaxed) + 1;
        let mut pending = self.registry.register(RequestKind::Topology, self.refresh_timeout);
        debug!(%contact, request_id = pending.id(), issued, "requesting topology");

        let send = {
            let transport = Arc::clone(&self.transport);
            let registry = Arc::clone(&self.registry);
            let request_id = pending.id();
            let contact = contact.clone();
            tokio::spawn(async move {
                let result = transport
                    .request_topology(&contact)
                    .await
                    .map_err(|source| ClientError::RefreshFailed { source });
                registry.resolve(request_id, result);
            })
        };

        let completion = pending.wait().await;
        send.abort();

        match completion {
            Completion::Response(response) => {
                let snapshot = Arc::new(TopologySnapshot::from_response(response, self.clock.now_unix_ms()));
                info!(
                    %contact,
                    partitions = snapshot.partition_count(),
                    "topology refreshed"
                );
                self.cache.install(Arc::clone(&snapshot));
                Ok(snapshot)
            }
            Completion::Expired => {
                let timeout_ms = duration_to_ms(self.refresh_timeout);
                warn!(%contact, timeout_ms, "topology request timed out");
                Err(ClientError::RefreshTimeout { timeout_ms })
            }
            Completion::Failed(error) => {
                if !error.is_shutdown() {
                    warn!(%contact, %error, "topology request failed");
                }
                Err(error)
            }
        }
    }

    fn next_contact(&self) -> Option<BrokerAddress> {
        if self.contacts.is_empty() {
            return None;
        }
        let index = self.next_contact.fetch_add(1, Ordering::Relaxed) % self.contacts.len();
        self.contacts.get(index).cloned()
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("contacts", &self.contacts)
            .field("refresh_timeout", &self.refresh_timeout)
            .field("queries_issued", &self.queries_issued())
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}
