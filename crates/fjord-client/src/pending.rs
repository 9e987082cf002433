//! Correlation of outstanding requests with their outcome.
//!
//! Every request the client waits on (topology queries, commands, and the
//! bounded wait for a partition leader) is registered here with an absolute
//! deadline read from the client's [`TimeProvider`]. The outcome arrives in
//! exactly one of three ways:
//!
//! - the transport path calls [`PendingRequestRegistry::resolve`],
//! - the timeout sweep calls [`PendingRequestRegistry::expire`],
//! - shutdown calls [`PendingRequestRegistry::cancel_all`].
//!
//! Whichever comes first removes the entry under the registry lock and
//! completes the waiter; the others find nothing and return `false`.
//! Dropping a [`PendingRequest`] deregisters it, so an abandoned wait
//! leaves nothing behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use fjord_time::SharedTimeProvider;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use crate::error::ClientError;
use crate::types::PartitionId;
use crate::types::TopicName;

/// Identifier of a registered request, unique per registry.
pub type RequestId = u64;

/// What a registered deadline is guarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// A topology query.
    Topology,
    /// A command sent to a partition leader.
    Command { partition_id: PartitionId },
    /// The wait for a partition's leader to become known.
    LeaderResolution { partition_id: PartitionId },
    /// The wait for a topic's partition set to become known.
    TopicResolution { topic: TopicName },
}

/// How a pending request ended.
#[derive(Debug)]
pub enum Completion<T> {
    /// The transport delivered a response.
    Response(T),
    /// The request failed, or the registry was shut down.
    Failed(ClientError),
    /// The deadline passed first.
    Expired,
}

struct Entry<T> {
    kind: RequestKind,
    deadline_ms: u64,
    tx: oneshot::Sender<Completion<T>>,
}

struct RegistryState<T> {
    entries: HashMap<RequestId, Entry<T>>,
    /// Set by `cancel_all`; later registrations fail immediately with it.
    closed: Option<ClientError>,
}

/// Registry of outstanding requests whose responses have type `T`.
pub struct PendingRequestRegistry<T> {
    state: Mutex<RegistryState<T>>,
    next_id: AtomicU64,
    clock: SharedTimeProvider,
}

impl<T: Send + 'static> PendingRequestRegistry<T> {
    pub fn new(clock: SharedTimeProvider) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState {
                entries: HashMap::new(),
                closed: None,
            }),
            next_id: AtomicU64::new(1),
            clock,
        })
    }

    /// Register a request with deadline `now + timeout`.
    pub fn register(self: &Arc<Self>, kind: RequestKind, timeout: Duration) -> PendingRequest<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let submitted_at_ms = self.clock.now_unix_ms();
        let deadline_ms = self.clock.deadline_after(timeout);
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state.lock();
            if let Some(reason) = state.closed.clone() {
                let _ = tx.send(Completion::Failed(reason));
            } else {
                state.entries.insert(id, Entry {
                    kind: kind.clone(),
                    deadline_ms,
                    tx,
                });
            }
        }

        trace!(request_id = id, ?kind, deadline_ms, "registered pending request");

        PendingRequest {
            id,
            kind,
            submitted_at_ms,
            deadline_ms,
            rx: Some(rx),
            registry: Arc::downgrade(self),
        }
    }

    /// Complete a request with the transport's outcome.
    ///
    /// Returns `false` if the request already completed, expired, or was dropped.
    pub fn resolve(&self, id: RequestId, result: Result<T, ClientError>) -> bool {
        let Some(entry) = self.state.lock().entries.remove(&id) else {
            trace!(request_id = id, "ignoring resolution of finished request");
            return false;
        };
        let completion = match result {
            Ok(response) => Completion::Response(response),
            Err(error) => Completion::Failed(error),
        };
        let _ = entry.tx.send(completion);
        true
    }

    /// Fail a request because its deadline passed.
    pub fn expire(&self, id: RequestId) -> bool {
        let Some(entry) = self.state.lock().entries.remove(&id) else {
            return false;
        };
        debug!(request_id = id, kind = ?entry.kind, "pending request expired");
        let _ = entry.tx.send(Completion::Expired);
        true
    }

    /// Expire every request whose deadline is at or before `now_ms`.
    pub fn expire_overdue(&self, now_ms: u64) -> usize {
        let overdue: Vec<RequestId> = {
            let state = self.state.lock();
            state.entries.iter().filter(|(_, entry)| entry.deadline_ms <= now_ms).map(|(id, _)| *id).collect()
        };
        overdue.into_iter().filter(|id| self.expire(*id)).count()
    }

    /// Fail every outstanding request and refuse new ones.
    pub fn cancel_all(&self, reason: ClientError) -> usize {
        let drained: Vec<Entry<T>> = {
            let mut state = self.state.lock();
            state.closed = Some(reason.clone());
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Completion::Failed(reason.clone()));
        }
        count
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> std::fmt::Debug for PendingRequestRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequestRegistry").field("outstanding", &self.len()).finish()
    }
}

/// A registered request awaiting its completion.
///
/// Dropping it before completion removes the registration.
pub struct PendingRequest<T> {
    id: RequestId,
    kind: RequestKind,
    submitted_at_ms: u64,
    deadline_ms: u64,
    rx: Option<oneshot::Receiver<Completion<T>>>,
    registry: Weak<PendingRequestRegistry<T>>,
}

impl<T> std::fmt::Debug for PendingRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("submitted_at_ms", &self.submitted_at_ms)
            .field("deadline_ms", &self.deadline_ms)
            .finish()
    }
}

impl<T> PendingRequest<T> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub fn submitted_at_ms(&self) -> u64 {
        self.submitted_at_ms
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    /// Wait for the completion.
    ///
    /// Cancel-safe. Once a completion has been returned, later calls return
    /// `Failed(Shutdown)` without waiting.
    pub async fn wait(&mut self) -> Completion<T> {
        let Some(rx) = self.rx.as_mut() else {
            return Completion::Failed(ClientError::Shutdown);
        };
        let completion = match rx.await {
            Ok(completion) => completion,
            Err(_) => Completion::Failed(ClientError::Shutdown),
        };
        self.rx = None;
        completion
    }
}

impl<T> Drop for PendingRequest<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.id);
        }
    }
}

/// Deadline tracking shared by registries of different response types.
pub trait Expirable: Send + Sync {
    /// Expire every request whose deadline is at or before `now_ms`.
    fn expire_overdue(&self, now_ms: u64) -> usize;

    /// Fail every outstanding request and refuse new ones.
    fn cancel_all(&self, reason: ClientError) -> usize;
}

impl<T: Send + 'static> Expirable for PendingRequestRegistry<T> {
    fn expire_overdue(&self, now_ms: u64) -> usize {
        PendingRequestRegistry::expire_overdue(self, now_ms)
    }

    fn cancel_all(&self, reason: ClientError) -> usize {
        PendingRequestRegistry::cancel_all(self, reason)
    }
}

/// Spawn the periodic timeout sweep over `registries`.
///
/// Runs until `cancel` fires. The sweep period is real time; what counts as
/// overdue is decided by `clock`, so a simulated clock advanced past a
/// deadline is noticed within one period.
pub fn spawn_timeout_sweeper(
    registries: Vec<Arc<dyn Expirable>>,
    clock: SharedTimeProvider,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now_ms = clock.now_unix_ms();
                    let expired: usize = registries.iter().map(|r| r.expire_overdue(now_ms)).sum();
                    if expired > 0 {
                        debug!(expired, now_ms, "timeout sweep expired requests");
                    }
                }
            }
        }
        debug!("timeout sweeper stopped");
    })
}

impl<T> PendingRequestRegistry<T> {
    fn deregister(&self, id: RequestId) {
        self.state.lock().entries.remove(&id);
    }

    #[cfg(test)]
    fn contains(&self, id: RequestId) -> bool {
        self.state.lock().entries.contains_key(&id)
    }
}
