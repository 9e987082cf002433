//! Routing commands to partition leaders.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error::ClientError;
use crate::error::Result;
use crate::pending::Completion;
use crate::pending::PendingRequestRegistry;
use crate::pending::RequestKind;
use crate::topology::LeaderResolver;
use crate::topology::TopologyCache;
use crate::transport::BrokerTransport;
use crate::types::Command;
use crate::types::CommandResponse;

/// Sends commands to the leader of their partition.
///
/// One call is one attempt. A timed out attempt invalidates the whole
/// topology snapshot and fails; resubmitting re-resolves the leader.
pub struct CommandDispatcher {
    transport: Arc<dyn BrokerTransport>,
    cache: Arc<TopologyCache>,
    resolver: Arc<LeaderResolver>,
    registry: Arc<PendingRequestRegistry<CommandResponse>>,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl CommandDispatcher {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        cache: Arc<TopologyCache>,
        resolver: Arc<LeaderResolver>,
        registry: Arc<PendingRequestRegistry<CommandResponse>>,
        request_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            cache,
            resolver,
            registry,
            request_timeout,
            shutdown,
        }
    }

    /// Send `command` to its partition leader and wait for the response.
    pub async fn dispatch(&self, command: Command) -> Result<CommandResponse> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Shutdown);
        }
        if command.command.trim().is_empty() {
            return Err(ClientError::InvalidRequest {
                reason: "command name must not be empty".to_string(),
            });
        }

        let topic = command.topic.clone();
        let partition_id = command.partition_id;
        let event_type = command.event_type.clone();

        let leader = self
            .resolver
            .leader_for(partition_id, || ClientError::LeaderUnresolved {
                topic: topic.clone(),
                partition_id,
                timeout_secs: self.resolver.budget_secs(),
                event_type: event_type.clone(),
            })
            .await
            .inspect_err(|error| {
                if !error.is_shutdown() {
                    warn!(%topic, %partition_id, %error, "leader resolution failed");
                }
            })?;

        let mut pending = self.registry.register(RequestKind::Command { partition_id }, self.request_timeout);
        debug!(
            %topic,
            %partition_id,
            %leader,
            command = %command.command,
            request_id = pending.id(),
            "sending command"
        );

        let send = {
            let transport = Arc::clone(&self.transport);
            let registry = Arc::clone(&self.registry);
            let request_id = pending.id();
            tokio::spawn(async move {
                let result = transport
                    .execute_command(&leader, &command)
                    .await
                    .map_err(|source| ClientError::Transport { source });
                registry.resolve(request_id, result);
            })
        };

        let completion = pending.wait().await;
        send.abort();

        match completion {
            Completion::Response(response) => Ok(response),
            Completion::Expired => {
                let timeout_secs = self.request_timeout.as_secs();
                warn!(%topic, %partition_id, timeout_secs, "command timed out");
                self.cache.invalidate();
                debug!(%partition_id, "topology invalidated after command timeout");
                Err(ClientError::RequestTimeout {
                    topic,
                    partition_id,
                    timeout_secs,
                    event_type,
                })
            }
            Completion::Failed(error) => Err(error),
        }
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("request_timeout", &self.request_timeout)
            .field("outstanding", &self.registry.len())
            .finish()
    }
}

/// Outcome of a dispatched command.
///
/// Await it from async code, or call [`CommandFuture::wait`] from a thread
/// outside the runtime. Dropping it does not cancel the command.
#[derive(Debug)]
pub struct CommandFuture {
    handle: JoinHandle<Result<CommandResponse>>,
}

impl CommandFuture {
    pub(crate) fn spawn(dispatcher: Arc<CommandDispatcher>, command: Command) -> Self {
        let handle = tokio::spawn(async move { dispatcher.dispatch(command).await });
        Self { handle }
    }

    /// Block the current thread until the command completes.
    ///
    /// Must not be called from within the async runtime.
    pub fn wait(self) -> Result<CommandResponse> {
        futures::executor::block_on(self)
    }

    /// Stop waiting for the command. The future then completes with
    /// [`ClientError::Shutdown`].
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for CommandFuture {
    type Output = Result<CommandResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(error)) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Shutdown)),
        }
    }
}
