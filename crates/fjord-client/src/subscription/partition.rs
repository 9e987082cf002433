//! One partition's share of a topic subscription.
//!
//! A partition task owns the stream of a single partition. It resolves the
//! partition leader, opens the stream, forwards events to the handle's merge
//! point and relays acknowledgements back. When the stream breaks it forces
//! a topology refresh and re-opens after the last forwarded position, without
//! involving the sibling partitions.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use super::SubscriptionContext;
use super::handler::EventHandler;
use crate::error::ClientError;
use crate::transport::EventSource;
use crate::transport::PartitionSubscriptionRequest;
use crate::types::Event;
use crate::types::EventType;
use crate::types::PartitionId;
use crate::types::StartPosition;
use crate::types::TopicName;

/// Reported once, after the first successful open or the first give-up.
pub(crate) type ReadySignal = oneshot::Sender<Result<(), ClientError>>;

pub(crate) struct PartitionTask {
    pub(crate) ctx: Arc<SubscriptionContext>,
    pub(crate) name: String,
    pub(crate) topic: TopicName,
    pub(crate) partition_id: PartitionId,
    pub(crate) start: StartPosition,
    pub(crate) events: mpsc::Sender<Event>,
    pub(crate) acks: mpsc::UnboundedReceiver<u64>,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) cancel: CancellationToken,
    pub(crate) ready: Option<ReadySignal>,
}

/// Why a partition task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartitionExit {
    /// The subscription was closed.
    Closed,
    /// The partition exhausted its re-open budget.
    GaveUp,
}

enum Step {
    Cancel,
    Ack(u64),
    Next(Option<Result<Event, crate::error::TransportError>>),
}

enum StreamEnd {
    Cancelled,
    Broken(String),
}

impl PartitionTask {
    pub(crate) async fn run(mut self) -> PartitionExit {
        let mut last_forwarded: Option<u64> = None;
        // Where the stream resumes if nothing was forwarded yet. Pinned to a
        // concrete position once a broker reports one.
        let mut resume = self.start;
        let mut failures: u32 = 0;

        let exit = loop {
            let start = match last_forwarded {
                Some(position) => StartPosition::Sequence(position.saturating_add(1)),
                None => resume,
            };

            let reason = match self.open(start).await {
                Ok(Some(mut source)) => {
                    if let (None, Some(first)) = (last_forwarded, source.first_position()) {
                        resume = StartPosition::Sequence(first);
                    }
                    self.signal_ready(Ok(()));
                    let end = self.pump(source.as_mut(), &mut last_forwarded, &mut failures).await;
                    source.close().await;
                    match end {
                        StreamEnd::Cancelled => break PartitionExit::Closed,
                        StreamEnd::Broken(reason) => reason,
                    }
                }
                Ok(None) => break PartitionExit::Closed,
                Err(ClientError::Shutdown) => break PartitionExit::Closed,
                Err(error) => error.to_string(),
            };

            failures += 1;
            if failures > self.ctx.reopen_attempts {
                self.give_up(reason);
                break PartitionExit::GaveUp;
            }
            warn!(
                subscription = %self.name,
                topic = %self.topic,
                partition_id = %self.partition_id,
                attempt = failures,
                %reason,
                "partition stream failed, re-opening"
            );
            if !self.recover().await {
                break PartitionExit::Closed;
            }
        };

        debug!(subscription = %self.name, partition_id = %self.partition_id, ?exit, "partition task stopped");
        exit
    }

    /// Resolve the leader and open the stream. `Ok(None)` means cancelled.
    async fn open(&self, start: StartPosition) -> Result<Option<Box<dyn EventSource>>, ClientError> {
        let attempt = async {
            let leader = self
                .ctx
                .resolver
                .leader_for(self.partition_id, || ClientError::LeaderUnresolved {
                    topic: self.topic.clone(),
                    partition_id: self.partition_id,
                    timeout_secs: self.ctx.resolver.budget_secs(),
                    event_type: EventType::Subscription,
                })
                .await?;
            let request = PartitionSubscriptionRequest {
                name: self.name.clone(),
                topic: self.topic.clone(),
                partition_id: self.partition_id,
                start_position: start,
            };
            debug!(
                subscription = %self.name,
                partition_id = %self.partition_id,
                %leader,
                ?start,
                "opening partition stream"
            );
            self.ctx
                .transport
                .open_subscription(&leader, &request)
                .await
                .map_err(|source| ClientError::Transport { source })
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(None),
            opened = attempt => opened.map(Some),
        }
    }

    async fn pump(
        &mut self,
        source: &mut dyn EventSource,
        last_forwarded: &mut Option<u64>,
        failures: &mut u32,
    ) -> StreamEnd {
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancel,
                ack = self.acks.recv() => match ack {
                    Some(position) => Step::Ack(position),
                    None => Step::Cancel,
                },
                next = source.next_event() => Step::Next(next),
            };

            let event = match step {
                Step::Cancel => return StreamEnd::Cancelled,
                Step::Ack(position) => {
                    if let Err(error) = source.acknowledge(position).await {
                        debug!(partition_id = %self.partition_id, position, %error, "acknowledgement failed");
                    }
                    continue;
                }
                Step::Next(None) => return StreamEnd::Broken("stream ended by broker".to_string()),
                Step::Next(Some(Err(error))) => return StreamEnd::Broken(error.to_string()),
                Step::Next(Some(Ok(event))) => event,
            };

            if last_forwarded.is_some_and(|last| event.position <= last) {
                trace!(partition_id = %self.partition_id, position = event.position, "dropping replayed event");
                continue;
            }

            let position = event.position;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                sent = self.events.send(event) => {
                    if sent.is_err() {
                        return StreamEnd::Cancelled;
                    }
                }
            }
            *last_forwarded = Some(position);
            *failures = 0;
        }
    }

    /// Force a refresh and pause before the next open. Returns `false` if
    /// the subscription was closed meanwhile.
    async fn recover(&self) -> bool {
        let delay = self.ctx.retry_delay;
        let recovery = async {
            if let Err(error) = self.ctx.coordinator.refresh().await {
                debug!(partition_id = %self.partition_id, %error, "topology refresh after stream failure failed");
            }
            tokio::time::sleep(delay).await;
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = recovery => true,
        }
    }

    fn signal_ready(&mut self, outcome: Result<(), ClientError>) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(outcome);
        }
    }

    fn give_up(&mut self, reason: String) {
        let error = ClientError::SubscriptionFailed {
            name: self.name.clone(),
            topic: self.topic.clone(),
            partition_id: self.partition_id,
            reason,
        };
        error!(
            subscription = %self.name,
            topic = %self.topic,
            partition_id = %self.partition_id,
            %error,
            "partition stream could not be re-opened"
        );
        match self.ready.take() {
            Some(ready) => {
                let _ = ready.send(Err(error));
            }
            None => self.handler.on_partition_failure(self.partition_id, &error),
        }
    }
}
