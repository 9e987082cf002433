use std::sync::Arc;

use async_trait::async_trait;
use fjord_client::Event;
use fjord_client::EventSource;
use fjord_client::PartitionId;
use fjord_client::TransportError;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::broker::BrokerState;

/// Event stream of one partition of a [`StubBroker`](crate::StubBroker).
pub struct StubEventSource {
    partition_id: PartitionId,
    events: mpsc::UnboundedReceiver<Result<Event, TransportError>>,
    broker: Arc<Mutex<BrokerState>>,
    first_position: u64,
    closed: bool,
}

impl StubEventSource {
    pub(crate) fn new(
        partition_id: PartitionId,
        events: mpsc::UnboundedReceiver<Result<Event, TransportError>>,
        broker: Arc<Mutex<BrokerState>>,
        first_position: u64,
    ) -> Self {
        Self {
            partition_id,
            events,
            broker,
            first_position,
            closed: false,
        }
    }
}

#[async_trait]
impl EventSource for StubEventSource {
    async fn next_event(&mut self) -> Option<Result<Event, TransportError>> {
        if self.closed {
            return None;
        }
        self.events.recv().await
    }

    async fn acknowledge(&mut self, position: u64) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::StreamClosed {
                partition_id: self.partition_id,
                reason: "stream closed by client".to_string(),
            });
        }
        self.broker.lock().acknowledgements.push((self.partition_id, position));
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        self.events.close();
    }

    fn first_position(&self) -> Option<u64> {
        Some(self.first_position)
    }
}
