//! Application-side receivers of subscription events.

use std::sync::Arc;

use crate::error::ClientError;
use crate::types::Event;
use crate::types::PartitionId;
use crate::types::StartPosition;

/// Receives the merged events of a topic subscription.
///
/// Calls are sequential: the handler is never invoked concurrently for the
/// same subscription. Events of one partition arrive in non-decreasing
/// position order; events of different partitions interleave freely.
///
/// Handlers run on the client's runtime and should return quickly.
pub trait EventHandler: Send + Sync + 'static {
    fn on_event(&self, event: Event);

    /// Called when a partition stream failed and could not be re-opened
    /// after the subscription was established. Delivery on the other
    /// partitions continues.
    fn on_partition_failure(&self, _partition_id: PartitionId, _error: &ClientError) {}
}

impl<F> EventHandler for F
where F: Fn(Event) + Send + Sync + 'static
{
    fn on_event(&self, event: Event) {
        self(event)
    }
}

/// Settings of one topic subscription.
#[derive(Clone)]
pub struct SubscriptionConfig {
    name: String,
    start_position: Option<StartPosition>,
    handler: Arc<dyn EventHandler>,
}

impl SubscriptionConfig {
    /// A subscription named `name` delivering to `handler`, starting at the
    /// client's configured default position.
    pub fn new(name: impl Into<String>, handler: impl EventHandler) -> Self {
        Self {
            name: name.into(),
            start_position: None,
            handler: Arc::new(handler),
        }
    }

    /// Deliver every event still retained by the broker.
    pub fn start_at_head(self) -> Self {
        self.start_position(StartPosition::Head)
    }

    /// Deliver only events written after the subscription opened.
    pub fn start_at_tail(self) -> Self {
        self.start_position(StartPosition::Tail)
    }

    /// Deliver events from `position` on, in every partition.
    pub fn start_at_position(self, position: u64) -> Self {
        self.start_position(StartPosition::Sequence(position))
    }

    pub fn start_position(mut self, start_position: StartPosition) -> Self {
        self.start_position = Some(start_position);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn resolve_start(&self, default: StartPosition) -> StartPosition {
        self.start_position.unwrap_or(default)
    }

    pub(crate) fn handler(&self) -> Arc<dyn EventHandler> {
        Arc::clone(&self.handler)
    }
}

impl std::fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("name", &self.name)
            .field("start_position", &self.start_position)
            .finish_non_exhaustive()
    }
}
