//! Testing infrastructure for the fjord client.
//!
//! - [`StubBroker`]: an in-memory cluster implementing
//!   [`BrokerTransport`](fjord_client::BrokerTransport). Topology queries,
//!   commands and subscriptions are answered as stubbed; every request is
//!   journaled for assertions.
//! - [`wait_until`]: poll a condition instead of sleeping a fixed time.
//!
//! Pair the stub with `fjord_time::SimulatedTimeProvider` to drive timeouts
//! without waiting for them.

mod broker;
mod source;

use std::time::Duration;

pub use broker::CommandStubBuilder;
pub use broker::StubBroker;
pub use broker::TopologyStubBuilder;
pub use source::StubEventSource;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
