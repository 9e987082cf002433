//! Shared setup for the client integration tests.
//!
//! Every test runs a [`FjordClient`] against a [`StubBroker`] with a pinned
//! simulated clock. Timeouts fire only when a test advances the clock.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use fjord_client::BrokerAddress;
use fjord_client::ClientConfig;
use fjord_client::FjordClient;
use fjord_testing::StubBroker;
use fjord_time::SimulatedTimeProvider;

/// Real-time bound on any single wait in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("fjord_client=debug,fjord_testing=debug").try_init();
}

pub fn broker_address() -> BrokerAddress {
    BrokerAddress::new("127.0.0.1", 51015)
}

/// Configuration tuned for tests: fast sweeps and retries.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        bootstrap_brokers: vec![broker_address().to_string()],
        timeout_sweep_interval_ms: 5,
        refresh_retry_delay_ms: 10,
        ..ClientConfig::default()
    }
}

pub fn start_client(broker: &StubBroker, clock: &SimulatedTimeProvider, config: ClientConfig) -> FjordClient {
    FjordClient::builder(broker.transport())
        .config(config)
        .time_provider(clock.shared())
        .build()
        .expect("test configuration is valid")
}

/// Advance the simulated clock by `step` until `future` completes.
pub async fn advance_until_complete<F>(clock: &SimulatedTimeProvider, step: Duration, mut future: F) -> F::Output
where F: Future + Unpin {
    for _ in 0..120 {
        if let Ok(output) = tokio::time::timeout(Duration::from_millis(25), &mut future).await {
            return output;
        }
        clock.advance(step);
    }
    panic!("future did not complete while advancing the clock");
}
