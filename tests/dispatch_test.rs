//! Command dispatch against a known topology.

mod support;

use std::time::Duration;

use fjord_client::ClientError;
use fjord_client::EventType;
use fjord_client::TransportError;
use fjord_testing::StubBroker;
use fjord_testing::wait_until;
use fjord_time::SimulatedTimeProvider;
use support::TEST_TIMEOUT;
use support::advance_until_complete;
use support::broker_address;
use support::init_tracing;
use support::start_client;
use support::test_config;

const DEFAULT_TOPIC: &str = "default-topic";

async fn ready_cluster() -> (StubBroker, SimulatedTimeProvider, fjord_client::FjordClient) {
    init_tracing();
    let broker = StubBroker::new(broker_address());
    broker.add_partition(DEFAULT_TOPIC, 0u32);
    broker.add_partition(DEFAULT_TOPIC, 1u32);
    broker.stub_topology_request();
    let clock = SimulatedTimeProvider::pinned();
    let client = start_client(&broker, &clock, test_config());
    assert!(wait_until(TEST_TIMEOUT, || !client.topology().is_empty()).await);
    (broker, clock, client)
}

#[tokio::test]
async fn test_command_routed_to_partition_leader() {
    let (broker, _clock, client) = ready_cluster().await;
    broker.on_execute_command(EventType::Task, "CREATE").respond_with_state("CREATED");

    let command = client.command(1u32, EventType::Task, "CREATE").with_key(42).with_payload(b"{}".to_vec());
    let response = client.dispatch(command).await.unwrap();

    assert_eq!(response.state, "CREATED");
    assert_eq!(response.key, 42);
    let received = broker.received_commands();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, b"{}".to_vec());
    assert_eq!(broker.received_topology_requests(), 1);

    client.close().await;
}

#[tokio::test]
async fn test_broker_rejection_keeps_topology() {
    let (broker, _clock, client) = ready_cluster().await;
    broker.on_execute_command(EventType::Task, "COMPLETE").respond_with_error("INVALID_STATE", "task is not locked");

    let error = client.dispatch(client.command(0u32, EventType::Task, "COMPLETE")).await.unwrap_err();

    match error {
        ClientError::Transport {
            source: TransportError::Rejected { code, message },
        } => {
            assert_eq!(code, "INVALID_STATE");
            assert_eq!(message, "task is not locked");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!client.topology().is_empty());
    assert_eq!(broker.received_topology_requests(), 1);

    client.close().await;
}

#[tokio::test]
async fn test_request_timeout_invalidates_topology() {
    let (broker, clock, client) = ready_cluster().await;
    broker.on_execute_command(EventType::Task, "CREATE").do_not_respond();

    let future = client.dispatch(client.command(0u32, EventType::Task, "CREATE"));
    let error = advance_until_complete(&clock, Duration::from_secs(5), future).await.unwrap_err();

    assert!(
        matches!(error, ClientError::RequestTimeout { timeout_secs: 15, .. }),
        "unexpected error: {error:?}"
    );
    assert!(client.topology().is_empty());

    // The retry re-resolves the leader through a fresh query.
    broker.on_execute_command(EventType::Task, "CREATE").respond_with_state("CREATED");
    let response = tokio::time::timeout(TEST_TIMEOUT, client.dispatch(client.command(0u32, EventType::Task, "CREATE")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.state, "CREATED");
    assert_eq!(broker.received_topology_requests(), 2);

    client.close().await;
}

#[tokio::test]
async fn test_close_fails_pending_commands() {
    let (broker, _clock, client) = ready_cluster().await;
    broker.on_execute_command(EventType::Task, "CREATE").do_not_respond();

    let future = client.dispatch(client.command(0u32, EventType::Task, "CREATE"));
    assert!(wait_until(TEST_TIMEOUT, || broker.received_commands().len() == 1).await);

    client.close().await;
    let outcome = tokio::time::timeout(TEST_TIMEOUT, future).await.unwrap();
    assert!(matches!(outcome, Err(ClientError::Shutdown)));

    let late = client.dispatch(client.command(0u32, EventType::Task, "CREATE")).await;
    assert!(matches!(late, Err(ClientError::Shutdown)));

    // Closing again is harmless.
    client.close().await;
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_close_fails_commands_waiting_for_a_leader() {
    init_tracing();
    let broker = StubBroker::new(broker_address());
    let clock = SimulatedTimeProvider::pinned();
    let client = start_client(&broker, &clock, test_config());

    let future = client.dispatch(client.command(5u32, EventType::Task, "CREATE"));
    assert!(wait_until(TEST_TIMEOUT, || broker.received_topology_requests() == 1).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.close().await;
    let outcome = tokio::time::timeout(TEST_TIMEOUT, future).await.unwrap();
    assert!(matches!(outcome, Err(ClientError::Shutdown)));
}

#[tokio::test]
async fn test_empty_command_name_is_rejected_locally() {
    let (broker, _clock, client) = ready_cluster().await;

    let error = client.dispatch(client.command(0u32, EventType::Task, "  ")).await.unwrap_err();

    assert!(matches!(error, ClientError::InvalidRequest { .. }));
    assert!(broker.received_commands().is_empty());

    client.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_blocks_until_result() {
    let (broker, _clock, client) = ready_cluster().await;
    broker.on_execute_command(EventType::Workflow, "DEPLOY").respond_with_state("DEPLOYED");

    let future = client.dispatch(client.command(1u32, EventType::Workflow, "DEPLOY"));
    let response = tokio::task::spawn_blocking(move || future.wait()).await.unwrap().unwrap();
    assert_eq!(response.state, "DEPLOYED");

    client.close().await;
}
