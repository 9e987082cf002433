//! Topic subscriptions spanning several partitions.
//!
//! # Test Categories
//!
//! 1. **Merging** - every partition's events reach the handler exactly once
//! 2. **Ordering** - per-partition order and acknowledgements
//! 3. **Partition failures** - leader moves and exhausted re-opens stay local
//! 4. **Lifecycle** - partial opens, close, discovery of new partitions

mod support;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fjord_client::BrokerAddress;
use fjord_client::ClientConfig;
use fjord_client::ClientError;
use fjord_client::Event;
use fjord_client::EventHandler;
use fjord_client::EventType;
use fjord_client::FjordClient;
use fjord_client::PartitionId;
use fjord_client::StartPosition;
use fjord_client::SubscriptionConfig;
use fjord_client::TopicName;
use fjord_testing::StubBroker;
use fjord_testing::wait_until;
use fjord_time::SimulatedTimeProvider;
use parking_lot::Mutex;
use support::TEST_TIMEOUT;
use support::broker_address;
use support::init_tracing;
use support::start_client;
use support::test_config;

const TOPIC: &str = "orders";

/// Records everything the subscription hands over.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    failures: Mutex<Vec<(PartitionId, String)>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.events.lock().len()
    }

    fn positions_by_partition(&self) -> BTreeMap<PartitionId, Vec<u64>> {
        let mut positions: BTreeMap<PartitionId, Vec<u64>> = BTreeMap::new();
        for event in self.events.lock().iter() {
            positions.entry(event.partition_id).or_default().push(event.position);
        }
        positions
    }

    fn positions_of(&self, partition_id: u32) -> Vec<u64> {
        self.positions_by_partition().remove(&PartitionId(partition_id)).unwrap_or_default()
    }
}

/// Shares one [`Recorder`] with the client.
struct Recording(Arc<Recorder>);

impl EventHandler for Recording {
    fn on_event(&self, event: Event) {
        self.0.events.lock().push(event);
    }

    fn on_partition_failure(&self, partition_id: PartitionId, error: &ClientError) {
        self.0.failures.lock().push((partition_id, error.to_string()));
    }
}

fn cluster(partitions: u32) -> StubBroker {
    init_tracing();
    let broker = StubBroker::new(broker_address());
    for partition in 0..partitions {
        broker.add_partition(TOPIC, partition);
    }
    broker.stub_topology_request();
    broker
}

fn subscription(recorder: &Arc<Recorder>) -> SubscriptionConfig {
    SubscriptionConfig::new("audit", Recording(Arc::clone(recorder))).start_at_head()
}

async fn connected(broker: &StubBroker, config: ClientConfig) -> FjordClient {
    let client = start_client(broker, &SimulatedTimeProvider::pinned(), config);
    assert!(wait_until(TEST_TIMEOUT, || !client.topology().is_empty()).await);
    client
}

#[tokio::test]
async fn test_events_of_every_partition_delivered_once() {
    let broker = cluster(3);
    for partition in 0..3u32 {
        broker.publish_event(partition, EventType::Task, "CREATED");
    }
    let client = connected(&broker, test_config()).await;
    let recorder = Arc::new(Recorder::default());

    let handle = client.open_subscription(TOPIC, subscription(&recorder)).await.unwrap();

    assert!(wait_until(TEST_TIMEOUT, || recorder.count() == 3).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(), 3);
    let positions = recorder.positions_by_partition();
    assert_eq!(positions.len(), 3);
    assert!(positions.values().all(|positions| positions == &vec![1]));
    assert_eq!(handle.partitions().len(), 3);
    assert!(recorder.events.lock().iter().all(|event| event.state == "CREATED"));

    client.close().await;
}

#[tokio::test]
async fn test_partition_order_and_acknowledgements() {
    let broker = cluster(2);
    let client = connected(&broker, test_config()).await;
    let recorder = Arc::new(Recorder::default());
    let _handle = client.open_subscription(TOPIC, subscription(&recorder)).await.unwrap();

    for _ in 0..5 {
        broker.publish_event(0u32, EventType::Task, "CREATED");
        broker.publish_event(1u32, EventType::Task, "COMPLETED");
    }

    assert!(wait_until(TEST_TIMEOUT, || recorder.count() == 10).await);
    assert_eq!(recorder.positions_of(0), vec![1, 2, 3, 4, 5]);
    assert_eq!(recorder.positions_of(1), vec![1, 2, 3, 4, 5]);
    assert!(wait_until(TEST_TIMEOUT, || broker.acknowledged(0u32).len() == 5).await);
    assert_eq!(broker.acknowledged(0u32), vec![1, 2, 3, 4, 5]);
    assert!(wait_until(TEST_TIMEOUT, || broker.acknowledged(1u32).len() == 5).await);

    client.close().await;
}

#[tokio::test]
async fn test_start_at_tail_skips_history() {
    let broker = cluster(1);
    broker.publish_event(0u32, EventType::Task, "CREATED");
    broker.publish_event(0u32, EventType::Task, "CREATED");
    let client = connected(&broker, test_config()).await;
    let recorder = Arc::new(Recorder::default());

    let config = SubscriptionConfig::new("audit", Recording(Arc::clone(&recorder))).start_at_tail();
    let _handle = client.open_subscription(TOPIC, config).await.unwrap();
    broker.publish_event(0u32, EventType::Task, "COMPLETED");

    assert!(wait_until(TEST_TIMEOUT, || recorder.count() == 1).await);
    assert_eq!(recorder.positions_of(0), vec![3]);
    let opens = broker.subscription_opens();
    assert_eq!(opens[0].1.start_position, StartPosition::Tail);

    client.close().await;
}

#[tokio::test]
async fn test_leader_move_reopens_one_partition() {
    let broker = cluster(2);
    let client = connected(&broker, test_config()).await;
    let recorder = Arc::new(Recorder::default());
    let _handle = client.open_subscription(TOPIC, subscription(&recorder)).await.unwrap();

    for _ in 0..2 {
        broker.publish_event(0u32, EventType::Task, "CREATED");
        broker.publish_event(1u32, EventType::Task, "CREATED");
    }
    assert!(wait_until(TEST_TIMEOUT, || recorder.count() == 4).await);

    let successor = BrokerAddress::new("127.0.0.1", 51016);
    broker.move_leader(1u32, successor.clone());
    broker.publish_event(1u32, EventType::Task, "COMPLETED");
    broker.publish_event(0u32, EventType::Task, "COMPLETED");

    assert!(wait_until(TEST_TIMEOUT, || recorder.count() == 6).await);
    assert_eq!(recorder.positions_of(0), vec![1, 2, 3]);
    assert_eq!(recorder.positions_of(1), vec![1, 2, 3]);

    let reopen = broker
        .subscription_opens()
        .into_iter()
        .filter(|(_, request)| request.partition_id == PartitionId(1))
        .last()
        .unwrap();
    assert_eq!(reopen.0, successor);
    assert_eq!(reopen.1.start_position, StartPosition::Sequence(3));
    let partition_zero_opens = broker
        .subscription_opens()
        .iter()
        .filter(|(_, request)| request.partition_id == PartitionId(0))
        .count();
    assert_eq!(partition_zero_opens, 1);
    assert!(recorder.failures.lock().is_empty());

    client.close().await;
}

#[tokio::test]
async fn test_tail_subscription_keeps_events_written_during_failover() {
    let broker = cluster(1);
    let client = connected(&broker, test_config()).await;
    let recorder = Arc::new(Recorder::default());
    let config = SubscriptionConfig::new("audit", Recording(Arc::clone(&recorder))).start_at_tail();
    let _handle = client.open_subscription(TOPIC, config).await.unwrap();

    // Nothing runs between these calls, so the event lands while no stream is open.
    let successor = BrokerAddress::new("127.0.0.1", 51016);
    broker.move_leader(0u32, successor.clone());
    broker.publish_event(0u32, EventType::Task, "CREATED");

    assert!(wait_until(TEST_TIMEOUT, || broker.open_streams(0u32) == 1).await);
    broker.publish_event(0u32, EventType::Task, "COMPLETED");

    assert!(wait_until(TEST_TIMEOUT, || recorder.count() == 2).await);
    assert_eq!(recorder.positions_of(0), vec![1, 2]);
    let reopen = broker.subscription_opens().pop().unwrap();
    assert_eq!(reopen.0, successor);
    assert_eq!(reopen.1.start_position, StartPosition::Sequence(1));

    client.close().await;
}

#[tokio::test]
async fn test_exhausted_partition_reported_while_siblings_continue() {
    let broker = cluster(2);
    let config = ClientConfig {
        subscription_reopen_attempts: 2,
        ..test_config()
    };
    let client = connected(&broker, config).await;
    let recorder = Arc::new(Recorder::default());
    let handle = client.open_subscription(TOPIC, subscription(&recorder)).await.unwrap();

    broker.reject_subscriptions(1u32, true);
    broker.fail_subscriptions(1u32);

    assert!(wait_until(TEST_TIMEOUT, || !recorder.failures.lock().is_empty()).await);
    {
        let failures = recorder.failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, PartitionId(1));
        assert!(failures[0].1.contains("audit"), "unexpected error: {}", failures[0].1);
    }
    // The initial open plus two re-opens.
    let partition_one_opens = broker
        .subscription_opens()
        .iter()
        .filter(|(_, request)| request.partition_id == PartitionId(1))
        .count();
    assert_eq!(partition_one_opens, 3);

    broker.publish_event(0u32, EventType::Task, "CREATED");
    assert!(wait_until(TEST_TIMEOUT, || recorder.count() == 1).await);
    assert_eq!(recorder.positions_of(0), vec![1]);

    // The failed partition leaves the subscription until the topology
    // changes again.
    assert!(wait_until(TEST_TIMEOUT, || !handle.partitions().contains(&PartitionId(1))).await);
    broker.reject_subscriptions(1u32, false);
    client.refresh_topology().await.unwrap();
    assert!(wait_until(TEST_TIMEOUT, || handle.partitions().contains(&PartitionId(1))).await);
    broker.publish_event(1u32, EventType::Task, "CREATED");
    assert!(wait_until(TEST_TIMEOUT, || recorder.positions_of(1) == vec![1]).await);
    assert_eq!(recorder.failures.lock().len(), 1);

    client.close().await;
}

#[tokio::test]
async fn test_failed_open_closes_opened_partitions() {
    let broker = cluster(3);
    broker.reject_subscriptions(2u32, true);
    let config = ClientConfig {
        subscription_reopen_attempts: 1,
        ..test_config()
    };
    let client = connected(&broker, config).await;
    let recorder = Arc::new(Recorder::default());

    let error = tokio::time::timeout(TEST_TIMEOUT, client.open_subscription(TOPIC, subscription(&recorder)))
        .await
        .unwrap()
        .unwrap_err();

    match &error {
        ClientError::SubscriptionFailed { name, partition_id, .. } => {
            assert_eq!(name, "audit");
            assert_eq!(*partition_id, PartitionId(2));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    for partition in 0..3u32 {
        assert_eq!(broker.open_streams(partition), 0);
    }
    // Open failures are returned, not reported to the handler.
    assert!(recorder.failures.lock().is_empty());

    client.close().await;
}

#[tokio::test]
async fn test_subscription_to_unknown_topic_times_out() {
    let broker = cluster(1);
    let clock = SimulatedTimeProvider::pinned();
    let client = start_client(&broker, &clock, test_config());
    let recorder = Arc::new(Recorder::default());

    let open = Box::pin(client.open_subscription("payments", subscription(&recorder)));
    let error = support::advance_until_complete(&clock, Duration::from_secs(1), open).await.unwrap_err();

    assert!(matches!(error, ClientError::TopicUnresolved { timeout_secs: 5, .. }), "unexpected error: {error:?}");

    client.close().await;
}

#[tokio::test]
async fn test_handle_close_stops_delivery() {
    let broker = cluster(1);
    let client = connected(&broker, test_config()).await;
    let recorder = Arc::new(Recorder::default());
    let handle = client.open_subscription(TOPIC, subscription(&recorder)).await.unwrap();

    broker.publish_event(0u32, EventType::Task, "CREATED");
    assert!(wait_until(TEST_TIMEOUT, || recorder.count() == 1).await);

    handle.close().await;
    assert!(handle.is_closed());
    assert_eq!(broker.open_streams(0u32), 0);

    broker.publish_event(0u32, EventType::Task, "COMPLETED");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(), 1);

    // Closing twice is harmless.
    handle.close().await;
    client.close().await;
}

#[tokio::test]
async fn test_partition_added_while_open_waits_is_subscribed() {
    let broker = cluster(2);
    broker.reject_subscriptions(1u32, true);
    let config = ClientConfig {
        subscription_reopen_attempts: 100,
        ..test_config()
    };
    let client = connected(&broker, config).await;
    let recorder = Arc::new(Recorder::default());
    let topic = TopicName::new(TOPIC);

    let open = client.open_subscription(TOPIC, subscription(&recorder));
    let grow = async {
        // Partition 1 keeps failing; the refreshes of its recovery see partition 2.
        broker.add_partition(TOPIC, 2u32);
        broker.publish_event(2u32, EventType::Task, "CREATED");
        let known = || {
            client.topology().partitions_of(&topic).is_some_and(|partitions| partitions.contains(&PartitionId(2)))
        };
        assert!(wait_until(TEST_TIMEOUT, known).await);
        broker.reject_subscriptions(1u32, false);
    };
    let (opened, ()) = tokio::join!(open, grow);
    let handle = opened.unwrap();

    assert!(wait_until(TEST_TIMEOUT, || handle.partitions().contains(&PartitionId(2))).await);
    assert!(wait_until(TEST_TIMEOUT, || recorder.positions_of(2) == vec![1]).await);

    client.close().await;
}

#[tokio::test]
async fn test_new_partition_is_discovered() {
    let broker = cluster(1);
    let config = ClientConfig {
        partition_discovery_interval_ms: 50,
        ..test_config()
    };
    let client = connected(&broker, config).await;
    let recorder = Arc::new(Recorder::default());
    let handle = client.open_subscription(TOPIC, subscription(&recorder)).await.unwrap();
    assert_eq!(handle.partitions().len(), 1);

    broker.add_partition(TOPIC, 1u32);
    broker.publish_event(1u32, EventType::Task, "CREATED");

    assert!(wait_until(TEST_TIMEOUT, || handle.partitions().contains(&PartitionId(1))).await);
    assert!(wait_until(TEST_TIMEOUT, || recorder.positions_of(1) == vec![1]).await);

    client.close().await;
}

#[tokio::test]
async fn test_closed_subscription_releases_its_handler() {
    let broker = cluster(1);
    let client = connected(&broker, test_config()).await;
    let recorder = Arc::new(Recorder::default());
    let handle = client.open_subscription(TOPIC, subscription(&recorder)).await.unwrap();
    assert!(Arc::strong_count(&recorder) > 1);

    handle.close().await;
    drop(handle);

    assert_eq!(Arc::strong_count(&recorder), 1);
    client.close().await;
}

#[tokio::test]
async fn test_client_close_closes_subscriptions() {
    let broker = cluster(2);
    let client = connected(&broker, test_config()).await;
    let recorder = Arc::new(Recorder::default());
    let handle = client.open_subscription(TOPIC, subscription(&recorder)).await.unwrap();
    assert_eq!(broker.open_streams(0u32), 1);

    client.close().await;

    assert!(handle.is_closed());
    assert_eq!(broker.open_streams(0u32), 0);
    assert_eq!(broker.open_streams(1u32), 0);
    let reopened = client.open_subscription(TOPIC, subscription(&recorder)).await;
    assert!(matches!(reopened, Err(ClientError::Shutdown)));
}
