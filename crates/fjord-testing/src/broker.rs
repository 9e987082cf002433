//! In-memory broker answering the client's transport calls.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use fjord_client::BrokerAddress;
use fjord_client::BrokerTransport;
use fjord_client::Command;
use fjord_client::CommandResponse;
use fjord_client::Event;
use fjord_client::EventSource;
use fjord_client::EventType;
use fjord_client::PartitionId;
use fjord_client::PartitionLeader;
use fjord_client::PartitionSubscriptionRequest;
use fjord_client::StartPosition;
use fjord_client::TopicName;
use fjord_client::TopologyResponse;
use fjord_client::TransportError;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::source::StubEventSource;

type CommandResponder = Arc<dyn Fn(&Command) -> CommandResponse + Send + Sync>;

/// How the stub answers one kind of request.
#[derive(Clone)]
enum Reply<T> {
    Respond(T),
    DoNotRespond,
    Error(TransportError),
}

struct CommandStub {
    event_type: EventType,
    command: String,
    reply: Reply<CommandResponder>,
}

pub(crate) type StreamSender = mpsc::UnboundedSender<Result<Event, TransportError>>;

#[derive(Default)]
struct PartitionLog {
    events: Vec<Event>,
    streams: Vec<StreamSender>,
}

pub(crate) struct BrokerState {
    topology_reply: Reply<()>,
    partitions: Vec<PartitionLeader>,
    command_stubs: Vec<CommandStub>,
    rejected_subscriptions: HashSet<PartitionId>,
    logs: HashMap<PartitionId, PartitionLog>,
    topology_requests: Vec<BrokerAddress>,
    commands: Vec<(BrokerAddress, Command)>,
    subscription_opens: Vec<(BrokerAddress, PartitionSubscriptionRequest)>,
    pub(crate) acknowledgements: Vec<(PartitionId, u64)>,
}

/// A scriptable broker cluster living in the test process.
///
/// Topology queries are left unanswered until stubbed, matching a cluster
/// that is still starting up. Clones share state, so a test keeps one handle
/// and gives another to the client as its transport.
///
/// ```ignore
/// let broker = StubBroker::new(BrokerAddress::new("localhost", 51015));
/// broker.add_partition("default-topic", 0u32);
/// broker.stub_topology_request();
/// broker.on_execute_command(EventType::Task, "CREATE").respond_with_state("CREATED");
///
/// let client = FjordClient::builder(broker.transport()).build()?;
/// ```
#[derive(Clone)]
pub struct StubBroker {
    address: BrokerAddress,
    state: Arc<Mutex<BrokerState>>,
}

impl StubBroker {
    /// A broker whose partitions are led by `address` unless placed elsewhere.
    pub fn new(address: BrokerAddress) -> Self {
        Self {
            address,
            state: Arc::new(Mutex::new(BrokerState {
                topology_reply: Reply::DoNotRespond,
                partitions: Vec::new(),
                command_stubs: Vec::new(),
                rejected_subscriptions: HashSet::new(),
                logs: HashMap::new(),
                topology_requests: Vec::new(),
                commands: Vec::new(),
                subscription_opens: Vec::new(),
                acknowledgements: Vec::new(),
            })),
        }
    }

    /// The broker as the client's transport.
    pub fn transport(&self) -> Arc<dyn BrokerTransport> {
        Arc::new(self.clone())
    }

    /// Address of the default node.
    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    /// Add a partition led by the default node.
    pub fn add_partition(&self, topic: impl Into<TopicName>, partition_id: impl Into<PartitionId>) {
        self.add_partition_on(topic, partition_id, self.address.clone());
    }

    /// Add a partition led by `leader`.
    pub fn add_partition_on(
        &self,
        topic: impl Into<TopicName>,
        partition_id: impl Into<PartitionId>,
        leader: BrokerAddress,
    ) {
        let partition_id = partition_id.into();
        let mut state = self.state.lock();
        state.partitions.retain(|p| p.partition_id != partition_id);
        state.partitions.push(PartitionLeader {
            topic: topic.into(),
            partition_id,
            leader,
        });
        state.logs.entry(partition_id).or_default();
    }

    /// Answer topology queries with the current partitions.
    pub fn stub_topology_request(&self) {
        self.on_topology_request().respond_with_topology();
    }

    pub fn on_topology_request(&self) -> TopologyStubBuilder<'_> {
        TopologyStubBuilder { broker: self }
    }

    /// Stub the answer to commands of `event_type` named `command`.
    ///
    /// The most recently registered matching stub wins.
    pub fn on_execute_command(&self, event_type: EventType, command: impl Into<String>) -> CommandStubBuilder<'_> {
        CommandStubBuilder {
            broker: self,
            event_type,
            command: command.into(),
        }
    }

    /// Number of topology queries received.
    pub fn received_topology_requests(&self) -> usize {
        self.state.lock().topology_requests.len()
    }

    /// Nodes contacted by topology queries, in arrival order.
    pub fn topology_request_contacts(&self) -> Vec<BrokerAddress> {
        self.state.lock().topology_requests.clone()
    }

    /// Commands received, in arrival order.
    pub fn received_commands(&self) -> Vec<Command> {
        self.state.lock().commands.iter().map(|(_, command)| command.clone()).collect()
    }

    /// Subscription opens received, with the node they were sent to.
    pub fn subscription_opens(&self) -> Vec<(BrokerAddress, PartitionSubscriptionRequest)> {
        self.state.lock().subscription_opens.clone()
    }

    /// Positions acknowledged on `partition_id`, in order.
    pub fn acknowledged(&self, partition_id: impl Into<PartitionId>) -> Vec<u64> {
        let partition_id = partition_id.into();
        self.state
            .lock()
            .acknowledgements
            .iter()
            .filter(|(p, _)| *p == partition_id)
            .map(|(_, position)| *position)
            .collect()
    }

    /// Append an event to a partition log and push it to open streams.
    ///
    /// Returns the event's position; positions start at 1.
    pub fn publish_event(&self, partition_id: impl Into<PartitionId>, event_type: EventType, state: &str) -> u64 {
        let partition_id = partition_id.into();
        let mut broker = self.state.lock();
        let log = broker.logs.entry(partition_id).or_default();
        let position = log.events.len() as u64 + 1;
        let event = Event {
            partition_id,
            position,
            key: position,
            event_type,
            state: state.to_string(),
            payload: Vec::new(),
        };
        log.events.push(event.clone());
        log.streams.retain(|stream| stream.send(Ok(event.clone())).is_ok());
        position
    }

    /// Hand leadership of `partition_id` to `leader`. Open streams on the
    /// partition break, as they would when the old leader steps down.
    pub fn move_leader(&self, partition_id: impl Into<PartitionId>, leader: BrokerAddress) {
        let partition_id = partition_id.into();
        let mut state = self.state.lock();
        for partition in state.partitions.iter_mut().filter(|p| p.partition_id == partition_id) {
            partition.leader = leader.clone();
        }
        break_streams(&mut state, partition_id, "leader changed");
        debug!(%partition_id, %leader, "stub leader moved");
    }

    /// Break every open stream on `partition_id`.
    pub fn fail_subscriptions(&self, partition_id: impl Into<PartitionId>) {
        let partition_id = partition_id.into();
        break_streams(&mut self.state.lock(), partition_id, "injected failure");
    }

    /// Refuse (or accept again) subscription opens on `partition_id`.
    pub fn reject_subscriptions(&self, partition_id: impl Into<PartitionId>, reject: bool) {
        let partition_id = partition_id.into();
        let mut state = self.state.lock();
        if reject {
            state.rejected_subscriptions.insert(partition_id);
        } else {
            state.rejected_subscriptions.remove(&partition_id);
        }
    }

    /// Number of streams currently open on `partition_id`.
    pub fn open_streams(&self, partition_id: impl Into<PartitionId>) -> usize {
        let partition_id = partition_id.into();
        self.state
            .lock()
            .logs
            .get_mut(&partition_id)
            .map(|log| {
                log.streams.retain(|stream| !stream.is_closed());
                log.streams.len()
            })
            .unwrap_or(0)
    }

    fn leader_of(state: &BrokerState, partition_id: PartitionId) -> Option<BrokerAddress> {
        state.partitions.iter().find(|p| p.partition_id == partition_id).map(|p| p.leader.clone())
    }
}

fn break_streams(state: &mut BrokerState, partition_id: PartitionId, reason: &str) {
    if let Some(log) = state.logs.get_mut(&partition_id) {
        for stream in log.streams.drain(..) {
            let _ = stream.send(Err(TransportError::StreamClosed {
                partition_id,
                reason: reason.to_string(),
            }));
        }
    }
}

fn not_leader(partition_id: PartitionId, contacted: &BrokerAddress) -> TransportError {
    TransportError::Rejected {
        code: "NOT_LEADER".to_string(),
        message: format!("{contacted} does not lead partition {partition_id}"),
    }
}

#[async_trait]
impl BrokerTransport for StubBroker {
    async fn request_topology(&self, contact: &BrokerAddress) -> Result<TopologyResponse, TransportError> {
        let reply = {
            let mut state = self.state.lock();
            state.topology_requests.push(contact.clone());
            match state.topology_reply.clone() {
                Reply::Respond(()) => Reply::Respond(TopologyResponse {
                    partitions: state.partitions.clone(),
                }),
                Reply::DoNotRespond => Reply::DoNotRespond,
                Reply::Error(error) => Reply::Error(error),
            }
        };
        debug!(%contact, "stub received topology request");
        match reply {
            Reply::Respond(response) => Ok(response),
            Reply::Error(error) => Err(error),
            Reply::DoNotRespond => std::future::pending().await,
        }
    }

    async fn execute_command(&self, leader: &BrokerAddress, command: &Command) -> Result<CommandResponse, TransportError> {
        let reply = {
            let mut state = self.state.lock();
            state.commands.push((leader.clone(), command.clone()));
            match Self::leader_of(&state, command.partition_id) {
                None => Reply::Error(TransportError::Rejected {
                    code: "PARTITION_NOT_FOUND".to_string(),
                    message: format!("partition {} does not exist", command.partition_id),
                }),
                Some(actual) if actual != *leader => Reply::Error(not_leader(command.partition_id, leader)),
                Some(_) => state
                    .command_stubs
                    .iter()
                    .rev()
                    .find(|stub| stub.event_type == command.event_type && stub.command == command.command)
                    .map(|stub| stub.reply.clone())
                    .unwrap_or_else(|| {
                        Reply::Error(TransportError::Rejected {
                            code: "UNSUPPORTED".to_string(),
                            message: format!("no stub for {} {}", command.event_type, command.command),
                        })
                    }),
            }
        };
        match reply {
            Reply::Respond(responder) => Ok(responder(command)),
            Reply::Error(error) => Err(error),
            Reply::DoNotRespond => std::future::pending().await,
        }
    }

    async fn open_subscription(
        &self,
        leader: &BrokerAddress,
        request: &PartitionSubscriptionRequest,
    ) -> Result<Box<dyn EventSource>, TransportError> {
        let partition_id = request.partition_id;
        let mut state = self.state.lock();
        state.subscription_opens.push((leader.clone(), request.clone()));

        if state.rejected_subscriptions.contains(&partition_id) {
            return Err(TransportError::Rejected {
                code: "SUBSCRIPTION_REJECTED".to_string(),
                message: format!("subscriptions on partition {partition_id} are refused"),
            });
        }
        if Self::leader_of(&state, partition_id).as_ref() != Some(leader) {
            return Err(not_leader(partition_id, leader));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let log = state.logs.entry(partition_id).or_default();
        let first_position = match request.start_position {
            StartPosition::Head => 1,
            StartPosition::Tail => log.events.len() as u64 + 1,
            StartPosition::Sequence(first) => first,
        };
        let replay = log.events.iter().filter(|event| match request.start_position {
            StartPosition::Head => true,
            StartPosition::Tail => false,
            StartPosition::Sequence(first) => event.position >= first,
        });
        for event in replay {
            let _ = tx.send(Ok(event.clone()));
        }
        log.streams.push(tx);
        debug!(%partition_id, %leader, start = ?request.start_position, "stub opened subscription");

        Ok(Box::new(StubEventSource::new(partition_id, rx, Arc::clone(&self.state), first_position)))
    }
}

/// Configures the answer to topology queries.
pub struct TopologyStubBuilder<'a> {
    broker: &'a StubBroker,
}

impl TopologyStubBuilder<'_> {
    /// Answer with the broker's partitions as they are when the query arrives.
    pub fn respond_with_topology(self) {
        self.broker.state.lock().topology_reply = Reply::Respond(());
    }

    /// Leave queries unanswered. Queries already waiting stay unanswered.
    pub fn do_not_respond(self) {
        self.broker.state.lock().topology_reply = Reply::DoNotRespond;
    }

    pub fn respond_with_error(self, code: &str, message: &str) {
        self.broker.state.lock().topology_reply = Reply::Error(TransportError::Rejected {
            code: code.to_string(),
            message: message.to_string(),
        });
    }
}

/// Configures the answer to one kind of command.
pub struct CommandStubBuilder<'a> {
    broker: &'a StubBroker,
    event_type: EventType,
    command: String,
}

impl CommandStubBuilder<'_> {
    pub fn respond_with(self, responder: impl Fn(&Command) -> CommandResponse + Send + Sync + 'static) {
        self.register(Reply::Respond(Arc::new(responder)));
    }

    /// Answer with `state`, echoing the command's partition, key and payload.
    pub fn respond_with_state(self, state: &str) {
        let state = state.to_string();
        self.respond_with(move |command| CommandResponse {
            partition_id: command.partition_id,
            key: command.key.unwrap_or(1),
            position: 1,
            state: state.clone(),
            payload: command.payload.clone(),
        });
    }

    pub fn respond_with_error(self, code: &str, message: &str) {
        self.register(Reply::Error(TransportError::Rejected {
            code: code.to_string(),
            message: message.to_string(),
        }));
    }

    pub fn do_not_respond(self) {
        self.register(Reply::DoNotRespond);
    }

    fn register(self, reply: Reply<CommandResponder>) {
        self.broker.state.lock().command_stubs.push(CommandStub {
            event_type: self.event_type,
            command: self.command,
            reply,
        });
    }
}
