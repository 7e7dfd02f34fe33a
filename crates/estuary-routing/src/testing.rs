//! Shared mock endpoints and topology for the crate's tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use estuary_core::{
    BrokerId, ConnectionId, DataTelegram, ReceiverState, SenderState, StreamId, UserId,
};

use crate::connection::{Connection, NeighborConnection, RemoteSubscribeRole};
use crate::registry::Topology;

/// Local application endpoint recording everything sent to it.
pub(crate) struct MockConnection {
    id: ConnectionId,
    data: Mutex<Vec<DataTelegram>>,
    states: Mutex<Vec<ReceiverState>>,
    controls: Mutex<Vec<SenderState>>,
}

impl MockConnection {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(MockConnection {
            id: ConnectionId::new(id),
            data: Mutex::new(Vec::new()),
            states: Mutex::new(Vec::new()),
            controls: Mutex::new(Vec::new()),
        })
    }

    pub fn data_telegrams(&self) -> Vec<DataTelegram> {
        self.data.lock().clone()
    }

    pub fn state_telegrams(&self) -> Vec<ReceiverState> {
        self.states.lock().clone()
    }

    pub fn control_telegrams(&self) -> Vec<SenderState> {
        self.controls.lock().clone()
    }
}

impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_data_telegram(&self, telegram: &DataTelegram) {
        self.data.lock().push(telegram.clone());
    }

    fn send_state_telegram(&self, _stream: StreamId, state: ReceiverState) {
        self.states.lock().push(state);
    }

    fn send_control_telegram(&self, _stream: StreamId, state: SenderState) {
        self.controls.lock().push(state);
    }
}

/// Neighbor broker endpoint recording outward subscribe traffic.
pub(crate) struct MockNeighbor {
    id: ConnectionId,
    broker: BrokerId,
    resistance: i32,
    remote_user: UserId,
    data: Mutex<Vec<DataTelegram>>,
    states: Mutex<Vec<ReceiverState>>,
    controls: Mutex<Vec<SenderState>>,
    subscribes: Mutex<Vec<(StreamId, RemoteSubscribeRole, BTreeSet<BrokerId>)>>,
    unsubscribes: Mutex<Vec<(StreamId, RemoteSubscribeRole)>>,
}

impl MockNeighbor {
    pub fn new(id: u64, broker: BrokerId) -> Arc<Self> {
        Arc::new(MockNeighbor {
            id: ConnectionId::new(id),
            broker,
            resistance: 10,
            remote_user: UserId::new(900),
            data: Mutex::new(Vec::new()),
            states: Mutex::new(Vec::new()),
            controls: Mutex::new(Vec::new()),
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
        })
    }

    pub fn data_telegrams(&self) -> Vec<DataTelegram> {
        self.data.lock().clone()
    }

    pub fn control_telegrams(&self) -> Vec<SenderState> {
        self.controls.lock().clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.lock().len()
    }

    pub fn last_subscribe(&self) -> Option<(StreamId, RemoteSubscribeRole, BTreeSet<BrokerId>)> {
        self.subscribes.lock().last().cloned()
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.lock().len()
    }
}

impl Connection for MockNeighbor {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_data_telegram(&self, telegram: &DataTelegram) {
        self.data.lock().push(telegram.clone());
    }

    fn send_state_telegram(&self, _stream: StreamId, state: ReceiverState) {
        self.states.lock().push(state);
    }

    fn send_control_telegram(&self, _stream: StreamId, state: SenderState) {
        self.controls.lock().push(state);
    }

    fn as_neighbor(&self) -> Option<&dyn NeighborConnection> {
        Some(self)
    }
}

impl NeighborConnection for MockNeighbor {
    fn broker_id(&self) -> BrokerId {
        self.broker
    }

    fn throughput_resistance(&self) -> i32 {
        self.resistance
    }

    fn remote_user_id(&self) -> UserId {
        self.remote_user
    }

    fn send_remote_subscribe(
        &self,
        stream: StreamId,
        role: RemoteSubscribeRole,
        targets: &BTreeSet<BrokerId>,
    ) {
        self.subscribes.lock().push((stream, role, targets.clone()));
    }

    fn send_remote_unsubscribe(&self, stream: StreamId, role: RemoteSubscribeRole) {
        self.unsubscribes.lock().push((stream, role));
    }
}

/// Mock topology collaborator with explicit candidate and permission
/// tables.
#[derive(Default)]
pub(crate) struct MockTopology {
    candidates: Mutex<HashMap<StreamId, Vec<BrokerId>>>,
    connections: Mutex<HashMap<BrokerId, Arc<MockNeighbor>>>,
    denied_senders: Mutex<HashSet<UserId>>,
    denied_receivers: Mutex<HashSet<UserId>>,
    central_edges: Mutex<Vec<(StreamId, bool)>>,
}

impl MockTopology {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTopology::default())
    }

    pub fn add_candidate(&self, stream: StreamId, broker: BrokerId, conn: Arc<MockNeighbor>) {
        self.candidates.lock().entry(stream).or_default().push(broker);
        self.connections.lock().insert(broker, conn);
    }

    /// Reroutes the best connection for a broker without touching the
    /// candidate list.
    pub fn set_best_connection(&self, broker: BrokerId, conn: Arc<MockNeighbor>) {
        self.connections.lock().insert(broker, conn);
    }

    /// Forgets the route to a broker while it stays a candidate.
    pub fn drop_connection(&self, broker: BrokerId) {
        self.connections.lock().remove(&broker);
    }

    pub fn deny_sender(&self, user: UserId) {
        self.denied_senders.lock().insert(user);
    }

    pub fn allow_sender(&self, user: UserId) {
        self.denied_senders.lock().remove(&user);
    }

    pub fn deny_receiver(&self, user: UserId) {
        self.denied_receivers.lock().insert(user);
    }

    pub fn allow_receiver(&self, user: UserId) {
        self.denied_receivers.lock().remove(&user);
    }

    /// Central distributor edges seen so far; `true` marks "became
    /// central", `false` marks "no longer central".
    pub fn central_edges(&self) -> Vec<(StreamId, bool)> {
        self.central_edges.lock().clone()
    }
}

impl Topology for MockTopology {
    fn potential_central_distributors(&self, stream: StreamId) -> Vec<BrokerId> {
        self.candidates.lock().get(&stream).cloned().unwrap_or_default()
    }

    fn best_connection_to(&self, broker: BrokerId) -> Option<Arc<dyn Connection>> {
        self.connections
            .lock()
            .get(&broker)
            .cloned()
            .map(|c| c as Arc<dyn Connection>)
    }

    fn notify_new_central_distributor(&self, stream: StreamId) {
        self.central_edges.lock().push((stream, true));
    }

    fn notify_was_central_distributor(&self, stream: StreamId) {
        self.central_edges.lock().push((stream, false));
    }

    fn is_sender_allowed(&self, user: UserId, _stream: StreamId) -> bool {
        !self.denied_senders.lock().contains(&user)
    }

    fn is_receiver_allowed(&self, user: UserId, _stream: StreamId) -> bool {
        !self.denied_receivers.lock().contains(&user)
    }
}
