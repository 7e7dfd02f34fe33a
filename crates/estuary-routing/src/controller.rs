//! Per-stream routing controller
//!
//! One controller orchestrates admission, central distributor election,
//! redirection and telegram fan-out for a single stream. It is a monitor:
//! every mutating operation runs under the controller's one lock, so each
//! stream behaves like an actor with a single logical thread of execution
//! while distinct streams proceed fully in parallel.
//!
//! Nothing in here blocks on the network. Outward subscribe requests are
//! fire-and-forget sends on neighbor connections; the acknowledgements
//! re-enter through [`StreamController::handle_remote_source_ack`] and
//! [`StreamController::handle_remote_drain_ack`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::BufMut;
use parking_lot::Mutex;
use tracing::{debug, warn};

use estuary_core::{
    groups_delta_equal, BrokerId, ConnectionId, ConnectionState, DataTelegram, DeliveryOptions,
    ReceiverState, RoutingError, RoutingResult, SenderState, StreamId, SubscriptionId, UserId,
    INITIAL_DATA_INDEX,
};

use crate::connection::Connection;
use crate::counter::DataIndexCounter;
use crate::list::SubscriptionList;
use crate::registry::Topology;
use crate::subscription::{
    ReceiverRole, ReceivingSubscription, SenderRole, SendingSubscription, SubscriptionKind,
};

/// Candidate subscription of an in-flight redirection.
///
/// A freshly created candidate is owned by the pending record and only
/// enters the subscription list on successful activation. When an already
/// listed subscription is re-aimed at a better path it is referenced by
/// id instead.
enum PendingCandidate {
    NewSource(SendingSubscription),
    NewDrain(ReceivingSubscription),
    ExistingDrain(SubscriptionId),
}

/// In-flight replacement of the path to one remote central distributor.
struct PendingRedirect {
    candidate: PendingCandidate,
    /// Last data index observed arriving via the candidate path.
    last_received_index: u64,
}

impl PendingRedirect {
    fn new(candidate: PendingCandidate) -> Self {
        PendingRedirect {
            candidate,
            last_received_index: INITIAL_DATA_INDEX,
        }
    }

    fn connection_id(&self, list: &SubscriptionList) -> Option<ConnectionId> {
        match &self.candidate {
            PendingCandidate::NewSource(sub) => Some(sub.connection_id()),
            PendingCandidate::NewDrain(sub) => Some(sub.connection_id()),
            PendingCandidate::ExistingDrain(id) => list.receiver(*id).map(|r| r.connection_id()),
        }
    }

    fn connection_state(&self, list: &SubscriptionList) -> ConnectionState {
        match &self.candidate {
            PendingCandidate::NewSource(sub) => sub.connection_state(),
            PendingCandidate::NewDrain(sub) => sub.connection_state(),
            PendingCandidate::ExistingDrain(id) => list
                .receiver(*id)
                .map(|r| r.connection_state())
                .unwrap_or_default(),
        }
    }

    fn is_sending(&self) -> bool {
        matches!(self.candidate, PendingCandidate::NewSource(_))
    }

    fn withdraw(self, list: &SubscriptionList) {
        match self.candidate {
            PendingCandidate::NewSource(sub) => sub.unsubscribe(),
            PendingCandidate::NewDrain(sub) => sub.unsubscribe(),
            PendingCandidate::ExistingDrain(id) => {
                if let Some(sub) = list.receiver(id) {
                    sub.unsubscribe();
                }
            }
        }
    }
}

struct ControllerInner {
    list: SubscriptionList,
    /// This broker must keep an outward subscription toward a remote
    /// central distributor.
    connect_to_remote_central: bool,
    /// More than one remote central distributor answered positively.
    multi_remote_lock_active: bool,
    /// Guards against recursive outward-connection updates.
    remote_update_lock_active: bool,
    /// Guards against recursive pruning while a pruned subscription is
    /// still being detached.
    negative_prune_active: bool,
    /// Cache of the last distributed group of a designated source.
    last_sent_telegrams: Option<Vec<DataTelegram>>,
    last_sent_data_index: u64,
    /// Redirections in flight, keyed by remote central distributor.
    pending: HashMap<BrokerId, PendingRedirect>,
    next_subscription_id: u64,
}

impl ControllerInner {
    fn next_subscription_id(&mut self) -> SubscriptionId {
        self.next_subscription_id += 1;
        SubscriptionId::new(self.next_subscription_id)
    }
}

/// Routing state machine for one stream.
pub struct StreamController {
    stream: StreamId,
    local_broker: BrokerId,
    running_number: u64,
    counter: Arc<DataIndexCounter<StreamId>>,
    topology: Arc<dyn Topology>,
    inner: Mutex<ControllerInner>,
    references: AtomicI64,
}

impl StreamController {
    pub fn new(
        stream: StreamId,
        local_broker: BrokerId,
        running_number: u64,
        counter: Arc<DataIndexCounter<StreamId>>,
        topology: Arc<dyn Topology>,
    ) -> Self {
        StreamController {
            stream,
            local_broker,
            running_number,
            counter,
            topology,
            inner: Mutex::new(ControllerInner {
                list: SubscriptionList::new(),
                connect_to_remote_central: false,
                multi_remote_lock_active: false,
                remote_update_lock_active: false,
                negative_prune_active: false,
                last_sent_telegrams: None,
                last_sent_data_index: INITIAL_DATA_INDEX,
                pending: HashMap::new(),
                next_subscription_id: 0,
            }),
            references: AtomicI64::new(0),
        }
    }

    #[inline]
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    // ------------------------------------------------------------------
    // Subscribe / unsubscribe surface
    // ------------------------------------------------------------------

    /// Admits a locally attached sender or source.
    pub fn subscribe_local_sender(
        &self,
        connection: Arc<dyn Connection>,
        user: UserId,
        role: SenderRole,
        request_supported: bool,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock();
        let id = inner.next_subscription_id();
        let sub = SendingSubscription::local(
            id,
            self.stream,
            connection,
            user,
            role == SenderRole::Source,
            request_supported,
        );
        self.add_sending_subscription(&mut inner, sub);
        id
    }

    /// Admits a locally attached receiver or drain.
    pub fn subscribe_local_receiver(
        &self,
        connection: Arc<dyn Connection>,
        user: UserId,
        role: ReceiverRole,
        options: DeliveryOptions,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock();
        let id = inner.next_subscription_id();
        let sub = ReceivingSubscription::local(
            id,
            self.stream,
            connection,
            user,
            role == ReceiverRole::Drain,
            options,
        );
        self.add_receiving_subscription(&mut inner, sub);
        id
    }

    /// Updates the candidate set of a sender forwarded by a neighbor, or
    /// admits it if unknown.
    pub fn update_or_create_remote_sender(
        &self,
        connection: Arc<dyn Connection>,
        potential: Vec<BrokerId>,
    ) {
        let mut inner = self.inner.lock();
        let conn_id = connection.id();
        let existing = inner
            .list
            .senders()
            .find(|s| s.kind() == SubscriptionKind::RemoteRelay && s.connection_id() == conn_id)
            .map(|s| s.id());
        if let Some(id) = existing {
            if let Some(sub) = inner.list.sender_mut(id) {
                sub.set_potential_distributors(potential);
                sub.reassert_state();
            }
            self.update_remote_connections_inner(&mut inner);
            return;
        }
        let id = inner.next_subscription_id();
        let user = connection
            .as_neighbor()
            .map(|n| n.remote_user_id())
            .unwrap_or_default();
        let sub = SendingSubscription::remote_relay(
            id,
            self.stream,
            connection,
            user,
            potential.into_iter().collect(),
        );
        self.add_sending_subscription(&mut inner, sub);
    }

    /// Updates the candidate set of a receiver forwarded by a neighbor,
    /// or admits it if unknown.
    pub fn update_or_create_remote_receiver(
        &self,
        connection: Arc<dyn Connection>,
        potential: Vec<BrokerId>,
    ) {
        let mut inner = self.inner.lock();
        let conn_id = connection.id();
        let existing = inner
            .list
            .receivers()
            .find(|r| r.kind() == SubscriptionKind::RemoteRelay && r.connection_id() == conn_id)
            .map(|r| r.id());
        if let Some(id) = existing {
            if let Some(sub) = inner.list.receiver_mut(id) {
                sub.set_potential_distributors(potential);
            }
            self.update_remote_connections_inner(&mut inner);
            return;
        }
        let id = inner.next_subscription_id();
        let user = connection
            .as_neighbor()
            .map(|n| n.remote_user_id())
            .unwrap_or_default();
        let sub = ReceivingSubscription::remote_relay(
            id,
            self.stream,
            connection,
            user,
            potential.into_iter().collect(),
        );
        self.add_receiving_subscription(&mut inner, sub);
    }

    /// Idempotent creation of the outward subscription that asks the
    /// neighbor's central distributor to act as source for this broker.
    pub fn get_or_create_remote_source_subscription(
        &self,
        connection: Arc<dyn Connection>,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock();
        self.get_or_create_remote_source(&mut inner, connection)
    }

    /// Idempotent creation of the outward subscription that asks the
    /// neighbor's central distributor to act as drain for this broker.
    pub fn get_or_create_remote_drain_subscription(
        &self,
        connection: Arc<dyn Connection>,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock();
        self.get_or_create_remote_drain(&mut inner, connection)
    }

    /// Removes one sending subscription.
    pub fn remove_sending_subscription(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock();
        self.remove_sending_subscription_inner(&mut inner, id);
    }

    /// Removes one receiving subscription.
    pub fn remove_receiving_subscription(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock();
        self.remove_receiving_subscription_inner(&mut inner, id);
    }

    /// Removes every sending subscription owned by a connection
    /// (connection teardown). Returns the removed subscription ids.
    pub fn remove_sending_subscriptions_of(&self, connection: ConnectionId) -> Vec<SubscriptionId> {
        let mut inner = self.inner.lock();
        let ids: Vec<SubscriptionId> = inner
            .list
            .senders()
            .filter(|s| s.connection_id() == connection)
            .map(|s| s.id())
            .collect();
        for id in &ids {
            self.remove_sending_subscription_inner(&mut inner, *id);
        }
        ids
    }

    /// Removes every receiving subscription owned by a connection.
    pub fn remove_receiving_subscriptions_of(
        &self,
        connection: ConnectionId,
    ) -> Vec<SubscriptionId> {
        let mut inner = self.inner.lock();
        let ids: Vec<SubscriptionId> = inner
            .list
            .receivers()
            .filter(|r| r.connection_id() == connection)
            .map(|r| r.id())
            .collect();
        for id in &ids {
            self.remove_receiving_subscription_inner(&mut inner, *id);
        }
        ids
    }

    // ------------------------------------------------------------------
    // Neighbor acknowledgements
    // ------------------------------------------------------------------

    /// Processes a source-side acknowledgement from a neighbor and
    /// revalidates the matching outward subscription.
    pub fn handle_remote_source_ack(
        &self,
        connection: ConnectionId,
        state: ConnectionState,
        central_distributor: BrokerId,
    ) {
        let mut inner = self.inner.lock();
        self.handle_pending_subscriptions(&mut inner, central_distributor, connection, state);
        let found = inner
            .list
            .senders()
            .find(|s| s.is_remote_central() && s.connection_id() == connection)
            .map(|s| s.id());
        let Some(id) = found else { return };
        if let Some(sub) = inner.list.sender_mut(id) {
            sub.set_remote_ack(central_distributor, state);
        }
        self.update_multi_remote_lock(&mut inner);
        let Some(sub) = inner.list.sender(id) else { return };
        let connection_valid = sub.connection_state().is_valid();
        let sender_valid = sub.state().is_valid_sender();
        if connection_valid && !sender_valid {
            self.refresh_on_new_sender(&mut inner, id);
        } else if !connection_valid && sender_valid {
            self.set_sender_state(&mut inner, id, SenderState::NoRemoteSource);
            self.refresh_on_sender_removal(&mut inner, id);
        }
        self.update_sender_receiver_status(&mut inner);
        self.remove_negative_remote_subscriptions(&mut inner);
    }

    /// Processes a drain-side acknowledgement from a neighbor.
    pub fn handle_remote_drain_ack(
        &self,
        connection: ConnectionId,
        state: ConnectionState,
        central_distributor: BrokerId,
    ) {
        let mut inner = self.inner.lock();
        self.handle_pending_subscriptions(&mut inner, central_distributor, connection, state);
        let found = inner
            .list
            .receivers()
            .find(|r| r.is_remote_central() && r.connection_id() == connection)
            .map(|r| r.id());
        let Some(id) = found else { return };
        if let Some(sub) = inner.list.receiver_mut(id) {
            sub.set_remote_ack(central_distributor, state);
        }
        self.update_multi_remote_lock(&mut inner);
        let Some(sub) = inner.list.receiver(id) else { return };
        let connection_valid = sub.connection_state().is_valid();
        let receiver_valid = sub.state().is_valid_receiver();
        if connection_valid && !receiver_valid {
            self.refresh_on_new_receiver(&mut inner, id);
        } else if !connection_valid && receiver_valid {
            self.set_receiver_state(&mut inner, id, ReceiverState::NoRemoteDrain);
            self.refresh_on_receiver_removal(&mut inner, id);
        }
        self.update_sender_receiver_status(&mut inner);
        self.remove_negative_remote_subscriptions(&mut inner);
    }

    /// Records a data index observed on a redirection candidate path and
    /// re-evaluates the pending entry against the parity gate.
    pub fn update_pending_subscription_data_index(&self, connection: ConnectionId, index: u64) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let brokers: Vec<BrokerId> = inner
            .pending
            .iter()
            .filter(|(_, p)| p.connection_id(&inner.list) == Some(connection))
            .map(|(b, _)| *b)
            .collect();
        for broker in brokers {
            let state = {
                let Some(pending) = inner.pending.get_mut(&broker) else {
                    continue;
                };
                pending.last_received_index = index;
                pending.connection_state(&inner.list)
            };
            self.handle_pending_subscriptions(inner, broker, connection, state);
        }
    }

    // ------------------------------------------------------------------
    // Topology updates
    // ------------------------------------------------------------------

    /// Called when routes changed and a better connection toward a known
    /// remote central distributor may exist. The old path stays in place
    /// until the candidate reaches a valid state and index parity.
    pub fn update_best_way(&self, broker: BrokerId, new_connection: Arc<dyn Connection>) {
        let mut inner = self.inner.lock();
        self.update_best_way_inner(&mut inner, broker, new_connection);
    }

    /// Re-evaluates every outward subscription against the current best
    /// paths and creates missing outward subscriptions.
    pub fn update_remote_connections(&self) {
        let mut inner = self.inner.lock();
        self.update_remote_connections_inner(&mut inner);
    }

    /// Re-evaluates permissions of every subscription belonging to a
    /// user, revoking or reinstating them.
    pub fn handle_user_rights_changed(&self, user: UserId) {
        let mut inner = self.inner.lock();
        for id in inner.list.receiver_ids() {
            let Some(sub) = inner.list.receiver(id) else {
                continue;
            };
            if sub.user() != user {
                continue;
            }
            let state = sub.state();
            let allowed = self.topology.is_receiver_allowed(user, self.stream);
            if allowed && state == ReceiverState::NotAllowed {
                self.refresh_on_new_receiver(&mut inner, id);
            } else if !allowed && state != ReceiverState::NotAllowed {
                self.set_receiver_state(&mut inner, id, ReceiverState::NotAllowed);
                if let Some(sub) = inner.list.receiver(id) {
                    sub.send_state_telegram(ReceiverState::NotAllowed);
                }
                self.refresh_on_receiver_removal(&mut inner, id);
            }
        }
        for id in inner.list.sender_ids() {
            let Some(sub) = inner.list.sender(id) else {
                continue;
            };
            if sub.user() != user {
                continue;
            }
            let state = sub.state();
            let allowed = self.topology.is_sender_allowed(user, self.stream);
            if allowed && state == SenderState::NotAllowed {
                self.refresh_on_new_sender(&mut inner, id);
            } else if !allowed && state != SenderState::NotAllowed {
                self.set_sender_state(&mut inner, id, SenderState::NotAllowed);
                self.refresh_on_sender_removal(&mut inner, id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Telegram fan-out
    // ------------------------------------------------------------------

    /// Distributes a single telegram, see [`Self::distribute_telegrams`].
    pub fn distribute_telegram(&self, telegram: DataTelegram, to_central_distributor: bool) {
        self.distribute_telegrams(&[telegram], to_central_distributor);
    }

    /// Distributes an ordered group of telegrams sharing one data index
    /// to all valid receivers, honoring per-receiver delivery filters.
    ///
    /// `to_central_distributor` marks a group that has not yet passed the
    /// central distributor, so its index is not authoritative; groups
    /// already indexed upstream must exceed the last distributed index or
    /// the whole group is dropped.
    pub fn distribute_telegrams(&self, group: &[DataTelegram], to_central_distributor: bool) {
        let Some(first) = group.first() else { return };
        let mut inner = self.inner.lock();
        let index = first.data_index;
        if !to_central_distributor
            && inner.last_sent_data_index > INITIAL_DATA_INDEX
            && index <= inner.last_sent_data_index
        {
            debug!(
                stream = %self.stream,
                index,
                last = inner.last_sent_data_index,
                "dropping telegram group with non-increasing data index"
            );
            return;
        }
        let cached = inner.last_sent_telegrams.clone();
        for id in self.valid_receiver_ids(&inner) {
            let Some(receiver) = inner.list.receiver(id) else {
                continue;
            };
            if !receiver.options().with_delayed && first.delayed {
                continue;
            }
            if receiver.options().with_delta {
                if let Some(previous) = &cached {
                    if groups_delta_equal(group, previous) {
                        continue;
                    }
                }
            }
            for telegram in group {
                receiver.send_data_telegram(telegram);
            }
        }
        if inner.list.has_source() && !first.delayed {
            if index != INITIAL_DATA_INDEX {
                inner.last_sent_data_index = index;
            }
            inner.last_sent_telegrams = Some(group.to_vec());
        }
    }

    // ------------------------------------------------------------------
    // Index generation
    // ------------------------------------------------------------------

    /// Issues the next data index, 0 if this broker is not the central
    /// distributor for the stream.
    pub fn next_data_index(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .list
            .next_data_index(self.stream, &self.counter, self.running_number)
    }

    /// The last issued data index without advancing the counter.
    pub fn current_data_index(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .list
            .current_data_index(self.stream, &self.counter, self.running_number)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn is_empty(&self) -> bool {
        self.inner.lock().list.is_empty()
    }

    pub fn is_central_distributor(&self) -> bool {
        self.inner.lock().list.is_central_distributor()
    }

    pub fn has_source(&self) -> bool {
        self.inner.lock().list.has_source()
    }

    pub fn has_drain(&self) -> bool {
        self.inner.lock().list.has_drain()
    }

    pub fn connects_to_remote_central(&self) -> bool {
        self.inner.lock().connect_to_remote_central
    }

    pub fn multi_remote_lock_active(&self) -> bool {
        self.inner.lock().multi_remote_lock_active
    }

    pub fn sending_subscription_count(&self) -> usize {
        self.inner.lock().list.sender_count()
    }

    pub fn receiving_subscription_count(&self) -> usize {
        self.inner.lock().list.receiver_count()
    }

    /// The connection holds a sending subscription in a valid state.
    pub fn is_valid_sender(&self, connection: ConnectionId) -> bool {
        let inner = self.inner.lock();
        let result = inner
            .list
            .senders()
            .find(|s| s.connection_id() == connection)
            .map(|s| s.state().is_valid_sender())
            .unwrap_or(false);
        result
    }

    pub fn sender_state(&self, connection: ConnectionId) -> Option<SenderState> {
        let inner = self.inner.lock();
        let result = inner
            .list
            .senders()
            .find(|s| s.connection_id() == connection)
            .map(|s| s.state());
        result
    }

    pub fn receiver_state(&self, connection: ConnectionId) -> Option<ReceiverState> {
        let inner = self.inner.lock();
        let result = inner
            .list
            .receivers()
            .find(|r| r.connection_id() == connection)
            .map(|r| r.state());
        result
    }

    /// Byte-exact diagnostic snapshot of the controller state.
    ///
    /// Counts always match the emitted entries; ordering within a group
    /// is the insertion order of the subscriptions.
    pub fn serialize_snapshot(&self) -> RoutingResult<Vec<u8>> {
        let inner = self.inner.lock();
        let mut buf = Vec::new();
        buf.put_u32(inner.list.sender_count() as u32);
        for sub in inner.list.senders() {
            buf.put_u8(sub.is_local() as u8);
            buf.put_u64(sub.connection_id().0);
            buf.put_u64(sub.user().0);
            buf.put_u8(sub.is_source() as u8);
            buf.put_u8(sub.request_supported() as u8);
            buf.put_u32(sub.state().ordinal());
            buf.put_u32(sub.connection_state().ordinal());
        }
        buf.put_u32(inner.list.receiver_count() as u32);
        for sub in inner.list.receivers() {
            buf.put_u8(sub.is_local() as u8);
            buf.put_u64(sub.connection_id().0);
            buf.put_u64(sub.user().0);
            buf.put_u8(sub.is_drain() as u8);
            buf.put_u8(sub.options().with_delayed as u8);
            buf.put_u8(sub.options().with_delta as u8);
            buf.put_u32(sub.state().ordinal());
            buf.put_u32(sub.connection_state().ordinal());
        }
        let candidates = self.topology.potential_central_distributors(self.stream);
        buf.put_u32(candidates.len() as u32);
        for broker in candidates {
            buf.put_u64(broker.0);
            let connection = self
                .topology
                .best_connection_to(broker)
                .ok_or(RoutingError::MissingBestConnection(broker))?;
            let neighbor = connection
                .as_neighbor()
                .ok_or(RoutingError::NotANeighborConnection(broker))?;
            buf.put_u64(connection.id().0);
            buf.put_i32(neighbor.throughput_resistance());
            buf.put_u64(neighbor.remote_user_id().0);
        }
        Ok(buf)
    }

    // ------------------------------------------------------------------
    // Reference counting (driven by the registry)
    // ------------------------------------------------------------------

    /// Marks the controller as open for a batch of mutations. Serialized
    /// by the registry's lock.
    pub(crate) fn add_reference(&self) {
        self.references.fetch_add(1, Ordering::SeqCst);
    }

    /// Releases one reference; returns the remaining count. Panics if the
    /// controller was not open - that is a caller bug.
    pub(crate) fn release_reference(&self) -> i64 {
        let remaining = self.references.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(remaining >= 0, "close without matching open");
        remaining
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    fn add_sending_subscription(&self, inner: &mut ControllerInner, sub: SendingSubscription) {
        let id = sub.id();
        inner.list.add_sender(sub);
        self.refresh_on_new_sender(inner, id);
    }

    fn add_receiving_subscription(&self, inner: &mut ControllerInner, sub: ReceivingSubscription) {
        let id = sub.id();
        inner.list.add_receiver(sub);
        self.refresh_on_new_receiver(inner, id);
    }

    fn refresh_on_new_sender(&self, inner: &mut ControllerInner, id: SubscriptionId) {
        let (connection_valid, user, is_source, is_local) = {
            let Some(sub) = inner.list.sender(id) else { return };
            (
                sub.connection_state().is_valid(),
                sub.user(),
                sub.is_source(),
                sub.is_local(),
            )
        };
        if !connection_valid {
            return;
        }
        if inner.multi_remote_lock_active {
            self.set_sender_state(inner, id, SenderState::MultipleRemoteLock);
            return;
        }
        if !self.topology.is_sender_allowed(user, self.stream) {
            self.set_sender_state(inner, id, SenderState::NotAllowed);
            return;
        }
        if is_source {
            if is_local {
                self.set_connect_to_remote_central(inner, false);
            }
            if inner.list.can_set_source(id) {
                self.set_source(inner, Some(id));
            } else {
                self.set_sender_state(inner, id, SenderState::InvalidSubscription);
                return;
            }
        }
        self.set_sender_state(inner, id, SenderState::Waiting);
        self.update_sender_receiver_status(inner);
    }

    fn refresh_on_new_receiver(&self, inner: &mut ControllerInner, id: SubscriptionId) {
        let (connection_valid, user, is_drain, is_local) = {
            let Some(sub) = inner.list.receiver(id) else { return };
            (
                sub.connection_state().is_valid(),
                sub.user(),
                sub.is_drain(),
                sub.is_local(),
            )
        };
        if !connection_valid {
            return;
        }
        if inner.multi_remote_lock_active {
            self.set_receiver_state(inner, id, ReceiverState::MultipleRemoteLock);
            return;
        }
        if !self.topology.is_receiver_allowed(user, self.stream) {
            self.set_receiver_state(inner, id, ReceiverState::NotAllowed);
            if let Some(sub) = inner.list.receiver(id) {
                sub.send_state_telegram(ReceiverState::NotAllowed);
            }
            return;
        }
        if is_drain {
            if is_local {
                self.set_connect_to_remote_central(inner, false);
            }
            if inner.list.can_set_drain(id) {
                self.set_drain(inner, Some(id));
            } else {
                self.set_receiver_state(inner, id, ReceiverState::InvalidSubscription);
                if let Some(sub) = inner.list.receiver(id) {
                    sub.send_state_telegram(ReceiverState::InvalidSubscription);
                }
                return;
            }
        }
        self.set_receiver_state(inner, id, ReceiverState::Waiting);
        self.update_sender_receiver_status(inner);
    }

    /// Recomputes the admission state of every valid subscription and
    /// notifies the affected endpoints.
    fn update_sender_receiver_status(&self, inner: &mut ControllerInner) {
        self.update_remote_connections_necessary(inner);

        // Partial topology information must never trigger premature state
        // changes: while outward subscriptions await their first answer
        // and none has gone valid yet, leave everything untouched.
        if self.has_pending_remote_subscriptions(inner) {
            return;
        }

        let central = inner.list.central_distributor_id(self.local_broker);
        let valid_senders = self.valid_sender_ids(inner);
        let valid_receivers = self.valid_receiver_ids(inner);

        if valid_senders.is_empty() || !inner.list.has_drain_or_source() {
            for id in &valid_receivers {
                let Some(receiver) = inner.list.receiver(*id) else {
                    continue;
                };
                let previous = receiver.state();
                if previous != ReceiverState::NoSenders {
                    if let Some(receiver) = inner.list.receiver_mut(*id) {
                        receiver.set_state(ReceiverState::NoSenders, central);
                    }
                    // A "no source" telegram was already delivered on the
                    // way into SendersAvailable, see below.
                    if previous != ReceiverState::SendersAvailable {
                        if let Some(receiver) = inner.list.receiver(*id) {
                            receiver.send_state_telegram(ReceiverState::NoSenders);
                        }
                    }
                }
            }
            for id in &valid_senders {
                if let Some(sender) = inner.list.sender_mut(*id) {
                    sender.set_state(SenderState::NoReceivers, central);
                }
            }
        } else if valid_receivers.is_empty() {
            for id in &valid_senders {
                if let Some(sender) = inner.list.sender_mut(*id) {
                    sender.set_state(SenderState::NoReceivers, central);
                }
            }
        } else {
            if inner.list.has_source() {
                let cached = inner.last_sent_telegrams.clone();
                for id in &valid_receivers {
                    let Some(receiver) = inner.list.receiver(*id) else {
                        continue;
                    };
                    if receiver.state() != ReceiverState::SendersAvailable {
                        if let Some(receiver) = inner.list.receiver_mut(*id) {
                            receiver.set_state(ReceiverState::SendersAvailable, central);
                        }
                        // Replay the cached group so a newly valid
                        // receiver is not left without an initial value.
                        if let Some(group) = &cached {
                            if let Some(receiver) = inner.list.receiver(*id) {
                                for telegram in group {
                                    receiver.send_data_telegram(telegram);
                                }
                            }
                        }
                    }
                }
            } else {
                for id in &valid_receivers {
                    let Some(receiver) = inner.list.receiver(*id) else {
                        continue;
                    };
                    let previous = receiver.state();
                    if previous != ReceiverState::SendersAvailable {
                        if let Some(receiver) = inner.list.receiver_mut(*id) {
                            receiver.set_state(ReceiverState::SendersAvailable, central);
                        }
                        // A drain never promises data availability, so the
                        // positive state is paired with a "no source"
                        // telegram.
                        if previous != ReceiverState::NoSenders {
                            if let Some(receiver) = inner.list.receiver(*id) {
                                receiver.send_state_telegram(ReceiverState::NoSenders);
                            }
                        }
                    }
                }
            }
            for id in &valid_senders {
                if let Some(sender) = inner.list.sender_mut(*id) {
                    sender.set_state(SenderState::ReceiversAvailable, central);
                }
            }
        }
    }

    /// Outward subscriptions are still awaiting their first answer and
    /// none has gone valid yet.
    fn has_pending_remote_subscriptions(&self, inner: &ControllerInner) -> bool {
        let mut waiting = 0usize;
        let mut positive = 0usize;
        for sub in inner.list.senders() {
            if !sub.is_remote_central() {
                continue;
            }
            let state = sub.connection_state();
            if state == ConnectionState::WaitingForRemoteAck {
                waiting += 1;
            } else if state.is_valid() {
                positive += 1;
            }
        }
        for sub in inner.list.receivers() {
            if !sub.is_remote_central() {
                continue;
            }
            let state = sub.connection_state();
            if state == ConnectionState::WaitingForRemoteAck {
                waiting += 1;
            } else if state.is_valid() {
                positive += 1;
            }
        }
        positive == 0 && waiting > 0
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    fn remove_sending_subscription_inner(&self, inner: &mut ControllerInner, id: SubscriptionId) {
        if inner.list.sender(id).is_none() {
            return;
        }
        self.set_sender_state(inner, id, SenderState::Unknown);
        self.refresh_on_sender_removal(inner, id);
        if let Some(sub) = inner.list.remove_sender(id) {
            sub.unsubscribe();
        }
    }

    fn remove_receiving_subscription_inner(&self, inner: &mut ControllerInner, id: SubscriptionId) {
        if inner.list.receiver(id).is_none() {
            return;
        }
        self.set_receiver_state(inner, id, ReceiverState::Unknown);
        self.refresh_on_receiver_removal(inner, id);
        if let Some(sub) = inner.list.remove_receiver(id) {
            sub.unsubscribe();
        }
    }

    fn refresh_on_sender_removal(&self, inner: &mut ControllerInner, id: SubscriptionId) {
        if self.valid_sender_ids(inner).is_empty() {
            let central = inner.list.central_distributor_id(self.local_broker);
            let has_drain = inner.list.has_drain();
            for receiver_id in self.valid_receiver_ids(inner) {
                if let Some(receiver) = inner.list.receiver_mut(receiver_id) {
                    receiver.set_state(ReceiverState::NoSenders, central);
                }
                // A drain absorbs the loss of the last sender silently.
                if !has_drain {
                    if let Some(receiver) = inner.list.receiver(receiver_id) {
                        receiver.send_state_telegram(ReceiverState::NoSenders);
                    }
                }
            }
        }

        self.update_sender_receiver_status(inner);
        if inner.list.source_id() == Some(id) {
            self.set_source(inner, None);
        }
        self.refresh_parked_subscriptions(inner, Some(id));

        // Run again now that the source slot is free, so remote
        // connection decisions see the post-removal topology.
        self.update_sender_receiver_status(inner);
    }

    fn refresh_on_receiver_removal(&self, inner: &mut ControllerInner, id: SubscriptionId) {
        if self.valid_receiver_ids(inner).is_empty() {
            let central = inner.list.central_distributor_id(self.local_broker);
            for sender_id in self.valid_sender_ids(inner) {
                if let Some(sender) = inner.list.sender_mut(sender_id) {
                    sender.set_state(SenderState::NoReceivers, central);
                }
            }
        }

        self.update_sender_receiver_status(inner);
        if inner.list.drain_id() == Some(id) {
            self.set_drain(inner, None);
        }
        self.refresh_parked_subscriptions(inner, Some(id));
        self.update_sender_receiver_status(inner);
    }

    /// Retries every subscription parked in `InvalidSubscription`; the
    /// removal that triggered this may have freed the contested slot.
    fn refresh_parked_subscriptions(
        &self,
        inner: &mut ControllerInner,
        ignore: Option<SubscriptionId>,
    ) {
        for id in inner.list.sender_ids() {
            if Some(id) == ignore {
                continue;
            }
            if inner.list.sender(id).map(|s| s.state()) == Some(SenderState::InvalidSubscription) {
                self.refresh_on_new_sender(inner, id);
            }
        }
        for id in inner.list.receiver_ids() {
            if Some(id) == ignore {
                continue;
            }
            if inner.list.receiver(id).map(|r| r.state())
                == Some(ReceiverState::InvalidSubscription)
            {
                self.refresh_on_new_receiver(inner, id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Source / drain designation
    // ------------------------------------------------------------------

    fn set_source(&self, inner: &mut ControllerInner, id: Option<SubscriptionId>) {
        if inner.list.source_id() == id {
            return;
        }
        inner.last_sent_telegrams = None;
        inner.last_sent_data_index = INITIAL_DATA_INDEX;
        let was_central = inner.list.is_central_distributor();
        inner.list.set_source(id);
        self.notify_central_distributor_edge(inner, was_central);
    }

    fn set_drain(&self, inner: &mut ControllerInner, id: Option<SubscriptionId>) {
        if inner.list.drain_id() == id {
            return;
        }
        inner.last_sent_telegrams = None;
        inner.last_sent_data_index = INITIAL_DATA_INDEX;
        let was_central = inner.list.is_central_distributor();
        inner.list.set_drain(id);
        self.notify_central_distributor_edge(inner, was_central);
    }

    fn notify_central_distributor_edge(&self, inner: &ControllerInner, was_central: bool) {
        let is_central = inner.list.is_central_distributor();
        if !was_central && is_central {
            debug!(stream = %self.stream, "became central distributor");
            self.topology.notify_new_central_distributor(self.stream);
        } else if was_central && !is_central {
            debug!(stream = %self.stream, "no longer central distributor");
            self.topology.notify_was_central_distributor(self.stream);
        }
    }

    // ------------------------------------------------------------------
    // Remote central distributor election
    // ------------------------------------------------------------------

    fn update_remote_connections_necessary(&self, inner: &mut ControllerInner) {
        let needed = self.needs_remote_central_connection(inner);
        self.set_connect_to_remote_central(inner, needed);
        self.remove_negative_remote_subscriptions(inner);
    }

    /// This broker is not central distributor for the stream but has
    /// subscriptions that depend on one existing somewhere.
    fn needs_remote_central_connection(&self, inner: &ControllerInner) -> bool {
        if inner.list.is_central_distributor() {
            return false;
        }
        for sub in inner.list.senders() {
            if !sub.is_source() {
                let state = sub.state();
                if state.is_valid_sender() || state == SenderState::MultipleRemoteLock {
                    return true;
                }
            }
        }
        for sub in inner.list.receivers() {
            if !sub.is_drain() {
                let state = sub.state();
                if state.is_valid_receiver() || state == ReceiverState::MultipleRemoteLock {
                    return true;
                }
            }
        }
        false
    }

    /// Switches the outward-connection requirement on or off, performing
    /// the outward subscribe or unsubscribe as a side effect. The guard
    /// flag makes a nested attempt (through those side effects) a no-op.
    fn set_connect_to_remote_central(&self, inner: &mut ControllerInner, value: bool) {
        if inner.remote_update_lock_active {
            return;
        }
        inner.remote_update_lock_active = true;
        if inner.connect_to_remote_central != value {
            inner.connect_to_remote_central = value;
            if value {
                self.create_remote_central_subscriptions(inner);
            } else {
                self.remove_remote_subscriptions(inner);
            }
        }
        inner.remote_update_lock_active = false;
    }

    /// Subscribes outward toward candidate central distributors: sources
    /// are requested when valid receivers exist, drains when valid
    /// senders exist. Candidates named by incoming remote subscriptions
    /// take part alongside the globally known candidate list.
    fn create_remote_central_subscriptions(&self, inner: &mut ControllerInner) {
        if inner.list.has_source() || inner.list.has_drain() {
            return;
        }
        let distributors = self.topology.potential_central_distributors(self.stream);
        if distributors.is_empty() {
            return;
        }

        let valid_senders = self.valid_sender_ids(inner);
        let valid_receivers = self.valid_receiver_ids(inner);

        let mut to_use: BTreeSet<BrokerId> = BTreeSet::new();
        for id in &valid_senders {
            let Some(sub) = inner.list.sender(*id) else {
                continue;
            };
            if sub.is_remote() {
                to_use.extend(sub.potential_distributors().iter().copied());
            } else {
                to_use.extend(distributors.iter().copied());
            }
        }
        for id in &valid_receivers {
            let Some(sub) = inner.list.receiver(*id) else {
                continue;
            };
            if sub.is_remote() {
                to_use.extend(sub.potential_distributors().iter().copied());
            } else {
                to_use.extend(distributors.iter().copied());
            }
        }

        if !valid_receivers.is_empty() {
            self.connect_to_remote_sources(inner, &to_use);
        }
        if !valid_senders.is_empty() {
            self.connect_to_remote_drains(inner, &to_use);
        }
    }

    fn connect_to_remote_sources(&self, inner: &mut ControllerInner, brokers: &BTreeSet<BrokerId>) {
        for broker in brokers {
            let Some(connection) = self.topology.best_connection_to(*broker) else {
                continue;
            };
            if connection.as_neighbor().is_none() {
                continue;
            }
            let id = self.get_or_create_remote_source(inner, connection);
            if let Some(sub) = inner.list.sender_mut(id) {
                sub.add_potential_distributor(*broker);
                sub.subscribe();
            }
        }
    }

    fn connect_to_remote_drains(&self, inner: &mut ControllerInner, brokers: &BTreeSet<BrokerId>) {
        for broker in brokers {
            let Some(connection) = self.topology.best_connection_to(*broker) else {
                continue;
            };
            if connection.as_neighbor().is_none() {
                continue;
            }
            let id = self.get_or_create_remote_drain(inner, connection);
            if let Some(sub) = inner.list.receiver_mut(id) {
                sub.add_potential_distributor(*broker);
                sub.subscribe();
            }
        }
    }

    fn get_or_create_remote_source(
        &self,
        inner: &mut ControllerInner,
        connection: Arc<dyn Connection>,
    ) -> SubscriptionId {
        let conn_id = connection.id();
        let existing = inner
            .list
            .senders()
            .find(|s| s.is_remote_central() && s.connection_id() == conn_id)
            .map(|s| s.id());
        if let Some(id) = existing {
            return id;
        }
        let id = inner.next_subscription_id();
        let user = connection
            .as_neighbor()
            .map(|n| n.remote_user_id())
            .unwrap_or_default();
        let sub = SendingSubscription::remote_central(id, self.stream, connection, user);
        self.add_sending_subscription(inner, sub);
        id
    }

    fn get_or_create_remote_drain(
        &self,
        inner: &mut ControllerInner,
        connection: Arc<dyn Connection>,
    ) -> SubscriptionId {
        let conn_id = connection.id();
        let existing = inner
            .list
            .receivers()
            .find(|r| r.is_remote_central() && r.connection_id() == conn_id)
            .map(|r| r.id());
        if let Some(id) = existing {
            return id;
        }
        let id = inner.next_subscription_id();
        let user = connection
            .as_neighbor()
            .map(|n| n.remote_user_id())
            .unwrap_or_default();
        let sub = ReceivingSubscription::remote_central(id, self.stream, connection, user);
        self.add_receiving_subscription(inner, sub);
        id
    }

    /// Withdraws every outward subscription.
    fn remove_remote_subscriptions(&self, inner: &mut ControllerInner) {
        let sender_ids: Vec<SubscriptionId> = inner
            .list
            .senders()
            .filter(|s| s.is_remote_central())
            .map(|s| s.id())
            .collect();
        for id in sender_ids {
            self.remove_sending_subscription_inner(inner, id);
        }
        let receiver_ids: Vec<SubscriptionId> = inner
            .list
            .receivers()
            .filter(|r| r.is_remote_central())
            .map(|r| r.id())
            .collect();
        for id in receiver_ids {
            self.remove_receiving_subscription_inner(inner, id);
        }
    }

    /// Unsubscribes outward subscriptions whose neighbor explicitly
    /// declined - but only once exactly one other candidate has answered
    /// positively, so no candidate is discarded while the election is
    /// still undecided.
    fn remove_negative_remote_subscriptions(&self, inner: &mut ControllerInner) {
        if !inner.connect_to_remote_central || inner.negative_prune_active {
            return;
        }
        let mut positive = 0usize;
        let mut negative = 0usize;
        for sub in inner.list.senders() {
            if sub.is_remote_central() {
                if sub.connection_state().is_valid() {
                    positive += 1;
                } else {
                    negative += 1;
                }
            }
        }
        for sub in inner.list.receivers() {
            if sub.is_remote_central() {
                if sub.connection_state().is_valid() {
                    positive += 1;
                } else {
                    negative += 1;
                }
            }
        }
        if negative == 0 || positive != 1 {
            return;
        }
        inner.negative_prune_active = true;
        let sender_ids: Vec<SubscriptionId> = inner
            .list
            .senders()
            .filter(|s| {
                s.is_remote_central()
                    && s.connection_state() == ConnectionState::RemoteNotResponsible
            })
            .map(|s| s.id())
            .collect();
        for id in sender_ids {
            self.remove_sending_subscription_inner(inner, id);
        }
        let receiver_ids: Vec<SubscriptionId> = inner
            .list
            .receivers()
            .filter(|r| {
                r.is_remote_central()
                    && r.connection_state() == ConnectionState::RemoteNotResponsible
            })
            .map(|r| r.id())
            .collect();
        for id in receiver_ids {
            self.remove_receiving_subscription_inner(inner, id);
        }
        inner.negative_prune_active = false;
    }

    // ------------------------------------------------------------------
    // Multi-remote lock
    // ------------------------------------------------------------------

    fn update_multi_remote_lock(&self, inner: &mut ControllerInner) {
        let locked = self.multiple_remote_connections_subscribed(inner);
        self.set_multi_remote_lock_active(inner, locked);
    }

    fn multiple_remote_connections_subscribed(&self, inner: &ControllerInner) -> bool {
        let mut valid = 0usize;
        for sub in inner.list.senders() {
            if sub.is_remote_central() {
                let state = sub.connection_state();
                if state == ConnectionState::MultiplePositiveAcks {
                    return true;
                }
                if state.is_valid() {
                    valid += 1;
                }
            }
        }
        for sub in inner.list.receivers() {
            if sub.is_remote_central() {
                let state = sub.connection_state();
                if state == ConnectionState::MultiplePositiveAcks {
                    return true;
                }
                if state.is_valid() {
                    valid += 1;
                }
            }
        }
        valid > 1
    }

    fn set_multi_remote_lock_active(&self, inner: &mut ControllerInner, active: bool) {
        if inner.multi_remote_lock_active == active {
            return;
        }
        inner.multi_remote_lock_active = active;
        if active {
            warn!(
                stream = %self.stream,
                "multiple remote central distributors acknowledged positively, locking stream"
            );
            self.set_drain(inner, None);
            self.set_source(inner, None);
            for id in inner.list.sender_ids() {
                let Some(sub) = inner.list.sender(id) else {
                    continue;
                };
                if sub.state() == SenderState::NoRemoteSource {
                    continue;
                }
                if let Some(sub) = inner.list.sender_mut(id) {
                    sub.set_state(SenderState::MultipleRemoteLock, None);
                }
            }
            for id in inner.list.receiver_ids() {
                let Some(sub) = inner.list.receiver(id) else {
                    continue;
                };
                if sub.state() == ReceiverState::NoRemoteDrain {
                    continue;
                }
                let remote_central = sub.is_remote_central();
                if let Some(sub) = inner.list.receiver_mut(id) {
                    sub.set_state(ReceiverState::MultipleRemoteLock, None);
                }
                if !remote_central {
                    if let Some(sub) = inner.list.receiver(id) {
                        sub.send_state_telegram(ReceiverState::InvalidSubscription);
                    }
                }
            }
        } else {
            debug!(stream = %self.stream, "remote central distributor ambiguity resolved");
            // Drop the outward subscriptions to get back to a consistent
            // state with fresh initial telegrams, then re-admit every
            // remaining subscription from scratch.
            self.set_connect_to_remote_central(inner, false);
            for id in inner.list.sender_ids() {
                let Some(sub) = inner.list.sender(id) else {
                    continue;
                };
                if sub.state() == SenderState::NoRemoteSource {
                    continue;
                }
                if let Some(sub) = inner.list.sender_mut(id) {
                    sub.set_state(SenderState::Unknown, None);
                }
                self.refresh_on_new_sender(inner, id);
            }
            for id in inner.list.receiver_ids() {
                let Some(sub) = inner.list.receiver(id) else {
                    continue;
                };
                if sub.state() == ReceiverState::NoRemoteDrain {
                    continue;
                }
                if let Some(sub) = inner.list.receiver_mut(id) {
                    sub.set_state(ReceiverState::Unknown, None);
                }
                self.refresh_on_new_receiver(inner, id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Redirection
    // ------------------------------------------------------------------

    fn update_remote_connections_inner(&self, inner: &mut ControllerInner) {
        if !inner.connect_to_remote_central {
            return;
        }
        let mut centrals: Vec<BrokerId> = Vec::new();
        for sub in inner.list.senders() {
            if sub.is_remote_central() {
                if let Some(broker) = sub.central_distributor_id() {
                    centrals.push(broker);
                }
            }
        }
        for sub in inner.list.receivers() {
            if sub.is_remote_central() {
                if let Some(broker) = sub.central_distributor_id() {
                    centrals.push(broker);
                }
            }
        }
        centrals.sort();
        centrals.dedup();
        for broker in centrals {
            if let Some(best) = self.topology.best_connection_to(broker) {
                self.update_best_way_inner(inner, broker, best);
            }
        }
        self.create_remote_central_subscriptions(inner);
    }

    fn update_best_way_inner(
        &self,
        inner: &mut ControllerInner,
        broker: BrokerId,
        new_connection: Arc<dyn Connection>,
    ) {
        if new_connection.as_neighbor().is_none() {
            return;
        }
        self.update_best_way_source(inner, broker, new_connection.clone());
        self.update_best_way_drain(inner, broker, new_connection);
    }

    fn update_best_way_source(
        &self,
        inner: &mut ControllerInner,
        broker: BrokerId,
        new_connection: Arc<dyn Connection>,
    ) {
        let new_conn_id = new_connection.id();
        let mut old_sub: Option<SubscriptionId> = None;
        let mut new_sub: Option<SubscriptionId> = None;
        for sub in inner.list.senders() {
            if sub.is_remote_central() && sub.central_distributor_id() == Some(broker) {
                if sub.connection_id() == new_conn_id {
                    new_sub = Some(sub.id());
                } else {
                    old_sub = Some(sub.id());
                }
            }
        }
        let Some(old_id) = old_sub else { return };
        match new_sub {
            None => {
                let id = inner.next_subscription_id();
                let user = new_connection
                    .as_neighbor()
                    .map(|n| n.remote_user_id())
                    .unwrap_or_default();
                let mut candidate =
                    SendingSubscription::remote_central(id, self.stream, new_connection, user);
                candidate.set_state(SenderState::Waiting, None);
                candidate.set_potential_distributors([broker]);
                candidate.subscribe();
                self.add_replacement_subscription(
                    inner,
                    broker,
                    PendingCandidate::NewSource(candidate),
                );
            }
            Some(new_id) if !inner.list.has_drain_or_source() => {
                // Both paths already exist but no central distributor was
                // found yet; just re-aim the unanswered subscriptions.
                if let Some(old) = inner.list.sender_mut(old_id) {
                    old.remove_potential_distributor(broker);
                    old.subscribe();
                }
                if let Some(new) = inner.list.sender_mut(new_id) {
                    new.add_potential_distributor(broker);
                    new.subscribe();
                }
            }
            Some(_) => {}
        }
    }

    fn update_best_way_drain(
        &self,
        inner: &mut ControllerInner,
        broker: BrokerId,
        new_connection: Arc<dyn Connection>,
    ) {
        let new_conn_id = new_connection.id();
        let mut old_sub: Option<SubscriptionId> = None;
        let mut new_sub: Option<SubscriptionId> = None;
        for sub in inner.list.receivers() {
            if sub.is_remote_central() && sub.central_distributor_id() == Some(broker) {
                if sub.connection_id() == new_conn_id {
                    new_sub = Some(sub.id());
                } else {
                    old_sub = Some(sub.id());
                }
            }
        }
        let Some(_old_id) = old_sub else { return };
        match new_sub {
            None => {
                let id = inner.next_subscription_id();
                let user = new_connection
                    .as_neighbor()
                    .map(|n| n.remote_user_id())
                    .unwrap_or_default();
                let mut candidate =
                    ReceivingSubscription::remote_central(id, self.stream, new_connection, user);
                candidate.set_potential_distributors([broker]);
                candidate.subscribe();
                self.add_replacement_subscription(
                    inner,
                    broker,
                    PendingCandidate::NewDrain(candidate),
                );
            }
            Some(new_id) => {
                self.add_replacement_subscription(
                    inner,
                    broker,
                    PendingCandidate::ExistingDrain(new_id),
                );
                if let Some(new) = inner.list.receiver_mut(new_id) {
                    new.add_potential_distributor(broker);
                    new.subscribe();
                }
            }
        }
    }

    fn add_replacement_subscription(
        &self,
        inner: &mut ControllerInner,
        broker: BrokerId,
        candidate: PendingCandidate,
    ) {
        let previous = inner
            .pending
            .insert(broker, PendingRedirect::new(candidate));
        if let Some(previous) = previous {
            previous.withdraw(&inner.list);
        }
    }

    /// Evaluates a pending redirection entry: on a valid answer and index
    /// parity the candidate replaces the old path; on a negative answer
    /// the candidate is withdrawn.
    fn handle_pending_subscriptions(
        &self,
        inner: &mut ControllerInner,
        broker: BrokerId,
        connection: ConnectionId,
        state: ConnectionState,
    ) {
        {
            let ControllerInner { pending, list, .. } = inner;
            let Some(entry) = pending.get_mut(&broker) else {
                return;
            };
            if entry.connection_id(list) != Some(connection) {
                return;
            }
            match &mut entry.candidate {
                PendingCandidate::NewSource(sub) => sub.set_remote_ack(broker, state),
                PendingCandidate::NewDrain(sub) => sub.set_remote_ack(broker, state),
                PendingCandidate::ExistingDrain(id) => {
                    let id = *id;
                    if let Some(sub) = list.receiver_mut(id) {
                        sub.set_remote_ack(broker, state);
                    }
                }
            }
        }

        let Some(entry) = inner.pending.get(&broker) else {
            return;
        };
        if entry.connection_state(&inner.list).is_valid() {
            // Outbound redirections must not cut over before the new
            // path has caught up with the locally distributed sequence.
            if entry.is_sending()
                && entry.last_received_index != inner.last_sent_data_index
                && entry.last_received_index.wrapping_sub(1) != inner.last_sent_data_index
                && inner.last_sent_data_index != INITIAL_DATA_INDEX
            {
                return;
            }
            let Some(entry) = inner.pending.remove(&broker) else {
                return;
            };
            debug!(
                stream = %self.stream,
                central = %broker,
                "activating redirected subscription path"
            );
            match entry.candidate {
                PendingCandidate::NewSource(candidate) => {
                    let candidate_conn = candidate.connection_id();
                    let old = inner
                        .list
                        .senders()
                        .find(|s| {
                            s.is_remote_central()
                                && s.central_distributor_id() == Some(broker)
                                && s.connection_id() != candidate_conn
                        })
                        .map(|s| s.id());
                    let new_id = candidate.id();
                    inner.list.add_sender(candidate);
                    self.replace_sender(inner, old, new_id);
                }
                PendingCandidate::NewDrain(candidate) => {
                    let candidate_conn = candidate.connection_id();
                    let old = inner
                        .list
                        .receivers()
                        .find(|r| {
                            r.is_remote_central()
                                && r.central_distributor_id() == Some(broker)
                                && r.connection_id() != candidate_conn
                        })
                        .map(|r| r.id());
                    let new_id = candidate.id();
                    inner.list.add_receiver(candidate);
                    self.replace_receiver(inner, old, new_id);
                }
                PendingCandidate::ExistingDrain(new_id) => {
                    let candidate_conn =
                        inner.list.receiver(new_id).map(|r| r.connection_id());
                    let old = inner
                        .list
                        .receivers()
                        .find(|r| {
                            r.is_remote_central()
                                && r.central_distributor_id() == Some(broker)
                                && Some(r.connection_id()) != candidate_conn
                        })
                        .map(|r| r.id());
                    self.replace_receiver(inner, old, new_id);
                }
            }
        } else {
            if let Some(entry) = inner.pending.remove(&broker) {
                entry.withdraw(&inner.list);
            }
        }
    }

    /// Atomically swaps the old outward subscription for the activated
    /// candidate, which inherits state and slot; the index cache is left
    /// untouched so receivers see neither a regression nor a duplicate.
    fn replace_sender(
        &self,
        inner: &mut ControllerInner,
        old: Option<SubscriptionId>,
        new_id: SubscriptionId,
    ) {
        let Some(old_id) = old else { return };
        if inner.list.source_id() == Some(old_id) {
            inner.list.set_source(Some(new_id));
        }
        if let Some(old_sub) = inner.list.remove_sender(old_id) {
            let state = old_sub.state();
            let central = old_sub.central_distributor();
            if let Some(new_sub) = inner.list.sender_mut(new_id) {
                new_sub.set_state(state, central);
            }
            old_sub.unsubscribe();
        }
    }

    fn replace_receiver(
        &self,
        inner: &mut ControllerInner,
        old: Option<SubscriptionId>,
        new_id: SubscriptionId,
    ) {
        let Some(old_id) = old else { return };
        if inner.list.drain_id() == Some(old_id) {
            inner.list.set_drain(Some(new_id));
        }
        if let Some(old_sub) = inner.list.remove_receiver(old_id) {
            let state = old_sub.state();
            let central = old_sub.central_distributor();
            if let Some(new_sub) = inner.list.receiver_mut(new_id) {
                new_sub.set_state(state, central);
            }
            old_sub.unsubscribe();
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn set_sender_state(&self, inner: &mut ControllerInner, id: SubscriptionId, state: SenderState) {
        let central = inner.list.central_distributor_id(self.local_broker);
        if let Some(sub) = inner.list.sender_mut(id) {
            sub.set_state(state, central);
        }
    }

    fn set_receiver_state(
        &self,
        inner: &mut ControllerInner,
        id: SubscriptionId,
        state: ReceiverState,
    ) {
        let central = inner.list.central_distributor_id(self.local_broker);
        if let Some(sub) = inner.list.receiver_mut(id) {
            sub.set_state(state, central);
        }
    }

    fn valid_sender_ids(&self, inner: &ControllerInner) -> Vec<SubscriptionId> {
        inner
            .list
            .senders()
            .filter(|s| s.state().is_valid_sender())
            .map(|s| s.id())
            .collect()
    }

    fn valid_receiver_ids(&self, inner: &ControllerInner) -> Vec<SubscriptionId> {
        inner
            .list
            .receivers()
            .filter(|r| r.state().is_valid_receiver())
            .map(|r| r.id())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{ReceiverRole, SenderRole};
    use crate::testing::{MockConnection, MockNeighbor, MockTopology};

    const STREAM: StreamId = StreamId {
        object: 1,
        attribute_group: 2,
        aspect: 3,
        simulation_variant: 0,
    };

    const LOCAL_BROKER: BrokerId = BrokerId(1);

    fn controller(topology: Arc<MockTopology>) -> StreamController {
        StreamController::new(
            STREAM,
            LOCAL_BROKER,
            1,
            Arc::new(DataIndexCounter::new()),
            topology,
        )
    }

    fn group(index: u64, payload: &[u8]) -> Vec<DataTelegram> {
        vec![DataTelegram::new(index, payload.to_vec())]
    }

    #[test]
    fn test_local_source_without_receivers() {
        let topology = MockTopology::new();
        let ctrl = controller(topology.clone());
        let conn = MockConnection::new(10);

        ctrl.subscribe_local_sender(conn.clone(), UserId::new(5), SenderRole::Source, true);

        assert!(ctrl.is_central_distributor());
        assert!(ctrl.has_source());
        assert_eq!(
            conn.control_telegrams(),
            vec![SenderState::Waiting, SenderState::NoReceivers]
        );
        assert_eq!(topology.central_edges(), vec![(STREAM, true)]);
    }

    #[test]
    fn test_end_to_end_source_and_receivers() {
        let topology = MockTopology::new();
        let ctrl = controller(topology.clone());
        let source_conn = MockConnection::new(10);
        let r1_conn = MockConnection::new(11);
        let r2_conn = MockConnection::new(12);

        let source = ctrl.subscribe_local_sender(
            source_conn.clone(),
            UserId::new(5),
            SenderRole::Source,
            true,
        );
        ctrl.subscribe_local_receiver(
            r1_conn.clone(),
            UserId::new(6),
            ReceiverRole::Receiver,
            DeliveryOptions::normal(),
        );
        assert_eq!(ctrl.receiver_state(r1_conn.id()), Some(ReceiverState::SendersAvailable));
        assert_eq!(
            ctrl.sender_state(source_conn.id()),
            Some(SenderState::ReceiversAvailable)
        );

        ctrl.distribute_telegrams(&group(5, b"value"), false);
        assert_eq!(r1_conn.data_telegrams().len(), 1);
        assert_eq!(r1_conn.data_telegrams()[0].data_index, 5);

        // A delta-only receiver immediately gets the cached group as its
        // first delivery.
        ctrl.subscribe_local_receiver(
            r2_conn.clone(),
            UserId::new(7),
            ReceiverRole::Receiver,
            DeliveryOptions::delta(),
        );
        assert_eq!(r2_conn.data_telegrams().len(), 1);
        assert_eq!(r2_conn.data_telegrams()[0].data_index, 5);

        // Identical payload: plain receiver gets it, delta receiver does
        // not.
        ctrl.distribute_telegrams(&group(6, b"value"), false);
        assert_eq!(r1_conn.data_telegrams().len(), 2);
        assert_eq!(r2_conn.data_telegrams().len(), 1);

        // Indices seen by any receiver are strictly increasing.
        let indices: Vec<u64> = r1_conn.data_telegrams().iter().map(|t| t.data_index).collect();
        assert_eq!(indices, vec![5, 6]);

        ctrl.remove_sending_subscription(source);
        assert_eq!(ctrl.receiver_state(r1_conn.id()), Some(ReceiverState::NoSenders));
        assert_eq!(ctrl.receiver_state(r2_conn.id()), Some(ReceiverState::NoSenders));
        assert_eq!(r1_conn.state_telegrams(), vec![ReceiverState::NoSenders]);
        assert_eq!(r2_conn.state_telegrams(), vec![ReceiverState::NoSenders]);
        assert_eq!(topology.central_edges(), vec![(STREAM, true), (STREAM, false)]);
    }

    #[test]
    fn test_second_source_is_rejected_and_retried_after_removal() {
        let topology = MockTopology::new();
        let ctrl = controller(topology);
        let first_conn = MockConnection::new(10);
        let second_conn = MockConnection::new(11);

        let first = ctrl.subscribe_local_sender(
            first_conn.clone(),
            UserId::new(5),
            SenderRole::Source,
            true,
        );
        ctrl.subscribe_local_sender(second_conn.clone(), UserId::new(6), SenderRole::Source, true);
        assert_eq!(
            ctrl.sender_state(second_conn.id()),
            Some(SenderState::InvalidSubscription)
        );

        // Removing the occupying source frees the slot and the parked
        // subscription is admitted without further intervention.
        ctrl.remove_sending_subscription(first);
        assert_eq!(
            ctrl.sender_state(second_conn.id()),
            Some(SenderState::NoReceivers)
        );
        assert!(ctrl.is_central_distributor());
    }

    #[test]
    fn test_receiver_permission_denied_and_reinstated() {
        let topology = MockTopology::new();
        let ctrl = controller(topology.clone());
        let source_conn = MockConnection::new(10);
        let receiver_conn = MockConnection::new(11);
        let user = UserId::new(6);

        ctrl.subscribe_local_sender(source_conn, UserId::new(5), SenderRole::Source, true);

        topology.deny_receiver(user);
        ctrl.subscribe_local_receiver(
            receiver_conn.clone(),
            user,
            ReceiverRole::Receiver,
            DeliveryOptions::normal(),
        );
        assert_eq!(
            ctrl.receiver_state(receiver_conn.id()),
            Some(ReceiverState::NotAllowed)
        );
        assert_eq!(
            receiver_conn.state_telegrams(),
            vec![ReceiverState::NotAllowed]
        );

        topology.allow_receiver(user);
        ctrl.handle_user_rights_changed(user);
        assert_eq!(
            ctrl.receiver_state(receiver_conn.id()),
            Some(ReceiverState::SendersAvailable)
        );

        topology.deny_receiver(user);
        ctrl.handle_user_rights_changed(user);
        assert_eq!(
            ctrl.receiver_state(receiver_conn.id()),
            Some(ReceiverState::NotAllowed)
        );
    }

    #[test]
    fn test_drain_is_paired_with_no_senders_telegram() {
        // A drain never promises data availability: entering
        // SendersAvailable is paired with a "no source" state telegram.
        let topology = MockTopology::new();
        let ctrl = controller(topology);
        let sender_conn = MockConnection::new(10);
        let drain_conn = MockConnection::new(11);

        ctrl.subscribe_local_sender(sender_conn.clone(), UserId::new(5), SenderRole::Sender, true);
        ctrl.subscribe_local_receiver(
            drain_conn.clone(),
            UserId::new(6),
            ReceiverRole::Drain,
            DeliveryOptions::normal(),
        );

        assert_eq!(
            ctrl.receiver_state(drain_conn.id()),
            Some(ReceiverState::SendersAvailable)
        );
        assert_eq!(drain_conn.state_telegrams(), vec![ReceiverState::NoSenders]);
        assert_eq!(
            ctrl.sender_state(sender_conn.id()),
            Some(SenderState::ReceiversAvailable)
        );
    }

    #[test]
    fn test_status_recomputation_is_idempotent() {
        let topology = MockTopology::new();
        let ctrl = controller(topology);
        let sender_conn = MockConnection::new(10);
        let drain_conn = MockConnection::new(11);

        ctrl.subscribe_local_sender(sender_conn.clone(), UserId::new(5), SenderRole::Sender, true);
        ctrl.subscribe_local_receiver(
            drain_conn.clone(),
            UserId::new(6),
            ReceiverRole::Drain,
            DeliveryOptions::normal(),
        );

        let states_before = drain_conn.state_telegrams();
        let controls_before = sender_conn.control_telegrams();
        {
            let mut guard = ctrl.inner.lock();
            ctrl.update_sender_receiver_status(&mut guard);
            ctrl.update_sender_receiver_status(&mut guard);
        }
        assert_eq!(drain_conn.state_telegrams(), states_before);
        assert_eq!(sender_conn.control_telegrams(), controls_before);
    }

    #[test]
    fn test_remote_election_defers_until_first_ack() {
        let topology = MockTopology::new();
        let n1 = MockNeighbor::new(20, BrokerId::new(100));
        let n2 = MockNeighbor::new(21, BrokerId::new(200));
        topology.add_candidate(STREAM, BrokerId::new(100), n1.clone());
        topology.add_candidate(STREAM, BrokerId::new(200), n2.clone());
        let ctrl = controller(topology);
        let receiver_conn = MockConnection::new(10);

        ctrl.subscribe_local_receiver(
            receiver_conn.clone(),
            UserId::new(6),
            ReceiverRole::Receiver,
            DeliveryOptions::normal(),
        );

        // Outward subscriptions were requested toward both candidates,
        // but no premature state change happens before the first answer.
        assert!(ctrl.connects_to_remote_central());
        assert_eq!(n1.subscribe_count(), 1);
        assert_eq!(n2.subscribe_count(), 1);
        assert_eq!(ctrl.receiver_state(receiver_conn.id()), Some(ReceiverState::Waiting));

        ctrl.handle_remote_source_ack(n1.id(), ConnectionState::Valid, BrokerId::new(100));
        assert!(ctrl.has_source());
        assert!(!ctrl.is_central_distributor());
        assert_eq!(
            ctrl.receiver_state(receiver_conn.id()),
            Some(ReceiverState::SendersAvailable)
        );

        // The declining candidate is pruned once exactly one answer is
        // positive.
        ctrl.handle_remote_source_ack(
            n2.id(),
            ConnectionState::RemoteNotResponsible,
            BrokerId::new(200),
        );
        assert_eq!(ctrl.sending_subscription_count(), 1);
        assert_eq!(n2.unsubscribe_count(), 1);
    }

    #[test]
    fn test_multi_remote_lock_and_recovery() {
        let topology = MockTopology::new();
        let n1 = MockNeighbor::new(20, BrokerId::new(100));
        let n2 = MockNeighbor::new(21, BrokerId::new(200));
        topology.add_candidate(STREAM, BrokerId::new(100), n1.clone());
        topology.add_candidate(STREAM, BrokerId::new(200), n2.clone());
        let ctrl = controller(topology);
        let receiver_conn = MockConnection::new(10);

        ctrl.subscribe_local_receiver(
            receiver_conn.clone(),
            UserId::new(6),
            ReceiverRole::Receiver,
            DeliveryOptions::normal(),
        );
        ctrl.handle_remote_source_ack(n1.id(), ConnectionState::Valid, BrokerId::new(100));
        assert_eq!(
            ctrl.receiver_state(receiver_conn.id()),
            Some(ReceiverState::SendersAvailable)
        );

        // A second positive answer makes the mesh ambiguous.
        ctrl.handle_remote_source_ack(n2.id(), ConnectionState::Valid, BrokerId::new(200));
        assert!(ctrl.multi_remote_lock_active());
        assert!(!ctrl.has_source());
        assert_eq!(
            ctrl.receiver_state(receiver_conn.id()),
            Some(ReceiverState::MultipleRemoteLock)
        );
        let invalid_count = receiver_conn
            .state_telegrams()
            .iter()
            .filter(|s| **s == ReceiverState::InvalidSubscription)
            .count();
        assert_eq!(invalid_count, 1);

        // Dropping back to one positive answer self-heals the stream.
        ctrl.handle_remote_source_ack(
            n2.id(),
            ConnectionState::RemoteNotResponsible,
            BrokerId::new(200),
        );
        assert!(!ctrl.multi_remote_lock_active());
        ctrl.handle_remote_source_ack(n1.id(), ConnectionState::Valid, BrokerId::new(100));
        assert_eq!(
            ctrl.receiver_state(receiver_conn.id()),
            Some(ReceiverState::SendersAvailable)
        );
        assert!(ctrl.has_source());
    }

    #[test]
    fn test_redirection_waits_for_index_parity() {
        let topology = MockTopology::new();
        let n1 = MockNeighbor::new(20, BrokerId::new(100));
        topology.add_candidate(STREAM, BrokerId::new(100), n1.clone());
        let ctrl = controller(topology.clone());
        let receiver_conn = MockConnection::new(10);

        ctrl.subscribe_local_receiver(
            receiver_conn.clone(),
            UserId::new(6),
            ReceiverRole::Receiver,
            DeliveryOptions::normal(),
        );
        ctrl.handle_remote_source_ack(n1.id(), ConnectionState::Valid, BrokerId::new(100));
        ctrl.distribute_telegrams(&group(100, b"relayed"), false);
        assert_eq!(receiver_conn.data_telegrams().len(), 1);

        // A better path to the same central distributor appears.
        let n1b = MockNeighbor::new(22, BrokerId::new(100));
        topology.set_best_connection(BrokerId::new(100), n1b.clone());
        ctrl.update_best_way(BrokerId::new(100), n1b.clone());
        assert_eq!(n1b.subscribe_count(), 1);

        // Valid answer alone does not cut over: the candidate path has
        // not caught up with the distributed sequence yet.
        ctrl.handle_remote_source_ack(n1b.id(), ConnectionState::Valid, BrokerId::new(100));
        assert_eq!(n1.unsubscribe_count(), 0);
        assert!(ctrl.sender_state(n1.id()).is_some());

        // Index parity (one ahead counts as parity) activates the swap.
        ctrl.update_pending_subscription_data_index(n1b.id(), 101);
        assert_eq!(n1.unsubscribe_count(), 1);
        assert!(ctrl.sender_state(n1.id()).is_none());
        assert_eq!(
            ctrl.sender_state(n1b.id()),
            Some(SenderState::ReceiversAvailable)
        );
        assert_eq!(ctrl.sending_subscription_count(), 1);

        // No regression and no duplicate at the receiver: the old index
        // cache survived the swap.
        ctrl.distribute_telegrams(&group(100, b"repeat"), false);
        assert_eq!(receiver_conn.data_telegrams().len(), 1);
        ctrl.distribute_telegrams(&group(101, b"next"), false);
        assert_eq!(receiver_conn.data_telegrams().len(), 2);
        assert_eq!(receiver_conn.state_telegrams(), Vec::<ReceiverState>::new());
    }

    #[test]
    fn test_redirection_candidate_discarded_on_negative_answer() {
        let topology = MockTopology::new();
        let n1 = MockNeighbor::new(20, BrokerId::new(100));
        topology.add_candidate(STREAM, BrokerId::new(100), n1.clone());
        let ctrl = controller(topology.clone());
        let receiver_conn = MockConnection::new(10);

        ctrl.subscribe_local_receiver(
            receiver_conn,
            UserId::new(6),
            ReceiverRole::Receiver,
            DeliveryOptions::normal(),
        );
        ctrl.handle_remote_source_ack(n1.id(), ConnectionState::Valid, BrokerId::new(100));

        let n1b = MockNeighbor::new(22, BrokerId::new(100));
        ctrl.update_best_way(BrokerId::new(100), n1b.clone());
        ctrl.handle_remote_source_ack(
            n1b.id(),
            ConnectionState::RemoteNotResponsible,
            BrokerId::new(100),
        );

        // The candidate is withdrawn, the established path stays.
        assert_eq!(n1b.unsubscribe_count(), 1);
        assert_eq!(n1.unsubscribe_count(), 0);
        assert!(ctrl.is_valid_sender(n1.id()));
        assert_eq!(ctrl.sending_subscription_count(), 1);
    }

    #[test]
    fn test_out_of_order_groups_are_dropped() {
        let topology = MockTopology::new();
        let ctrl = controller(topology);
        let source_conn = MockConnection::new(10);
        let receiver_conn = MockConnection::new(11);

        ctrl.subscribe_local_sender(source_conn, UserId::new(5), SenderRole::Source, true);
        ctrl.subscribe_local_receiver(
            receiver_conn.clone(),
            UserId::new(6),
            ReceiverRole::Receiver,
            DeliveryOptions::normal(),
        );

        ctrl.distribute_telegrams(&group(5, b"a"), false);
        ctrl.distribute_telegrams(&group(5, b"b"), false);
        ctrl.distribute_telegrams(&group(4, b"c"), false);
        ctrl.distribute_telegrams(&group(6, b"d"), false);

        let indices: Vec<u64> = receiver_conn
            .data_telegrams()
            .iter()
            .map(|t| t.data_index)
            .collect();
        assert_eq!(indices, vec![5, 6]);
    }

    #[test]
    fn test_delta_filter_never_suppresses_error_records() {
        let topology = MockTopology::new();
        let ctrl = controller(topology);
        let source_conn = MockConnection::new(10);
        let receiver_conn = MockConnection::new(11);

        ctrl.subscribe_local_sender(source_conn, UserId::new(5), SenderRole::Source, true);
        ctrl.subscribe_local_receiver(
            receiver_conn.clone(),
            UserId::new(6),
            ReceiverRole::Receiver,
            DeliveryOptions::delta(),
        );

        ctrl.distribute_telegrams(&group(5, b"v"), false);
        let error_group = vec![DataTelegram::new(6, b"v".to_vec()).with_error_flag(2)];
        ctrl.distribute_telegrams(&error_group, false);
        ctrl.distribute_telegrams(&group(7, b"v"), false);

        let indices: Vec<u64> = receiver_conn
            .data_telegrams()
            .iter()
            .map(|t| t.data_index)
            .collect();
        assert_eq!(indices, vec![5, 6, 7]);
    }

    #[test]
    fn test_delayed_groups_respect_receiver_options_and_skip_cache() {
        let topology = MockTopology::new();
        let ctrl = controller(topology);
        let source_conn = MockConnection::new(10);
        let current_only = MockConnection::new(11);
        let with_delayed = MockConnection::new(12);

        ctrl.subscribe_local_sender(source_conn, UserId::new(5), SenderRole::Source, true);
        ctrl.subscribe_local_receiver(
            current_only.clone(),
            UserId::new(6),
            ReceiverRole::Receiver,
            DeliveryOptions::normal(),
        );
        ctrl.subscribe_local_receiver(
            with_delayed.clone(),
            UserId::new(7),
            ReceiverRole::Receiver,
            DeliveryOptions::delayed(),
        );

        let delayed_group = vec![DataTelegram::new(5, b"old".to_vec()).delayed()];
        ctrl.distribute_telegrams(&delayed_group, false);
        assert!(current_only.data_telegrams().is_empty());
        assert_eq!(with_delayed.data_telegrams().len(), 1);

        // The delayed group was not cached, so a lower current index
        // still passes the monotonicity gate.
        ctrl.distribute_telegrams(&group(3, b"current"), false);
        assert_eq!(current_only.data_telegrams().len(), 1);
        assert_eq!(with_delayed.data_telegrams().len(), 2);
    }

    #[test]
    fn test_connection_teardown_removes_everything() {
        let topology = MockTopology::new();
        let ctrl = controller(topology);
        let conn = MockConnection::new(10);

        ctrl.subscribe_local_sender(conn.clone(), UserId::new(5), SenderRole::Sender, true);
        ctrl.subscribe_local_receiver(
            conn.clone(),
            UserId::new(5),
            ReceiverRole::Receiver,
            DeliveryOptions::normal(),
        );
        assert!(!ctrl.is_empty());

        assert_eq!(ctrl.remove_sending_subscriptions_of(conn.id()).len(), 1);
        assert_eq!(ctrl.remove_receiving_subscriptions_of(conn.id()).len(), 1);
        assert!(ctrl.is_empty());
    }

    #[test]
    fn test_relay_subscription_forwards_candidates() {
        // A neighbor forwards a receiver subscription naming its known
        // candidates; the outward search is directed at exactly those.
        let topology = MockTopology::new();
        let n1 = MockNeighbor::new(20, BrokerId::new(100));
        let n2 = MockNeighbor::new(21, BrokerId::new(200));
        topology.add_candidate(STREAM, BrokerId::new(100), n1.clone());
        topology.add_candidate(STREAM, BrokerId::new(200), n2.clone());
        let ctrl = controller(topology);
        let relay_conn = MockNeighbor::new(30, BrokerId::new(300));

        ctrl.update_or_create_remote_receiver(relay_conn.clone(), vec![BrokerId::new(100)]);

        // Only the candidate named by the relay is contacted.
        assert_eq!(n1.subscribe_count(), 1);
        assert_eq!(n2.subscribe_count(), 0);
        assert_eq!(
            n1.last_subscribe().map(|(_, role, targets)| (role, targets)),
            Some((
                crate::connection::RemoteSubscribeRole::Source,
                [BrokerId::new(100)].into_iter().collect()
            ))
        );
    }

    #[test]
    fn test_snapshot_layout() {
        let topology = MockTopology::new();
        let n1 = MockNeighbor::new(20, BrokerId::new(100));
        topology.add_candidate(STREAM, BrokerId::new(100), n1);
        let ctrl = controller(topology);
        let source_conn = MockConnection::new(10);
        let receiver_conn = MockConnection::new(11);

        ctrl.subscribe_local_sender(source_conn, UserId::new(5), SenderRole::Source, true);
        ctrl.subscribe_local_receiver(
            receiver_conn,
            UserId::new(6),
            ReceiverRole::Receiver,
            DeliveryOptions::normal(),
        );

        let snapshot = ctrl.serialize_snapshot().unwrap();

        let mut expected = Vec::new();
        expected.put_u32(1); // sending subscriptions
        expected.put_u8(1); // local
        expected.put_u64(10); // connection
        expected.put_u64(5); // user
        expected.put_u8(1); // source
        expected.put_u8(1); // request supported
        expected.put_u32(SenderState::ReceiversAvailable.ordinal());
        expected.put_u32(ConnectionState::Valid.ordinal());
        expected.put_u32(1); // receiving subscriptions
        expected.put_u8(1); // local
        expected.put_u64(11); // connection
        expected.put_u64(6); // user
        expected.put_u8(0); // drain
        expected.put_u8(0); // with delayed
        expected.put_u8(0); // with delta
        expected.put_u32(ReceiverState::SendersAvailable.ordinal());
        expected.put_u32(ConnectionState::Valid.ordinal());
        expected.put_u32(1); // candidate central distributors
        expected.put_u64(100); // broker
        expected.put_u64(20); // best connection
        expected.put_i32(10); // throughput resistance
        expected.put_u64(900); // remote user

        assert_eq!(snapshot, expected);
    }

    #[test]
    fn test_snapshot_fails_without_best_connection() {
        let topology = MockTopology::new();
        let n1 = MockNeighbor::new(20, BrokerId::new(100));
        topology.add_candidate(STREAM, BrokerId::new(100), n1);
        let n2 = MockNeighbor::new(21, BrokerId::new(200));
        topology.add_candidate(STREAM, BrokerId::new(200), n2);
        let ctrl = controller(topology.clone());

        // The topology loses the route while the broker stays a
        // candidate.
        topology.drop_connection(BrokerId::new(200));
        assert!(matches!(
            ctrl.serialize_snapshot(),
            Err(RoutingError::MissingBestConnection(BrokerId(200)))
        ));
    }

    #[test]
    fn test_next_data_index_only_for_central_distributor() {
        let topology = MockTopology::new();
        let ctrl = controller(topology);
        assert_eq!(ctrl.next_data_index(), 0);

        let conn = MockConnection::new(10);
        ctrl.subscribe_local_sender(conn, UserId::new(5), SenderRole::Source, true);
        let first = ctrl.next_data_index();
        let second = ctrl.next_data_index();
        assert!(first > INITIAL_DATA_INDEX);
        assert!(second > first);
        assert_eq!(ctrl.current_data_index(), second);
    }
}
