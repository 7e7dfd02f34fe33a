//! Subscription variants
//!
//! One subscription records one endpoint's interest in a stream. The
//! former deep class hierarchy is collapsed into two parallel structs
//! (sending and receiving side) carrying a [`SubscriptionKind`] tag:
//!
//! - `Local`: a directly attached in-process application
//! - `RemoteRelay`: a subscription forwarded to us by a neighbor broker
//! - `RemoteCentral`: our own outward subscription toward a remote
//!   central distributor candidate
//!
//! Subscriptions are passive records owned by the stream controller; all
//! state transitions are driven from there.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use estuary_core::{
    BrokerId, ConnectionId, ConnectionState, DataTelegram, DeliveryOptions, ReceiverState,
    SenderState, StreamId, SubscriptionId, UserId,
};

use crate::connection::{Connection, RemoteSubscribeRole};

/// Role a local application claims on the sending side
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderRole {
    /// Ground-truth origin of the stream; at most one per stream
    Source,
    /// Plain sender, data passes through the central distributor
    Sender,
}

/// Role a local application claims on the receiving side
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverRole {
    /// Ground-truth sink of the stream; at most one per stream
    Drain,
    /// Plain receiver
    Receiver,
}

/// Capability tag of a subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Direct in-process attachment
    Local,
    /// Forwarded subscription from one specific neighbor broker
    RemoteRelay,
    /// Remote-central-distributor candidate subscription
    RemoteCentral,
}

/// Derives the connection state of a remote-central subscription from the
/// per-candidate acknowledgements.
fn derive_remote_state(
    potential: &BTreeSet<BrokerId>,
    acks: &BTreeMap<BrokerId, ConnectionState>,
) -> ConnectionState {
    if potential.is_empty() {
        return ConnectionState::Unknown;
    }
    let mut valid = 0usize;
    let mut unanswered = 0usize;
    for broker in potential {
        match acks.get(broker) {
            Some(ConnectionState::Valid) => valid += 1,
            Some(ConnectionState::MultiplePositiveAcks) => {
                return ConnectionState::MultiplePositiveAcks
            }
            Some(_) => {}
            None => unanswered += 1,
        }
    }
    if valid > 1 {
        ConnectionState::MultiplePositiveAcks
    } else if valid == 1 {
        ConnectionState::Valid
    } else if unanswered > 0 {
        ConnectionState::WaitingForRemoteAck
    } else {
        ConnectionState::RemoteNotResponsible
    }
}

fn derive_central_distributor(
    potential: &BTreeSet<BrokerId>,
    acks: &BTreeMap<BrokerId, ConnectionState>,
) -> Option<BrokerId> {
    for broker in potential {
        if acks.get(broker) == Some(&ConnectionState::Valid) {
            return Some(*broker);
        }
    }
    if potential.len() == 1 {
        return potential.iter().next().copied();
    }
    None
}

/// A sending subscription (source or plain sender)
pub struct SendingSubscription {
    id: SubscriptionId,
    stream: StreamId,
    kind: SubscriptionKind,
    connection: Arc<dyn Connection>,
    user: UserId,
    source: bool,
    request_supported: bool,
    state: SenderState,
    central_distributor: Option<BrokerId>,
    potential_distributors: BTreeSet<BrokerId>,
    acks: BTreeMap<BrokerId, ConnectionState>,
}

impl SendingSubscription {
    pub fn local(
        id: SubscriptionId,
        stream: StreamId,
        connection: Arc<dyn Connection>,
        user: UserId,
        source: bool,
        request_supported: bool,
    ) -> Self {
        SendingSubscription {
            id,
            stream,
            kind: SubscriptionKind::Local,
            connection,
            user,
            source,
            request_supported,
            state: SenderState::Unknown,
            central_distributor: None,
            potential_distributors: BTreeSet::new(),
            acks: BTreeMap::new(),
        }
    }

    /// A sender forwarded by a neighbor broker. Never a source; the
    /// neighbor names the central distributor candidates it knows about.
    pub fn remote_relay(
        id: SubscriptionId,
        stream: StreamId,
        connection: Arc<dyn Connection>,
        user: UserId,
        potential: BTreeSet<BrokerId>,
    ) -> Self {
        SendingSubscription {
            id,
            stream,
            kind: SubscriptionKind::RemoteRelay,
            connection,
            user,
            source: false,
            request_supported: true,
            state: SenderState::Unknown,
            central_distributor: None,
            potential_distributors: potential,
            acks: BTreeMap::new(),
        }
    }

    /// Our own subscription toward a remote central distributor that is
    /// to act as source for this broker. Occupies the source slot once
    /// acknowledged.
    pub fn remote_central(
        id: SubscriptionId,
        stream: StreamId,
        connection: Arc<dyn Connection>,
        user: UserId,
    ) -> Self {
        SendingSubscription {
            id,
            stream,
            kind: SubscriptionKind::RemoteCentral,
            connection,
            user,
            source: true,
            request_supported: false,
            state: SenderState::Unknown,
            central_distributor: None,
            potential_distributors: BTreeSet::new(),
            acks: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.kind == SubscriptionKind::Local
    }

    #[inline]
    pub fn is_remote(&self) -> bool {
        self.kind != SubscriptionKind::Local
    }

    #[inline]
    pub fn is_remote_central(&self) -> bool {
        self.kind == SubscriptionKind::RemoteCentral
    }

    #[inline]
    pub fn is_source(&self) -> bool {
        self.source
    }

    #[inline]
    pub fn request_supported(&self) -> bool {
        self.request_supported
    }

    #[inline]
    pub fn user(&self) -> UserId {
        self.user
    }

    #[inline]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    #[inline]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    #[inline]
    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Records the new state. Local and relay senders are told their new
    /// state through send control on the owning connection; the telegram
    /// is emitted only when the state actually changes.
    pub fn set_state(&mut self, state: SenderState, central_distributor: Option<BrokerId>) {
        let changed = self.state != state;
        self.state = state;
        self.central_distributor = central_distributor;
        if changed && self.kind != SubscriptionKind::RemoteCentral {
            self.connection.send_control_telegram(self.stream, state);
        }
    }

    /// Re-emits the current state even though it did not change, so a
    /// changed candidate set propagates to the other side.
    pub fn reassert_state(&self) {
        if self.kind != SubscriptionKind::RemoteCentral {
            self.connection.send_control_telegram(self.stream, self.state);
        }
    }

    #[inline]
    pub fn central_distributor(&self) -> Option<BrokerId> {
        self.central_distributor
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self.kind {
            SubscriptionKind::RemoteCentral => {
                derive_remote_state(&self.potential_distributors, &self.acks)
            }
            _ => ConnectionState::Valid,
        }
    }

    /// The remote central distributor this subscription is aimed at, once
    /// known (acknowledged, or the only candidate).
    pub fn central_distributor_id(&self) -> Option<BrokerId> {
        derive_central_distributor(&self.potential_distributors, &self.acks)
    }

    /// Records a per-candidate acknowledgement. Only terminal answers are
    /// recorded; a non-answer never overwrites what a candidate said.
    pub fn set_remote_ack(&mut self, broker: BrokerId, state: ConnectionState) {
        if matches!(
            state,
            ConnectionState::Valid
                | ConnectionState::RemoteNotResponsible
                | ConnectionState::MultiplePositiveAcks
        ) {
            self.acks.insert(broker, state);
        }
    }

    #[inline]
    pub fn potential_distributors(&self) -> &BTreeSet<BrokerId> {
        &self.potential_distributors
    }

    pub fn set_potential_distributors(&mut self, brokers: impl IntoIterator<Item = BrokerId>) {
        self.potential_distributors = brokers.into_iter().collect();
    }

    pub fn add_potential_distributor(&mut self, broker: BrokerId) {
        self.potential_distributors.insert(broker);
    }

    pub fn remove_potential_distributor(&mut self, broker: BrokerId) {
        self.potential_distributors.remove(&broker);
    }

    /// Issues the outward subscribe request for a remote-central
    /// subscription. Fire-and-forget; the acknowledgement re-enters the
    /// controller later.
    pub fn subscribe(&self) {
        if self.kind != SubscriptionKind::RemoteCentral {
            return;
        }
        if let Some(neighbor) = self.connection.as_neighbor() {
            neighbor.send_remote_subscribe(
                self.stream,
                RemoteSubscribeRole::Source,
                &self.potential_distributors,
            );
        }
    }

    /// Withdraws the outward subscription, if any. Local and relay
    /// subscriptions have nothing to withdraw on our side.
    pub fn unsubscribe(&self) {
        if self.kind != SubscriptionKind::RemoteCentral {
            return;
        }
        if let Some(neighbor) = self.connection.as_neighbor() {
            neighbor.send_remote_unsubscribe(self.stream, RemoteSubscribeRole::Source);
        }
    }
}

/// A receiving subscription (drain or plain receiver)
pub struct ReceivingSubscription {
    id: SubscriptionId,
    stream: StreamId,
    kind: SubscriptionKind,
    connection: Arc<dyn Connection>,
    user: UserId,
    drain: bool,
    options: DeliveryOptions,
    state: ReceiverState,
    central_distributor: Option<BrokerId>,
    potential_distributors: BTreeSet<BrokerId>,
    acks: BTreeMap<BrokerId, ConnectionState>,
}

impl ReceivingSubscription {
    pub fn local(
        id: SubscriptionId,
        stream: StreamId,
        connection: Arc<dyn Connection>,
        user: UserId,
        drain: bool,
        options: DeliveryOptions,
    ) -> Self {
        ReceivingSubscription {
            id,
            stream,
            kind: SubscriptionKind::Local,
            connection,
            user,
            drain,
            options,
            state: ReceiverState::Unknown,
            central_distributor: None,
            potential_distributors: BTreeSet::new(),
            acks: BTreeMap::new(),
        }
    }

    /// A receiver forwarded by a neighbor broker. Never a drain; relays
    /// want every record, delayed ones included.
    pub fn remote_relay(
        id: SubscriptionId,
        stream: StreamId,
        connection: Arc<dyn Connection>,
        user: UserId,
        potential: BTreeSet<BrokerId>,
    ) -> Self {
        ReceivingSubscription {
            id,
            stream,
            kind: SubscriptionKind::RemoteRelay,
            connection,
            user,
            drain: false,
            options: DeliveryOptions::delayed(),
            state: ReceiverState::Unknown,
            central_distributor: None,
            potential_distributors: potential,
            acks: BTreeMap::new(),
        }
    }

    /// Our own subscription toward a remote central distributor that is
    /// to act as drain for this broker.
    pub fn remote_central(
        id: SubscriptionId,
        stream: StreamId,
        connection: Arc<dyn Connection>,
        user: UserId,
    ) -> Self {
        ReceivingSubscription {
            id,
            stream,
            kind: SubscriptionKind::RemoteCentral,
            connection,
            user,
            drain: true,
            options: DeliveryOptions::delayed(),
            state: ReceiverState::Unknown,
            central_distributor: None,
            potential_distributors: BTreeSet::new(),
            acks: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.kind == SubscriptionKind::Local
    }

    #[inline]
    pub fn is_remote(&self) -> bool {
        self.kind != SubscriptionKind::Local
    }

    #[inline]
    pub fn is_remote_central(&self) -> bool {
        self.kind == SubscriptionKind::RemoteCentral
    }

    #[inline]
    pub fn is_drain(&self) -> bool {
        self.drain
    }

    #[inline]
    pub fn user(&self) -> UserId {
        self.user
    }

    #[inline]
    pub fn options(&self) -> DeliveryOptions {
        self.options
    }

    #[inline]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    #[inline]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    #[inline]
    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Records the new state. Receivers are informed through explicit
    /// state telegrams sent by the controller, never implicitly here.
    pub fn set_state(&mut self, state: ReceiverState, central_distributor: Option<BrokerId>) {
        self.state = state;
        self.central_distributor = central_distributor;
    }

    #[inline]
    pub fn central_distributor(&self) -> Option<BrokerId> {
        self.central_distributor
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self.kind {
            SubscriptionKind::RemoteCentral => {
                derive_remote_state(&self.potential_distributors, &self.acks)
            }
            _ => ConnectionState::Valid,
        }
    }

    pub fn central_distributor_id(&self) -> Option<BrokerId> {
        derive_central_distributor(&self.potential_distributors, &self.acks)
    }

    /// Records a per-candidate acknowledgement. Only terminal answers are
    /// recorded; a non-answer never overwrites what a candidate said.
    pub fn set_remote_ack(&mut self, broker: BrokerId, state: ConnectionState) {
        if matches!(
            state,
            ConnectionState::Valid
                | ConnectionState::RemoteNotResponsible
                | ConnectionState::MultiplePositiveAcks
        ) {
            self.acks.insert(broker, state);
        }
    }

    #[inline]
    pub fn potential_distributors(&self) -> &BTreeSet<BrokerId> {
        &self.potential_distributors
    }

    pub fn set_potential_distributors(&mut self, brokers: impl IntoIterator<Item = BrokerId>) {
        self.potential_distributors = brokers.into_iter().collect();
    }

    pub fn add_potential_distributor(&mut self, broker: BrokerId) {
        self.potential_distributors.insert(broker);
    }

    pub fn remove_potential_distributor(&mut self, broker: BrokerId) {
        self.potential_distributors.remove(&broker);
    }

    pub fn send_data_telegram(&self, telegram: &DataTelegram) {
        self.connection.send_data_telegram(telegram);
    }

    pub fn send_state_telegram(&self, state: ReceiverState) {
        self.connection.send_state_telegram(self.stream, state);
    }

    pub fn subscribe(&self) {
        if self.kind != SubscriptionKind::RemoteCentral {
            return;
        }
        if let Some(neighbor) = self.connection.as_neighbor() {
            neighbor.send_remote_subscribe(
                self.stream,
                RemoteSubscribeRole::Drain,
                &self.potential_distributors,
            );
        }
    }

    pub fn unsubscribe(&self) {
        if self.kind != SubscriptionKind::RemoteCentral {
            return;
        }
        if let Some(neighbor) = self.connection.as_neighbor() {
            neighbor.send_remote_unsubscribe(self.stream, RemoteSubscribeRole::Drain);
        }
    }
}
