//! Transport endpoint contracts
//!
//! The routing core never performs connection establishment or wire
//! encoding itself; it talks to endpoints through these traits. All send
//! operations are fire-and-forget: they must not block, and answers (if
//! any) arrive later as separate calls into the stream controller.

use std::collections::BTreeSet;
use std::fmt;

use estuary_core::{
    BrokerId, ConnectionId, DataTelegram, ReceiverState, SenderState, StreamId, UserId,
};

/// Role requested from a remote central distributor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemoteSubscribeRole {
    /// The remote broker shall act as source toward us
    Source,
    /// The remote broker shall act as drain toward us
    Drain,
}

impl fmt::Display for RemoteSubscribeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteSubscribeRole::Source => write!(f, "source"),
            RemoteSubscribeRole::Drain => write!(f, "drain"),
        }
    }
}

/// Transport endpoint owning a subscription
///
/// Identity is the [`ConnectionId`]; two handles with equal ids refer to
/// the same connection.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Deliver a data telegram to the endpoint.
    fn send_data_telegram(&self, telegram: &DataTelegram);

    /// Push an explicit receiver state telegram (empty record carrying
    /// the subscription state).
    fn send_state_telegram(&self, stream: StreamId, state: ReceiverState);

    /// Push send control to a sender (the sender-side analogue of the
    /// state telegram).
    fn send_control_telegram(&self, stream: StreamId, state: SenderState);

    /// Downcast to the neighbor specialization, if this connection leads
    /// to another broker.
    fn as_neighbor(&self) -> Option<&dyn NeighborConnection> {
        None
    }
}

/// Connection to a neighbor broker
pub trait NeighborConnection: Connection {
    fn broker_id(&self) -> BrokerId;

    /// Cost metric for best-path comparison.
    fn throughput_resistance(&self) -> i32;

    fn remote_user_id(&self) -> UserId;

    /// Request a subscription at the remote side, naming the candidate
    /// central distributors the request is aimed at. The acknowledgement
    /// arrives later through the stream controller.
    fn send_remote_subscribe(
        &self,
        stream: StreamId,
        role: RemoteSubscribeRole,
        targets: &BTreeSet<BrokerId>,
    );

    /// Withdraw a previously requested subscription.
    fn send_remote_unsubscribe(&self, stream: StreamId, role: RemoteSubscribeRole);
}
