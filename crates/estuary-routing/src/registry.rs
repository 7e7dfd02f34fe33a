//! Stream registry and topology collaborator contract
//!
//! The registry owns the stream-to-controller map. It is explicit
//! process-wide state: constructed once at startup, passed by handle into
//! everything that needs it, torn down by dropping it - never reached
//! through statics.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use estuary_core::{BrokerId, RoutingError, RoutingResult, StreamId, UserId};

use crate::connection::Connection;
use crate::controller::StreamController;
use crate::counter::DataIndexCounter;

/// Topology and permission collaborator, implemented outside the routing
/// core.
///
/// All methods must return promptly and must not call back into a stream
/// controller synchronously - answers to anything asynchronous arrive as
/// separate calls into the controller.
pub trait Topology: Send + Sync {
    /// Neighbor brokers that may act as central distributor for the
    /// stream.
    fn potential_central_distributors(&self, stream: StreamId) -> Vec<BrokerId>;

    /// Current best connection toward a remote broker. The returned
    /// handle is a neighbor connection.
    fn best_connection_to(&self, broker: BrokerId) -> Option<Arc<dyn Connection>>;

    /// Fired exactly when this broker becomes central distributor for the
    /// stream.
    fn notify_new_central_distributor(&self, stream: StreamId);

    /// Fired exactly when this broker stops being central distributor for
    /// the stream.
    fn notify_was_central_distributor(&self, stream: StreamId);

    fn is_sender_allowed(&self, user: UserId, stream: StreamId) -> bool;

    fn is_receiver_allowed(&self, user: UserId, stream: StreamId) -> bool;
}

/// Process-wide stream-to-controller map.
///
/// Controllers are created lazily on first open and evicted on the close
/// that leaves them empty and unreferenced; the registry's own lock is
/// the arbitration point between eviction and re-creation.
pub struct StreamRegistry {
    local_broker: BrokerId,
    running_number: u64,
    topology: Arc<dyn Topology>,
    counter: Arc<DataIndexCounter<StreamId>>,
    controllers: Mutex<HashMap<StreamId, Arc<StreamController>>>,
}

impl StreamRegistry {
    /// `running_number` is the registry epoch folded into every issued
    /// data index; it must grow across broker restarts and is clamped to
    /// at least 1 so issued indices stay above the reserved values.
    pub fn new(local_broker: BrokerId, running_number: u64, topology: Arc<dyn Topology>) -> Self {
        StreamRegistry {
            local_broker,
            running_number: running_number.max(1),
            topology,
            counter: Arc::new(DataIndexCounter::new()),
            controllers: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the controller for a stream, creating it if absent. Callers
    /// bracket every batch of subscription mutations with
    /// [`Self::open_subscription`] / [`Self::close_subscription`].
    pub fn open_subscription(&self, stream: StreamId) -> Arc<StreamController> {
        let mut controllers = self.controllers.lock();
        let controller = controllers
            .entry(stream)
            .or_insert_with(|| {
                Arc::new(StreamController::new(
                    stream,
                    self.local_broker,
                    self.running_number,
                    self.counter.clone(),
                    self.topology.clone(),
                ))
            })
            .clone();
        controller.add_reference();
        controller
    }

    /// Closes a previously opened controller. The controller is evicted
    /// when this close leaves it both unreferenced and empty.
    pub fn close_subscription(&self, controller: &Arc<StreamController>) {
        let mut controllers = self.controllers.lock();
        if controller.release_reference() == 0 && controller.is_empty() {
            controllers.remove(&controller.stream());
        }
    }

    /// The controller for a stream, if any subscription activity created
    /// one.
    pub fn get(&self, stream: StreamId) -> Option<Arc<StreamController>> {
        self.controllers.lock().get(&stream).cloned()
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.lock().len()
    }

    /// Re-evaluates the permissions of every subscription belonging to
    /// the user, across all streams.
    pub fn handle_user_rights_changed(&self, user: UserId) {
        for controller in self.snapshot_controllers() {
            controller.handle_user_rights_changed(user);
        }
    }

    /// Re-evaluates outward subscriptions against the current best paths,
    /// across all streams. Called when the topology layer recomputed
    /// routes.
    pub fn update_all_remote_connections(&self) {
        for controller in self.snapshot_controllers() {
            controller.update_remote_connections();
        }
    }

    /// Byte-exact diagnostic snapshot of one stream's controller, see
    /// [`StreamController::serialize_snapshot`].
    pub fn serialize_subscription_info(&self, stream: StreamId) -> RoutingResult<Vec<u8>> {
        match self.get(stream) {
            Some(controller) => controller.serialize_snapshot(),
            None => Err(RoutingError::UnknownStream(stream)),
        }
    }

    /// One-line diagnostic description of a stream's subscription state.
    pub fn subscription_to_string(&self, stream: StreamId) -> String {
        match self.get(stream) {
            Some(controller) => format!(
                "{} [senders: {}, receivers: {}, central: {}]",
                stream,
                controller.sending_subscription_count(),
                controller.receiving_subscription_count(),
                controller.is_central_distributor(),
            ),
            None => format!("{} [no subscriptions]", stream),
        }
    }

    fn snapshot_controllers(&self) -> Vec<Arc<StreamController>> {
        self.controllers.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{ReceiverRole, SenderRole};
    use crate::testing::{MockConnection, MockTopology};
    use estuary_core::DeliveryOptions;

    const STREAM: StreamId = StreamId {
        object: 1,
        attribute_group: 2,
        aspect: 3,
        simulation_variant: 0,
    };

    fn registry() -> StreamRegistry {
        StreamRegistry::new(BrokerId::new(1), 7, MockTopology::new())
    }

    #[test]
    fn test_controller_created_lazily_and_shared() {
        let registry = registry();
        assert_eq!(registry.controller_count(), 0);

        let a = registry.open_subscription(STREAM);
        let b = registry.open_subscription(STREAM);
        assert_eq!(registry.controller_count(), 1);
        assert!(Arc::ptr_eq(&a, &b));

        registry.close_subscription(&a);
        registry.close_subscription(&b);
    }

    #[test]
    fn test_empty_controller_evicted_on_close() {
        let registry = registry();
        let controller = registry.open_subscription(STREAM);
        assert_eq!(registry.controller_count(), 1);

        registry.close_subscription(&controller);
        assert_eq!(registry.controller_count(), 0);
    }

    #[test]
    fn test_controller_with_subscriptions_survives_close() {
        let registry = registry();
        let controller = registry.open_subscription(STREAM);
        let conn = MockConnection::new(1);
        controller.subscribe_local_sender(conn, UserId::new(5), SenderRole::Sender, true);
        registry.close_subscription(&controller);
        assert_eq!(registry.controller_count(), 1);

        // Removing the last subscription does not evict by itself; the
        // next open/close cycle does.
        let controller = registry.open_subscription(STREAM);
        let removed =
            controller.remove_sending_subscriptions_of(estuary_core::ConnectionId::new(1));
        assert_eq!(removed.len(), 1);
        assert!(controller.is_empty());
        registry.close_subscription(&controller);
        assert_eq!(registry.controller_count(), 0);
    }

    #[test]
    fn test_open_while_referenced_keeps_controller() {
        let registry = registry();
        let a = registry.open_subscription(STREAM);
        let b = registry.open_subscription(STREAM);
        registry.close_subscription(&a);
        // Still referenced by b.
        assert_eq!(registry.controller_count(), 1);
        registry.close_subscription(&b);
        assert_eq!(registry.controller_count(), 0);
    }

    #[test]
    #[should_panic(expected = "close without matching open")]
    fn test_unbalanced_close_panics() {
        let registry = registry();
        let controller = registry.open_subscription(STREAM);
        registry.close_subscription(&controller);
        registry.close_subscription(&controller);
    }

    #[test]
    fn test_rights_change_fans_out() {
        let topology = MockTopology::new();
        let registry = StreamRegistry::new(BrokerId::new(1), 1, topology.clone());
        let controller = registry.open_subscription(STREAM);
        let conn = MockConnection::new(1);
        let user = UserId::new(5);
        controller.subscribe_local_receiver(
            conn.clone(),
            user,
            ReceiverRole::Receiver,
            DeliveryOptions::normal(),
        );

        topology.deny_receiver(user);
        registry.handle_user_rights_changed(user);
        assert_eq!(
            controller.receiver_state(conn.id()),
            Some(estuary_core::ReceiverState::NotAllowed)
        );

        topology.allow_receiver(user);
        registry.handle_user_rights_changed(user);
        assert!(controller
            .receiver_state(conn.id())
            .map(|s| s.is_valid_receiver())
            .unwrap_or(false));

        registry.close_subscription(&controller);
    }

    #[test]
    fn test_snapshot_requires_known_stream() {
        let registry = registry();
        assert!(matches!(
            registry.serialize_subscription_info(STREAM),
            Err(RoutingError::UnknownStream(_))
        ));

        let controller = registry.open_subscription(STREAM);
        let conn = MockConnection::new(1);
        controller.subscribe_local_sender(conn, UserId::new(5), SenderRole::Source, true);
        assert!(registry.serialize_subscription_info(STREAM).is_ok());
        registry.close_subscription(&controller);
    }

    #[test]
    fn test_subscription_to_string() {
        let registry = registry();
        assert_eq!(registry.subscription_to_string(STREAM), "1:2:3:0 [no subscriptions]");

        let controller = registry.open_subscription(STREAM);
        let conn = MockConnection::new(1);
        controller.subscribe_local_sender(conn, UserId::new(5), SenderRole::Source, true);
        assert_eq!(
            registry.subscription_to_string(STREAM),
            "1:2:3:0 [senders: 1, receivers: 0, central: true]"
        );
        registry.close_subscription(&controller);
    }
}
