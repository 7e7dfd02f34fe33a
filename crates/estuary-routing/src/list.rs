//! Per-stream subscription set
//!
//! Owns the sending and receiving subscription collections for one
//! stream, the designated source and drain, and the derived
//! central-distributor property. Index generation is composed here so
//! that issued wire indices are always above the reserved values.

use estuary_core::{BrokerId, StreamId, SubscriptionId, INITIAL_DATA_INDEX};

use crate::counter::DataIndexCounter;
use crate::subscription::{ReceivingSubscription, SendingSubscription};

/// The sending and receiving subscriptions of one stream.
#[derive(Default)]
pub struct SubscriptionList {
    senders: Vec<SendingSubscription>,
    receivers: Vec<ReceivingSubscription>,
    source: Option<SubscriptionId>,
    drain: Option<SubscriptionId>,
}

impl SubscriptionList {
    pub fn new() -> Self {
        SubscriptionList::default()
    }

    pub fn add_sender(&mut self, subscription: SendingSubscription) {
        if self.sender(subscription.id()).is_none() {
            self.senders.push(subscription);
        }
    }

    pub fn add_receiver(&mut self, subscription: ReceivingSubscription) {
        if self.receiver(subscription.id()).is_none() {
            self.receivers.push(subscription);
        }
    }

    pub fn remove_sender(&mut self, id: SubscriptionId) -> Option<SendingSubscription> {
        let pos = self.senders.iter().position(|s| s.id() == id)?;
        if self.source == Some(id) {
            self.source = None;
        }
        Some(self.senders.remove(pos))
    }

    pub fn remove_receiver(&mut self, id: SubscriptionId) -> Option<ReceivingSubscription> {
        let pos = self.receivers.iter().position(|r| r.id() == id)?;
        if self.drain == Some(id) {
            self.drain = None;
        }
        Some(self.receivers.remove(pos))
    }

    pub fn sender(&self, id: SubscriptionId) -> Option<&SendingSubscription> {
        self.senders.iter().find(|s| s.id() == id)
    }

    pub fn sender_mut(&mut self, id: SubscriptionId) -> Option<&mut SendingSubscription> {
        self.senders.iter_mut().find(|s| s.id() == id)
    }

    pub fn receiver(&self, id: SubscriptionId) -> Option<&ReceivingSubscription> {
        self.receivers.iter().find(|r| r.id() == id)
    }

    pub fn receiver_mut(&mut self, id: SubscriptionId) -> Option<&mut ReceivingSubscription> {
        self.receivers.iter_mut().find(|r| r.id() == id)
    }

    pub fn senders(&self) -> impl Iterator<Item = &SendingSubscription> {
        self.senders.iter()
    }

    pub fn receivers(&self) -> impl Iterator<Item = &ReceivingSubscription> {
        self.receivers.iter()
    }

    pub fn sender_ids(&self) -> Vec<SubscriptionId> {
        self.senders.iter().map(|s| s.id()).collect()
    }

    pub fn receiver_ids(&self) -> Vec<SubscriptionId> {
        self.receivers.iter().map(|r| r.id()).collect()
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty() && self.receivers.is_empty()
    }

    /// The source slot is free, or already held by exactly this
    /// subscription.
    pub fn can_set_source(&self, id: SubscriptionId) -> bool {
        self.source.is_none() || self.source == Some(id)
    }

    /// The drain slot is free, or already held by exactly this
    /// subscription.
    pub fn can_set_drain(&self, id: SubscriptionId) -> bool {
        self.drain.is_none() || self.drain == Some(id)
    }

    pub fn set_source(&mut self, id: Option<SubscriptionId>) {
        self.source = id;
    }

    pub fn set_drain(&mut self, id: Option<SubscriptionId>) {
        self.drain = id;
    }

    pub fn source_id(&self) -> Option<SubscriptionId> {
        self.source
    }

    pub fn drain_id(&self) -> Option<SubscriptionId> {
        self.drain
    }

    pub fn source(&self) -> Option<&SendingSubscription> {
        self.source.and_then(|id| self.sender(id))
    }

    pub fn drain(&self) -> Option<&ReceivingSubscription> {
        self.drain.and_then(|id| self.receiver(id))
    }

    /// A source is connected, locally or through a neighbor.
    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// A drain is connected, locally or through a neighbor.
    pub fn has_drain(&self) -> bool {
        self.drain.is_some()
    }

    pub fn has_drain_or_source(&self) -> bool {
        self.has_source() || self.has_drain()
    }

    /// This broker is central distributor for the stream: the designated
    /// source or drain is a local subscription. A source reached through
    /// a neighbor makes this broker a relay, not the central distributor.
    pub fn is_central_distributor(&self) -> bool {
        self.source().map(|s| s.is_local()).unwrap_or(false)
            || self.drain().map(|d| d.is_local()).unwrap_or(false)
    }

    /// The central distributor of the stream, as far as known.
    pub fn central_distributor_id(&self, local_broker: BrokerId) -> Option<BrokerId> {
        if self.is_central_distributor() {
            return Some(local_broker);
        }
        if let Some(source) = self.source() {
            if source.is_remote_central() {
                return source.central_distributor_id();
            }
        }
        if let Some(drain) = self.drain() {
            if drain.is_remote_central() {
                return drain.central_distributor_id();
            }
        }
        None
    }

    /// Issues the next wire data index for a stream this broker is
    /// central distributor of, 0 otherwise.
    ///
    /// The registry epoch occupies the upper half of the index and the
    /// per-stream counter the lower, shifted past the two reserved flag
    /// bits, so every issued index is greater than 1 and strictly
    /// monotonic within an epoch.
    pub fn next_data_index(
        &self,
        stream: StreamId,
        counter: &DataIndexCounter<StreamId>,
        running_number: u64,
    ) -> u64 {
        if !self.is_central_distributor() {
            return 0;
        }
        compose_data_index(running_number, counter.increment(&stream))
    }

    /// The last issued wire data index, without advancing the counter.
    /// Returns the reserved initial index when nothing has been issued.
    pub fn current_data_index(
        &self,
        stream: StreamId,
        counter: &DataIndexCounter<StreamId>,
        running_number: u64,
    ) -> u64 {
        if !self.is_central_distributor() {
            return 0;
        }
        let value = counter.get(&stream);
        if value < 0 {
            return INITIAL_DATA_INDEX;
        }
        compose_data_index(running_number, value)
    }
}

fn compose_data_index(running_number: u64, counter: i64) -> u64 {
    (running_number << 32) | (((counter as u64) & 0x3FFF_FFFF) << 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnection;
    use estuary_core::{DeliveryOptions, UserId};

    const STREAM: StreamId = StreamId {
        object: 1,
        attribute_group: 2,
        aspect: 3,
        simulation_variant: 0,
    };

    fn local_sender(id: u64, source: bool) -> SendingSubscription {
        SendingSubscription::local(
            SubscriptionId::new(id),
            STREAM,
            MockConnection::new(id),
            UserId::new(1),
            source,
            true,
        )
    }

    fn local_receiver(id: u64, drain: bool) -> ReceivingSubscription {
        ReceivingSubscription::local(
            SubscriptionId::new(id),
            STREAM,
            MockConnection::new(id),
            UserId::new(1),
            drain,
            DeliveryOptions::normal(),
        )
    }

    #[test]
    fn test_source_slot_exclusive() {
        let mut list = SubscriptionList::new();
        list.add_sender(local_sender(1, true));
        list.add_sender(local_sender(2, true));

        assert!(list.can_set_source(SubscriptionId::new(1)));
        list.set_source(Some(SubscriptionId::new(1)));
        assert!(!list.can_set_source(SubscriptionId::new(2)));
        // The occupying subscription itself may re-claim the slot.
        assert!(list.can_set_source(SubscriptionId::new(1)));
    }

    #[test]
    fn test_removing_source_clears_slot() {
        let mut list = SubscriptionList::new();
        list.add_sender(local_sender(1, true));
        list.set_source(Some(SubscriptionId::new(1)));
        assert!(list.has_source());

        list.remove_sender(SubscriptionId::new(1));
        assert!(!list.has_source());
        assert!(list.can_set_source(SubscriptionId::new(2)));
    }

    #[test]
    fn test_central_distributor_requires_local_slot_holder() {
        let mut list = SubscriptionList::new();
        assert!(!list.is_central_distributor());

        list.add_receiver(local_receiver(1, true));
        list.set_drain(Some(SubscriptionId::new(1)));
        assert!(list.is_central_distributor());
        assert_eq!(
            list.central_distributor_id(BrokerId::new(42)),
            Some(BrokerId::new(42))
        );
    }

    #[test]
    fn test_data_index_zero_when_not_central() {
        let list = SubscriptionList::new();
        let counter = DataIndexCounter::new();
        assert_eq!(list.next_data_index(STREAM, &counter, 1), 0);
        assert_eq!(list.current_data_index(STREAM, &counter, 1), 0);
    }

    #[test]
    fn test_data_index_is_monotonic_and_above_reserved_values() {
        let mut list = SubscriptionList::new();
        list.add_sender(local_sender(1, true));
        list.set_source(Some(SubscriptionId::new(1)));

        let counter = DataIndexCounter::new();
        assert_eq!(list.current_data_index(STREAM, &counter, 1), 1);

        let mut last = 1;
        for _ in 0..10 {
            let next = list.next_data_index(STREAM, &counter, 1);
            assert!(next > last);
            assert!(next > INITIAL_DATA_INDEX);
            assert_eq!(list.current_data_index(STREAM, &counter, 1), next);
            last = next;
        }
    }

    #[test]
    fn test_duplicate_add_is_ignored() {
        let mut list = SubscriptionList::new();
        list.add_sender(local_sender(1, false));
        list.add_sender(local_sender(1, false));
        assert_eq!(list.sender_count(), 1);
    }
}
