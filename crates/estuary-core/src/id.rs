//! Identity types for the estuary mesh
//!
//! All scalar identifiers are 64-bit. A stream is identified by the full
//! (object, attribute group, aspect, simulation variant) tuple; it is the
//! key under which all routing state is kept and is never mutated.

use std::fmt;

/// Broker identity - one data distributor instance in the mesh
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BrokerId(pub u64);

impl BrokerId {
    #[inline]
    pub fn new(id: u64) -> Self {
        BrokerId(id)
    }
}

impl fmt::Debug for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker({})", self.0)
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection identity - opaque handle to one transport connection,
/// comparable for equality
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    #[inline]
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

/// User identity, used for permission re-evaluation
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UserId(pub u64);

impl UserId {
    #[inline]
    pub fn new(id: u64) -> Self {
        UserId(id)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "User({})", self.0)
    }
}

/// Subscription identity - unique within one stream controller, never reused
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    #[inline]
    pub fn new(id: u64) -> Self {
        SubscriptionId(id)
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

/// Stream identity - one publish/subscribe channel
///
/// The tuple of object, attribute group, aspect and simulation variant.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub object: u64,
    pub attribute_group: u64,
    pub aspect: u64,
    pub simulation_variant: u16,
}

impl StreamId {
    #[inline]
    pub fn new(object: u64, attribute_group: u64, aspect: u64, simulation_variant: u16) -> Self {
        StreamId {
            object,
            attribute_group,
            aspect,
            simulation_variant,
        }
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stream({}:{}:{}:{})",
            self.object, self.attribute_group, self.aspect, self.simulation_variant
        )
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.object, self.attribute_group, self.aspect, self.simulation_variant
        )
    }
}
