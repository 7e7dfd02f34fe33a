//! Subscription and connection state enumerations
//!
//! These are passive records: all transitions are driven by the stream
//! controller, the enums themselves only expose validity predicates.
//! The discriminants are stable because the diagnostic snapshot format
//! serializes them as ordinals.

/// State of a sending subscription (source or plain sender)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SenderState {
    /// Not yet admitted
    #[default]
    Unknown = 0,
    /// Admitted, waiting for the stream status to settle
    Waiting = 1,
    /// Admitted, no valid receiver is subscribed
    NoReceivers = 2,
    /// Admitted, at least one valid receiver is subscribed
    ReceiversAvailable = 3,
    /// Permission check failed
    NotAllowed = 4,
    /// Role conflict: the source slot is already occupied
    InvalidSubscription = 5,
    /// More than one remote central distributor answered positively
    MultipleRemoteLock = 6,
    /// Outward search found no responsible remote source
    NoRemoteSource = 7,
}

impl SenderState {
    /// True exactly for the admitted states.
    #[inline]
    pub fn is_valid_sender(self) -> bool {
        matches!(
            self,
            SenderState::Waiting | SenderState::NoReceivers | SenderState::ReceiversAvailable
        )
    }

    #[inline]
    pub fn ordinal(self) -> u32 {
        self as u32
    }
}

/// State of a receiving subscription (drain or plain receiver)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ReceiverState {
    #[default]
    Unknown = 0,
    Waiting = 1,
    /// Admitted, no valid sender is subscribed
    NoSenders = 2,
    /// Admitted, at least one valid sender is subscribed
    SendersAvailable = 3,
    NotAllowed = 4,
    /// Role conflict: the drain slot is already occupied
    InvalidSubscription = 5,
    MultipleRemoteLock = 6,
    /// Outward search found no responsible remote drain
    NoRemoteDrain = 7,
}

impl ReceiverState {
    /// True exactly for the admitted states.
    #[inline]
    pub fn is_valid_receiver(self) -> bool {
        matches!(
            self,
            ReceiverState::Waiting | ReceiverState::NoSenders | ReceiverState::SendersAvailable
        )
    }

    #[inline]
    pub fn ordinal(self) -> u32 {
        self as u32
    }
}

/// Acknowledgement state of a remote subscription's connection
///
/// Meaningful only for subscriptions involving a neighbor broker;
/// in-process subscriptions are always [`ConnectionState::Valid`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Unknown = 0,
    /// Outward request sent, no answer yet
    WaitingForRemoteAck = 1,
    /// Exactly one positive acknowledgement
    Valid = 2,
    /// More than one neighbor claims responsibility - inconsistent mesh
    MultiplePositiveAcks = 3,
    /// Explicit negative acknowledgement
    RemoteNotResponsible = 4,
}

impl ConnectionState {
    #[inline]
    pub fn is_valid(self) -> bool {
        self == ConnectionState::Valid
    }

    #[inline]
    pub fn ordinal(self) -> u32 {
        self as u32
    }
}
