//! Data telegrams and per-receiver delivery options
//!
//! A logical value can be split across several wire telegrams; such
//! telegrams form a *group* sharing one data index and are always
//! delivered together and in order.

use bytes::Bytes;

/// Data index value meaning "no real record has been sent yet".
///
/// A group carrying this index is distributed but never recorded as the
/// last sent index. Index 0 is reserved for "not the central distributor".
pub const INITIAL_DATA_INDEX: u64 = 1;

/// One data telegram as handed to the routing core
///
/// Wire encoding and decoding happen outside the core; the routing layer
/// only reads the index, the flags and the payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataTelegram {
    /// Sequence number of the group this telegram belongs to
    pub data_index: u64,
    /// Marked as delayed/backfilled data
    pub delayed: bool,
    /// Nonzero when the record carries an error marker instead of a value
    pub error_flag: u8,
    /// Opaque payload
    pub payload: Bytes,
}

impl DataTelegram {
    pub fn new(data_index: u64, payload: impl Into<Bytes>) -> Self {
        DataTelegram {
            data_index,
            delayed: false,
            error_flag: 0,
            payload: payload.into(),
        }
    }

    pub fn delayed(mut self) -> Self {
        self.delayed = true;
        self
    }

    pub fn with_error_flag(mut self, error_flag: u8) -> Self {
        self.error_flag = error_flag;
        self
    }
}

/// Per-receiver delivery filter options
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DeliveryOptions {
    /// Deliver delayed/backfilled groups as well
    pub with_delayed: bool,
    /// Suppress groups identical to the previously delivered one
    pub with_delta: bool,
}

impl DeliveryOptions {
    /// Current data only, every record.
    pub fn normal() -> Self {
        DeliveryOptions {
            with_delayed: false,
            with_delta: false,
        }
    }

    /// Current data only, changed records only.
    pub fn delta() -> Self {
        DeliveryOptions {
            with_delayed: false,
            with_delta: true,
        }
    }

    /// Everything, including delayed data.
    pub fn delayed() -> Self {
        DeliveryOptions {
            with_delayed: true,
            with_delta: false,
        }
    }
}

/// Delta comparison of two telegram groups.
///
/// Groups are equal when they have the same number of telegrams, neither
/// group's first telegram carries an error flag, and all payloads are
/// byte-identical. A group with an error marker is never considered a
/// duplicate.
pub fn groups_delta_equal(group1: &[DataTelegram], group2: &[DataTelegram]) -> bool {
    if group1.is_empty() || group2.is_empty() {
        return false;
    }
    if group1.len() != group2.len() {
        return false;
    }
    if group1[0].error_flag != 0 || group2[0].error_flag != 0 {
        return false;
    }
    group1
        .iter()
        .zip(group2.iter())
        .all(|(t1, t2)| t1.payload == t2.payload)
}
