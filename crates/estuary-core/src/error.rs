//! Error types for the estuary routing core
//!
//! Permission, role and topology conditions are not errors - they are
//! surfaced as subscription states and recovered through the admission
//! algorithm. The error type here covers only what genuinely fails at a
//! call boundary.

use thiserror::Error;

use crate::{BrokerId, StreamId};

/// Routing core errors
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("no connection available to broker {0}")]
    MissingBestConnection(BrokerId),

    #[error("connection to broker {0} is not a neighbor connection")]
    NotANeighborConnection(BrokerId),

    #[error("no controller registered for stream {0}")]
    UnknownStream(StreamId),
}

/// Result type for routing operations
pub type RoutingResult<T> = Result<T, RoutingError>;
