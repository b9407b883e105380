use thiserror::Error;

use crate::types::{ParticipantId, TrackId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("receiver closed")]
    ReceiverClosed,

    #[error("down track already exists for participant {0}")]
    DownTrackAlreadyExists(ParticipantId),

    #[error("either participant identity or ID needed")]
    PermissionNeedsIdentifier,

    #[error("could not find published track {0}")]
    TrackNotFound(TrackId),

    #[error("subscriber unavailable: {0}")]
    SubscriberUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure reading from an ingestion buffer. Every variant ends the layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("end of stream")]
    Eof,

    #[error("read failed: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A multi-track subscribe stopped at its first failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("subscribed to {subscribed} tracks before failing: {source}")]
pub struct AddSubscriberError {
    /// Tracks subscribed before the failure
    pub subscribed: usize,
    #[source]
    pub source: Error,
}
