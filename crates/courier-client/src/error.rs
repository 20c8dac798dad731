//! Dispatcher error taxonomy.

use courier_broker::BrokerError;
use courier_proto::{ErrorKind, ProtocolError};
use thiserror::Error;

use crate::response::HttpResponse;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// The caller's cancellation signal won the race.
    #[error("Request canceled: {reason}")]
    Canceled { reason: String },

    /// A well-formed response failed the caller's status predicate.
    #[error("{message}")]
    Status {
        status: u16,
        kind: ErrorKind,
        message: String,
        response: Box<HttpResponse>,
    },

    /// The worker relayed a transport failure.
    #[error("Transport failure ({kind}): {message}")]
    Transport {
        kind: ErrorKind,
        message: String,
        status: Option<u16>,
    },

    /// The response payload could not be deserialized.
    #[error("Failed to deserialize response")]
    Deserialization,

    /// The response body could not be decoded as the requested type.
    #[error("Failed to decode response body: {0}")]
    Decode(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The owned connection has closed; the adapter cannot be reused.
    #[error("Connection has been closed. Create a new adapter manager instance")]
    ConnectionClosed,
}

impl DispatchError {
    /// The HTTP status associated with this failure, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport { status, .. } => *status,
            _ => None,
        }
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}
