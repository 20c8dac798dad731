//! Terminal outcome types.
//!
//! Exactly one [`Outcome`] is ever placed on a response queue per request;
//! the response queue's capacity-1 semantics enforce this on the wire.

use rkyv::{Archive, Deserialize, Serialize};

/// Classification of a response body so the dispatcher can decode it
/// without sniffing.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Json,
    Text,
    Binary,
}

/// A well-formed HTTP response relayed from the worker.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    /// HTTP status code.
    pub status: u16,

    /// HTTP status text, or a synthetic explanation for protocol-level
    /// rejections (status 406).
    pub status_text: String,

    /// Response headers. Values are UTF-8; non-UTF8 values are stripped by
    /// the worker's sanitizer before the record crosses the wire.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    /// How `body` should be decoded.
    pub body_kind: BodyKind,
}

impl ResponseRecord {
    /// Creates a bodyless record with the given status.
    #[must_use]
    pub fn with_status(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            headers: Vec::new(),
            body: Vec::new(),
            body_kind: BodyKind::Empty,
        }
    }

    /// Gets a header value by name (case-insensitive).
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Error classification carried across the wire.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller cancelled the request.
    Canceled,
    /// The transport call timed out.
    Timeout,
    /// The transport could not reach the target.
    Network,
    /// Well-formed response rejected by status validation (4xx).
    BadRequest,
    /// Well-formed response rejected by status validation (5xx).
    BadResponse,
    /// A configuration option that cannot cross the boundary.
    Unsupported,
    /// The payload on the wire could not be decoded.
    Deserialization,
    /// Anything else: worker-side failures, rate-limit drops.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::BadRequest => "bad_request",
            Self::BadResponse => "bad_response",
            Self::Unsupported => "unsupported",
            Self::Deserialization => "deserialization",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// A structured failure relayed from the worker.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    /// Status code when the failure carried a response.
    pub status: Option<u16>,
}

impl ErrorRecord {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// An explicit cancellation outcome.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CancelRecord {
    pub reason: String,
}

impl CancelRecord {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The terminal result of one relayed request.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Response(ResponseRecord),
    Error(ErrorRecord),
    Canceled(CancelRecord),
}
