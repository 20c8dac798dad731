//! Wire protocol types for courier request relay.
//!
//! Courier transports HTTP-style requests as correlated messages over a
//! queue broker. This crate defines the payloads both sides exchange:
//!
//! - [`RequestEnvelope`]: the sanitized, transmissible copy of a request
//!   configuration, JSON-encoded on the wire and tagged with a
//!   [`RequestId`] correlation attribute.
//! - [`Outcome`]: the single terminal result of one request (a response,
//!   an error, or a cancellation), rkyv-encoded.
//! - [`ProgressEvent`]: best-effort upload/download progress ticks,
//!   rkyv-encoded and relayed verbatim.
//! - [`QueueTopology`]: deterministic naming of the five queues a request
//!   needs, resolved identically by dispatcher and worker.

pub mod codec;
mod envelope;
mod error;
mod outcome;
mod progress;
mod topology;
mod types;

pub use codec::{
    decode_envelope, decode_outcome, decode_progress, encode_envelope, encode_outcome,
    encode_progress, MAX_MESSAGE_SIZE,
};
pub use envelope::{BodyFormat, RequestEnvelope, ResponseType};
pub use error::ProtocolError;
pub use outcome::{BodyKind, CancelRecord, ErrorKind, ErrorRecord, Outcome, ResponseRecord};
pub use progress::ProgressEvent;
pub use topology::{QueueTopology, RESPONSE_QUEUE_CAPACITY};
pub use types::RequestId;
