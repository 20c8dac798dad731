//! Queue broker interface for courier.
//!
//! The dispatcher and worker never talk to a concrete broker directly;
//! they program against the [`Broker`] and [`Queue`] traits defined here.
//! Connection setup, channel multiplexing and message acknowledgement are
//! the broker implementation's problem, not the protocol's.
//!
//! [`MemoryBroker`] is the in-process implementation used by tests and
//! embedded deployments.

mod error;
mod lifecycle;
mod memory;
mod traits;
mod types;

pub use error::BrokerError;
pub use lifecycle::ConnectionState;
pub use memory::MemoryBroker;
pub use traits::{handler_fn, Broker, MessageHandler, Queue};
pub use types::{Delivery, EnqueueOptions, QueueOptions, Verdict};
