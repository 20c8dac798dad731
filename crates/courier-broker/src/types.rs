use std::time::SystemTime;

/// A message handed to a queue listener.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Vec<u8>,
    /// Broker-level correlation attribute set by the publisher.
    pub correlation_id: Option<String>,
    pub enqueued_at: SystemTime,
}

impl Delivery {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            correlation_id: None,
            enqueued_at: SystemTime::now(),
        }
    }
}

/// The listener's decision about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ack,
    Nack { requeue: bool },
}

/// Options applied when a queue is first resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Retain at most this many buffered messages; the oldest is dropped
    /// beyond the cap.
    pub max_length: Option<usize>,
    /// Publisher-acknowledged delivery: `enqueue` resolves only after the
    /// broker confirms receipt.
    pub confirm: bool,
}

impl QueueOptions {
    /// Confirm-mode delivery, unbounded buffer.
    pub const fn confirm() -> Self {
        Self {
            max_length: None,
            confirm: true,
        }
    }

    /// Bounded buffer retaining the most recent `n` messages.
    pub const fn capacity(n: usize) -> Self {
        Self {
            max_length: Some(n),
            confirm: false,
        }
    }
}

/// Options applied per publish.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub correlation_id: Option<String>,
}

impl EnqueueOptions {
    pub fn correlated(id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(id.into()),
        }
    }
}
