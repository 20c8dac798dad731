//! Connection lifecycle.

use std::sync::atomic::{AtomicU8, Ordering};

/// Three-state connection lifecycle with single-writer discipline.
///
/// `Active → Closing → Closed`, driven by exactly one caller at a time:
/// the first `begin_close` wins, everyone else observes the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Active as u8),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Attempts the `Active → Closing` transition. Returns true for the
    /// single winner; false when closing is already underway or done.
    pub(crate) fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Active as u8,
                ConnectionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn finish_close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.is_active());

        assert!(lifecycle.begin_close());
        assert_eq!(lifecycle.state(), ConnectionState::Closing);

        // Second closer loses the race
        assert!(!lifecycle.begin_close());

        lifecycle.finish_close();
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
        assert!(!lifecycle.begin_close());
    }
}
