//! Progress event payloads.

use rkyv::{Archive, Deserialize, Serialize};

/// An upload or download progress tick.
///
/// Relayed verbatim from the worker's transport to the caller's progress
/// callback. Delivery is best-effort: ticks may be dropped, never replayed.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Bytes transferred so far.
    pub loaded: u64,

    /// Total bytes expected, if known.
    pub total: Option<u64>,

    /// Bytes transferred since the previous tick.
    pub bytes: u64,

    /// Transfer rate in bytes per second, if known.
    pub rate: Option<u64>,

    /// True for upload progress, false for download.
    pub upload: bool,
}

impl ProgressEvent {
    /// Creates a download progress tick.
    #[must_use]
    pub fn download(loaded: u64, total: Option<u64>, bytes: u64) -> Self {
        Self {
            loaded,
            total,
            bytes,
            rate: None,
            upload: false,
        }
    }

    /// Creates an upload progress tick.
    #[must_use]
    pub fn upload(loaded: u64, total: Option<u64>, bytes: u64) -> Self {
        Self {
            loaded,
            total,
            bytes,
            rate: None,
            upload: true,
        }
    }

    /// Completion ratio in `0.0..=1.0`, if the total is known.
    #[must_use]
    pub fn ratio(&self) -> Option<f64> {
        self.total
            .filter(|t| *t > 0)
            .map(|t| self.loaded as f64 / t as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_ratio() {
        let event = ProgressEvent::download(50, Some(200), 10);
        assert_eq!(event.ratio(), Some(0.25));
        assert!(!event.upload);

        let unknown = ProgressEvent::upload(50, None, 10);
        assert_eq!(unknown.ratio(), None);
        assert!(unknown.upload);
    }
}
