//! Per-request queue topology.
//!
//! For base queue name `N` and request id `R`, a request uses five queues:
//!
//! - `N`: shared, long-lived, confirm-mode delivery
//! - `N/R/response`: capacity 1, only the latest message retained
//! - `N/R/upload-progress`
//! - `N/R/download-progress`
//! - `N/R/cancel`
//!
//! The four `R`-scoped queues are ephemeral: the dispatcher creates them
//! before publishing and deletes them after the outcome settles. The worker
//! operates on them but never deletes them.

use crate::types::RequestId;

/// Buffered-message cap on the response queue.
pub const RESPONSE_QUEUE_CAPACITY: usize = 1;

/// The resolved queue names for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub request: String,
    pub response: String,
    pub upload_progress: String,
    pub download_progress: String,
    pub cancel: String,
}

impl QueueTopology {
    /// Resolves the topology for `base` and `request_id`.
    ///
    /// Deterministic: dispatcher and worker resolve identical names.
    #[must_use]
    pub fn resolve(base: &str, request_id: RequestId) -> Self {
        Self {
            request: base.to_owned(),
            response: Self::scoped(base, request_id, "response"),
            upload_progress: Self::scoped(base, request_id, "upload-progress"),
            download_progress: Self::scoped(base, request_id, "download-progress"),
            cancel: Self::scoped(base, request_id, "cancel"),
        }
    }

    fn scoped(base: &str, request_id: RequestId, suffix: &str) -> String {
        format!("{base}/{request_id}/{suffix}")
    }

    /// The four per-request queue names, in teardown order.
    #[must_use]
    pub fn ephemeral(&self) -> [&str; 4] {
        [
            &self.response,
            &self.upload_progress,
            &self.download_progress,
            &self.cancel,
        ]
    }

    /// All five queue names.
    #[must_use]
    pub fn all(&self) -> [&str; 5] {
        [
            &self.request,
            &self.response,
            &self.upload_progress,
            &self.download_progress,
            &self.cancel,
        ]
    }
}
