//! Queue-consuming request executor for courier.
//!
//! A [`Worker`] listens on a shared request queue, admits jobs through a
//! rate limiter, executes them over HTTP via a pluggable
//! [`TransportClient`], relays progress ticks, honours cancellation
//! markers, and publishes exactly one outcome per request.
//!
//! ```no_run
//! use courier_worker::{RunnerConfig, TransportDefaults, Worker, WorkerConnection};
//!
//! # async fn example() -> Result<(), courier_worker::WorkerError> {
//! let worker = Worker::with_http(
//!     "example-queue",
//!     WorkerConnection::in_memory(),
//!     RunnerConfig::default(),
//!     TransportDefaults {
//!         base_url: Some("https://api.example".to_owned()),
//!         ..TransportDefaults::default()
//!     },
//! )?;
//! worker.start().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod limiter;
mod sanitize;
mod transport;
mod worker;

pub use config::{ConfigError, WorkerConfig};
pub use error::WorkerError;
pub use limiter::{
    JobExec, JobFuture, RateLimitedRunner, RunnerConfig, SpillHook, SpillPolicy, Submitted,
};
pub use sanitize::{sanitize_json, MAX_JSON_DEPTH};
pub use transport::{
    HttpTransport, Interceptors, RequestInterceptor, ResponseInterceptor, TransportClient,
    TransportDefaults, TransportError, TransportProgress, TransportRequest, TransportResponse,
};
pub use worker::{Worker, WorkerConnection};
