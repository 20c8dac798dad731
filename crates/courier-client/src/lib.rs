//! Client-side request dispatcher for courier.
//!
//! An [`AdapterManager`] turns a broker connection and a shared queue name
//! into an [`Adapter`]: a handle whose [`dispatch`](Adapter::dispatch)
//! behaves like an ordinary HTTP call while actually publishing a
//! correlated request envelope to the queue and awaiting the single
//! outcome a worker places on the per-request response queue.
//!
//! ```no_run
//! use courier_broker::MemoryBroker;
//! use courier_client::{AdapterManager, ConnectionConfig, RequestConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), courier_client::DispatchError> {
//! let broker = Arc::new(MemoryBroker::new());
//! let adapter = AdapterManager::make("example-queue", ConnectionConfig::External(broker))?;
//! let response = adapter.dispatch(RequestConfig::get("/user/12345")).await?;
//! assert_eq!(response.status, 200);
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatcher;
mod error;
mod gate;
mod response;
pub mod serializer;

pub use config::{ProgressCallback, RequestConfig, StatusValidator};
pub use dispatcher::{Adapter, AdapterManager, ConnectionConfig};
pub use error::DispatchError;
pub use response::HttpResponse;
pub use serializer::{IndexStyle, ParamVisitor, ParamsSerializer, SerializeOptions, Visited};
