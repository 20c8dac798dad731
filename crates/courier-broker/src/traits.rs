use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::types::{Delivery, EnqueueOptions, QueueOptions, Verdict};

/// A named queue on the broker.
///
/// `pause`, `await_confirmations` and `await_rpc_handling` take soft
/// budgets: implementations return within the budget whether or not the
/// operation fully settled, and callers treat failures as advisory.
#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    async fn enqueue(&self, payload: Vec<u8>, opts: EnqueueOptions) -> Result<(), BrokerError>;

    /// Registers a listener. Buffered messages are drained to the handler
    /// in order before push delivery begins.
    async fn listen(&self, handler: Arc<dyn MessageHandler>) -> Result<(), BrokerError>;

    /// Stops delivery, waiting up to `budget` for the in-flight handler to
    /// settle.
    async fn pause(&self, budget: Duration) -> Result<(), BrokerError>;

    /// Deletes the queue. Idempotent: deleting an already-deleted queue
    /// succeeds.
    async fn delete(&self) -> Result<(), BrokerError>;

    /// Waits up to `budget` for outstanding publisher confirmations.
    async fn await_confirmations(&self, budget: Duration) -> Result<(), BrokerError>;

    /// Waits up to `budget` for in-flight handler invocations to settle.
    async fn await_rpc_handling(&self, budget: Duration) -> Result<(), BrokerError>;
}

/// Connection-scoped broker operations.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Resolves a named queue, creating it when absent. Options are applied
    /// on first resolution.
    async fn get_queue(
        &self,
        name: &str,
        opts: QueueOptions,
    ) -> Result<Arc<dyn Queue>, BrokerError>;

    /// Closes the connection. Idempotent: closing an already-closed
    /// connection succeeds.
    async fn close(&self) -> Result<(), BrokerError>;

    fn is_closed(&self) -> bool;
}

/// A queue listener.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Verdict;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Verdict> + Send>>;

struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery) -> HandlerFuture + Send + Sync,
{
    async fn handle(&self, delivery: Delivery) -> Verdict {
        (self.0)(delivery).await
    }
}

/// Wraps a closure as a [`MessageHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Delivery) -> HandlerFuture + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}
