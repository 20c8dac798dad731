//! In-process broker implementation.
//!
//! Backs the test suite and embedded deployments. Each queue keeps an
//! ordered buffer; registered listeners drain the buffer in order and then
//! receive push delivery. Delivery within one queue is serial, so listener
//! observation order matches publish order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::lifecycle::Lifecycle;
use crate::traits::{Broker, MessageHandler, Queue};
use crate::types::{Delivery, EnqueueOptions, QueueOptions, Verdict};

#[derive(Default)]
struct QueueState {
    buffer: VecDeque<Delivery>,
    listeners: Vec<Arc<dyn MessageHandler>>,
    next_listener: usize,
    paused: bool,
    deleted: bool,
    pump_running: bool,
}

struct MemoryQueue {
    name: String,
    opts: QueueOptions,
    state: Mutex<QueueState>,
    /// Handler invocations currently awaited by the pump.
    in_flight: AtomicUsize,
    /// Notified when `in_flight` returns to zero.
    idle: Notify,
    /// Notified when the pump may have work.
    pump: Notify,
    enqueued_total: AtomicUsize,
    max_depth: AtomicUsize,
    weak_self: Weak<MemoryQueue>,
}

enum PumpStep {
    Deliver(Delivery, Arc<dyn MessageHandler>),
    Wait,
    Exit,
}

fn relock<'a, T>(
    result: Result<MutexGuard<'a, T>, std::sync::PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    // Locks are never held across await points; poisoning would mean a
    // panic inside one of these short critical sections.
    match result {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryQueue {
    fn new(name: String, opts: QueueOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name,
            opts,
            state: Mutex::new(QueueState::default()),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            pump: Notify::new(),
            enqueued_total: AtomicUsize::new(0),
            max_depth: AtomicUsize::new(0),
            weak_self: weak.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        relock(self.state.lock())
    }

    fn is_deleted(&self) -> bool {
        self.lock().deleted
    }

    fn next_step(&self) -> PumpStep {
        let mut state = self.lock();
        if state.deleted {
            state.pump_running = false;
            return PumpStep::Exit;
        }
        if state.paused || state.listeners.is_empty() || state.buffer.is_empty() {
            return PumpStep::Wait;
        }
        let delivery = match state.buffer.pop_front() {
            Some(d) => d,
            None => return PumpStep::Wait,
        };
        let idx = state.next_listener % state.listeners.len();
        state.next_listener = state.next_listener.wrapping_add(1);
        PumpStep::Deliver(delivery, state.listeners[idx].clone())
    }

    async fn run_pump(self: Arc<Self>) {
        loop {
            let notified = self.pump.notified();
            match self.next_step() {
                PumpStep::Exit => break,
                PumpStep::Wait => notified.await,
                PumpStep::Deliver(delivery, handler) => {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    let verdict = handler.handle(delivery.clone()).await;
                    if let Verdict::Nack { requeue: true } = verdict {
                        self.lock().buffer.push_back(delivery);
                    }
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    self.idle.notify_waiters();
                }
            }
        }
        debug!(queue = %self.name, "delivery pump stopped");
    }

    async fn drain_in_flight(&self, budget: Duration) -> Result<(), BrokerError> {
        let wait = async {
            loop {
                let idle = self.idle.notified();
                if self.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(budget, wait)
            .await
            .map_err(|_| BrokerError::Timeout)
    }

    /// Waits until every buffered message has been handed to a listener and
    /// every handler invocation has settled. Returns immediately when no
    /// listener is active, since nothing would ever drain the buffer.
    async fn drain_deliveries(&self, budget: Duration) -> Result<(), BrokerError> {
        let wait = async {
            loop {
                let idle = self.idle.notified();
                let drained = {
                    let state = self.lock();
                    state.deleted
                        || state.paused
                        || state.listeners.is_empty()
                        || state.buffer.is_empty()
                };
                if drained && self.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(budget, wait)
            .await
            .map_err(|_| BrokerError::Timeout)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, payload: Vec<u8>, opts: EnqueueOptions) -> Result<(), BrokerError> {
        {
            let mut state = self.lock();
            if state.deleted {
                return Err(BrokerError::QueueDeleted(self.name.clone()));
            }
            let mut delivery = Delivery::new(payload);
            delivery.correlation_id = opts.correlation_id;
            state.buffer.push_back(delivery);
            if let Some(max) = self.opts.max_length {
                while state.buffer.len() > max {
                    state.buffer.pop_front();
                }
            }
            self.enqueued_total.fetch_add(1, Ordering::SeqCst);
            self.max_depth
                .fetch_max(state.buffer.len(), Ordering::SeqCst);
        }
        self.pump.notify_one();
        Ok(())
    }

    async fn listen(&self, handler: Arc<dyn MessageHandler>) -> Result<(), BrokerError> {
        let start_pump = {
            let mut state = self.lock();
            if state.deleted {
                return Err(BrokerError::QueueDeleted(self.name.clone()));
            }
            state.listeners.push(handler);
            !std::mem::replace(&mut state.pump_running, true)
        };
        if start_pump {
            if let Some(queue) = self.weak_self.upgrade() {
                // The pump owns delivery for this queue; it exits on delete.
                tokio::spawn(queue.run_pump());
            }
        }
        self.pump.notify_one();
        Ok(())
    }

    async fn pause(&self, budget: Duration) -> Result<(), BrokerError> {
        self.lock().paused = true;
        self.drain_in_flight(budget).await
    }

    async fn delete(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.lock();
            if !state.deleted {
                state.deleted = true;
                state.buffer.clear();
                state.listeners.clear();
            }
        }
        self.pump.notify_one();
        Ok(())
    }

    async fn await_confirmations(&self, budget: Duration) -> Result<(), BrokerError> {
        // Confirmations are synchronous in-process; only handler work can
        // still be outstanding.
        self.drain_in_flight(budget).await
    }

    async fn await_rpc_handling(&self, budget: Duration) -> Result<(), BrokerError> {
        self.drain_deliveries(budget).await
    }
}

struct BrokerInner {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    lifecycle: Lifecycle,
}

/// In-memory [`Broker`].
///
/// Cloning shares the underlying connection; `close` affects all clones.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: Mutex::new(HashMap::new()),
                lifecycle: Lifecycle::new(),
            }),
        }
    }

    fn lock_queues(&self) -> MutexGuard<'_, HashMap<String, Arc<MemoryQueue>>> {
        relock(self.inner.queues.lock())
    }

    fn find(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.lock_queues().get(name).cloned()
    }

    /// Current buffered depth of a queue. Diagnostic accessor.
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> usize {
        self.find(name).map_or(0, |q| q.lock().buffer.len())
    }

    /// Highest buffered depth a queue has reached. Diagnostic accessor.
    #[must_use]
    pub fn max_depth(&self, name: &str) -> usize {
        self.find(name)
            .map_or(0, |q| q.max_depth.load(Ordering::SeqCst))
    }

    /// Total messages ever published to a queue. Diagnostic accessor.
    #[must_use]
    pub fn enqueued_total(&self, name: &str) -> usize {
        self.find(name)
            .map_or(0, |q| q.enqueued_total.load(Ordering::SeqCst))
    }

    /// Whether a live (non-deleted) queue exists under `name`.
    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.find(name).is_some_and(|q| !q.is_deleted())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn get_queue(
        &self,
        name: &str,
        opts: QueueOptions,
    ) -> Result<Arc<dyn Queue>, BrokerError> {
        if !self.inner.lifecycle.is_active() {
            return Err(BrokerError::ConnectionClosed);
        }
        let mut queues = self.lock_queues();
        if let Some(existing) = queues.get(name) {
            if !existing.is_deleted() {
                // Options are applied on first resolution only.
                return Ok(existing.clone());
            }
        }
        let queue = MemoryQueue::new(name.to_owned(), opts);
        queues.insert(name.to_owned(), queue.clone());
        Ok(queue)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.inner.lifecycle.begin_close() {
            // Already closing or closed.
            return Ok(());
        }
        let queues: Vec<Arc<MemoryQueue>> = self.lock_queues().values().cloned().collect();
        for queue in &queues {
            if let Err(e) = queue.delete().await {
                warn!(queue = queue.name(), error = %e, "failed to drop queue on close");
            }
        }
        self.lock_queues().clear();
        self.inner.lifecycle.finish_close();
        debug!("memory broker closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        !self.inner.lifecycle.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::handler_fn;
    use tokio::sync::mpsc;

    fn collector() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |delivery: Delivery| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(delivery.payload);
                Verdict::Ack
            })
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn buffered_messages_drain_to_late_listener() {
        let broker = MemoryBroker::new();
        let queue = broker
            .get_queue("q", QueueOptions::default())
            .await
            .unwrap();

        queue.enqueue(b"one".to_vec(), EnqueueOptions::default()).await.unwrap();
        queue.enqueue(b"two".to_vec(), EnqueueOptions::default()).await.unwrap();

        let (handler, mut rx) = collector();
        queue.listen(handler).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), b"one");
        assert_eq!(rx.recv().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn capacity_one_retains_latest() {
        let broker = MemoryBroker::new();
        let queue = broker.get_queue("q", QueueOptions::capacity(1)).await.unwrap();

        queue.enqueue(b"old".to_vec(), EnqueueOptions::default()).await.unwrap();
        queue.enqueue(b"new".to_vec(), EnqueueOptions::default()).await.unwrap();

        assert_eq!(broker.queue_depth("q"), 1);
        assert_eq!(broker.max_depth("q"), 1);

        let (handler, mut rx) = collector();
        queue.listen(handler).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let broker = MemoryBroker::new();
        let queue = broker
            .get_queue("q", QueueOptions::default())
            .await
            .unwrap();

        queue.delete().await.unwrap();
        queue.delete().await.unwrap();
        assert!(!broker.has_queue("q"));

        assert!(matches!(
            queue.enqueue(b"x".to_vec(), EnqueueOptions::default()).await,
            Err(BrokerError::QueueDeleted(_))
        ));
    }

    #[tokio::test]
    async fn deleted_queue_is_recreated_fresh() {
        let broker = MemoryBroker::new();
        let queue = broker
            .get_queue("q", QueueOptions::default())
            .await
            .unwrap();
        queue.enqueue(b"stale".to_vec(), EnqueueOptions::default()).await.unwrap();
        queue.delete().await.unwrap();

        let fresh = broker
            .get_queue("q", QueueOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
        fresh.enqueue(b"ok".to_vec(), EnqueueOptions::default()).await.unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_fast() {
        let broker = MemoryBroker::new();
        broker.get_queue("q", QueueOptions::confirm()).await.unwrap();

        broker.close().await.unwrap();
        broker.close().await.unwrap();
        assert!(broker.is_closed());

        assert!(matches!(
            broker.get_queue("q", QueueOptions::default()).await,
            Err(BrokerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn pause_stops_delivery() {
        let broker = MemoryBroker::new();
        let queue = broker
            .get_queue("q", QueueOptions::default())
            .await
            .unwrap();
        let (handler, mut rx) = collector();
        queue.listen(handler).await.unwrap();

        queue.pause(Duration::from_millis(100)).await.unwrap();
        queue.enqueue(b"held".to_vec(), EnqueueOptions::default()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn nack_without_requeue_drops() {
        let broker = MemoryBroker::new();
        let queue = broker
            .get_queue("q", QueueOptions::default())
            .await
            .unwrap();
        queue
            .listen(handler_fn(|_| {
                Box::pin(async { Verdict::Nack { requeue: false } })
            }))
            .await
            .unwrap();

        queue.enqueue(b"x".to_vec(), EnqueueOptions::default()).await.unwrap();
        queue
            .await_rpc_handling(Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn rpc_drain_flushes_buffered_messages_to_listener() {
        let broker = MemoryBroker::new();
        let queue = broker
            .get_queue("q", QueueOptions::default())
            .await
            .unwrap();
        let (handler, mut rx) = collector();
        queue.listen(handler).await.unwrap();

        for i in 0..10u8 {
            queue.enqueue(vec![i], EnqueueOptions::default()).await.unwrap();
        }
        queue
            .await_rpc_handling(Duration::from_millis(500))
            .await
            .unwrap();

        // Every message was handed off before the drain resolved.
        for i in 0..10u8 {
            assert_eq!(rx.try_recv().unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn rpc_drain_returns_immediately_without_listeners() {
        let broker = MemoryBroker::new();
        let queue = broker
            .get_queue("q", QueueOptions::default())
            .await
            .unwrap();
        queue.enqueue(b"held".to_vec(), EnqueueOptions::default()).await.unwrap();

        queue
            .await_rpc_handling(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn correlation_id_survives_delivery() {
        let broker = MemoryBroker::new();
        let queue = broker.get_queue("q", QueueOptions::confirm()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        queue
            .listen(handler_fn(move |delivery: Delivery| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(delivery.correlation_id);
                    Verdict::Ack
                })
            }))
            .await
            .unwrap();

        queue
            .enqueue(b"x".to_vec(), EnqueueOptions::correlated("req-1"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some("req-1".to_owned()));
    }
}
