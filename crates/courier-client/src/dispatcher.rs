//! Request dispatch over the broker.
//!
//! Per request the dispatcher resolves the five-queue topology, attaches
//! progress/response listeners before anything is published, runs the
//! compatibility gate, publishes the envelope under confirm-mode delivery,
//! races cancellation against the response, and tears the ephemeral queues
//! down under soft time budgets regardless of how the race settled.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use courier_broker::{
    handler_fn, Broker, BrokerError, Delivery, EnqueueOptions, MemoryBroker, MessageHandler,
    Queue, QueueOptions, Verdict,
};
use courier_proto::{
    codec, CancelRecord, ErrorKind, ErrorRecord, Outcome, QueueTopology, RequestId,
    RESPONSE_QUEUE_CAPACITY,
};
use futures_util::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::{ProgressCallback, RequestConfig};
use crate::error::DispatchError;
use crate::gate::{gate, Gated};
use crate::response::HttpResponse;

const DRAIN_BUDGET: Duration = Duration::from_millis(500);
const PAUSE_BUDGET: Duration = Duration::from_millis(1000);

/// How the dispatcher reaches the broker.
#[derive(Clone)]
pub enum ConnectionConfig {
    /// Caller-supplied connection. Never closed by this layer; the adapter
    /// stays reusable until the caller closes it.
    External(Arc<dyn Broker>),
    /// Connection owned by the adapter manager: closed once the first
    /// request settles, making the adapter single-use.
    Owned(Arc<dyn Broker>),
}

impl ConnectionConfig {
    /// An owned in-process broker connection.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::Owned(Arc::new(MemoryBroker::new()))
    }
}

/// Produces [`Adapter`] handles bound to one shared queue name.
pub struct AdapterManager {
    name: String,
    broker: Arc<dyn Broker>,
    external_connection: bool,
}

impl AdapterManager {
    #[must_use]
    pub fn new(name: impl Into<String>, config: ConnectionConfig) -> Self {
        let (broker, external_connection) = match config {
            ConnectionConfig::External(broker) => (broker, true),
            ConnectionConfig::Owned(broker) => (broker, false),
        };
        Self {
            name: name.into(),
            broker,
            external_connection,
        }
    }

    /// The adapter handle for this manager's queue.
    ///
    /// Fails once an owned connection has closed; owned connections are
    /// single-use, so create a new manager for further requests.
    pub fn adapter(&self) -> Result<Adapter, DispatchError> {
        if !self.external_connection && self.broker.is_closed() {
            return Err(DispatchError::ConnectionClosed);
        }
        Ok(Adapter {
            name: self.name.clone(),
            broker: self.broker.clone(),
            external_connection: self.external_connection,
        })
    }

    /// Builds a manager and returns its adapter in one step.
    pub fn make(name: impl Into<String>, config: ConnectionConfig) -> Result<Adapter, DispatchError> {
        Self::new(name, config).adapter()
    }

    /// Closes an owned connection. External connections are left to their
    /// owner; the call is then a no-op.
    pub async fn close(&self) -> Result<(), DispatchError> {
        if self.external_connection {
            debug!(queue = %self.name, "close ignored for external connection");
            return Ok(());
        }
        self.broker.close().await?;
        Ok(())
    }
}

/// A dispatch handle. Cloneable; clones share the underlying connection.
#[derive(Clone)]
pub struct Adapter {
    name: String,
    broker: Arc<dyn Broker>,
    external_connection: bool,
}

impl Adapter {
    /// Dispatches one request and awaits its outcome.
    pub async fn dispatch(&self, config: RequestConfig) -> Result<HttpResponse, DispatchError> {
        let request_id = RequestId::new();
        debug!(request_id = %request_id, method = %config.method, url = %config.url, "processing request");

        let topology = QueueTopology::resolve(&self.name, request_id);
        let request_q = self
            .broker
            .get_queue(&topology.request, QueueOptions::confirm())
            .await?;
        let response_q = self
            .broker
            .get_queue(&topology.response, QueueOptions::capacity(RESPONSE_QUEUE_CAPACITY))
            .await?;
        let upload_q = self
            .broker
            .get_queue(&topology.upload_progress, QueueOptions::default())
            .await?;
        let download_q = self
            .broker
            .get_queue(&topology.download_progress, QueueOptions::default())
            .await?;
        let cancel_q = self
            .broker
            .get_queue(&topology.cancel, QueueOptions::default())
            .await?;

        // Listeners attach strictly before anything is published so no
        // early event can be missed.
        upload_q
            .listen(progress_handler(config.on_upload_progress.clone(), request_id))
            .await?;
        download_q
            .listen(progress_handler(config.on_download_progress.clone(), request_id))
            .await?;
        let (outcome_tx, outcome_rx) = oneshot::channel();
        response_q.listen(outcome_handler(outcome_tx, request_id)).await?;

        let outcome = self
            .run_protocol(&config, request_id, &request_q, &cancel_q, outcome_rx)
            .await;

        let all = [&request_q, &response_q, &upload_q, &download_q, &cancel_q];
        let ephemeral = [&response_q, &upload_q, &download_q, &cancel_q];
        teardown(&all, &ephemeral).await;

        if !self.external_connection {
            debug!(request_id = %request_id, "closing owned connection");
            if let Err(e) = self.broker.close().await {
                warn!(request_id = %request_id, error = %e, "failed to close owned connection");
            }
        }

        settle(outcome?, &config)
    }

    async fn run_protocol(
        &self,
        config: &RequestConfig,
        request_id: RequestId,
        request_q: &Arc<dyn Queue>,
        cancel_q: &Arc<dyn Queue>,
        outcome_rx: oneshot::Receiver<Outcome>,
    ) -> Result<Outcome, DispatchError> {
        let envelope = match gate(config, request_id) {
            Gated::Synthetic(record) => {
                // Settled locally; the shared queue is never touched.
                return Ok(Outcome::Response(record));
            }
            Gated::Canceled(record) => {
                publish_cancel_marker(cancel_q).await;
                return Ok(Outcome::Canceled(record));
            }
            Gated::Envelope(envelope) => envelope,
        };

        let payload = codec::encode_envelope(&envelope)?;
        request_q
            .enqueue(payload, EnqueueOptions::correlated(request_id.to_string()))
            .await?;
        debug!(request_id = %request_id, "request published; waiting for response or cancellation");

        let cancel = config.cancel.clone();
        // The marker publish runs in its own task so it always completes
        // once the token fires, even when the response wins the race in
        // the same instant and the losing select branch is dropped.
        let marker = cancel.clone().map(|token| {
            let cancel_q = Arc::clone(cancel_q);
            tokio::spawn(async move {
                token.cancelled().await;
                publish_cancel_marker(&cancel_q).await;
            })
        });
        let cancellation_task = async {
            match &cancel {
                Some(token) => {
                    token.cancelled().await;
                    Outcome::Canceled(CancelRecord::new("Request aborted"))
                }
                None => std::future::pending().await,
            }
        };
        let operation_task = async {
            match outcome_rx.await {
                Ok(outcome) => outcome,
                Err(_) => Outcome::Error(ErrorRecord::new(
                    ErrorKind::Deserialization,
                    "Failed to deserialize response",
                )),
            }
        };

        let outcome = tokio::select! {
            outcome = cancellation_task => outcome,
            outcome = operation_task => outcome,
        };
        if let Some(handle) = marker {
            if cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
                // The token fired: the marker is on its queue before any
                // teardown begins, whichever branch won.
                if handle.await.is_err() {
                    debug!(request_id = %request_id, "cancel marker task failed");
                }
            } else {
                handle.abort();
            }
        }
        debug!(request_id = %request_id, "race settled");
        Ok(outcome)
    }
}

fn progress_handler(
    callback: Option<ProgressCallback>,
    request_id: RequestId,
) -> Arc<dyn MessageHandler> {
    handler_fn(move |delivery: Delivery| {
        let callback = callback.clone();
        Box::pin(async move {
            let Some(callback) = callback else {
                return Verdict::Nack { requeue: false };
            };
            match codec::decode_progress(&delivery.payload) {
                Ok(event) => {
                    callback(event);
                    Verdict::Ack
                }
                Err(e) => {
                    debug!(request_id = %request_id, error = %e, "dropping malformed progress event");
                    Verdict::Nack { requeue: false }
                }
            }
        })
    })
}

fn outcome_handler(tx: oneshot::Sender<Outcome>, request_id: RequestId) -> Arc<dyn MessageHandler> {
    let slot = Arc::new(Mutex::new(Some(tx)));
    let take = move || match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    handler_fn(move |delivery: Delivery| {
        let take = take.clone();
        Box::pin(async move {
            match codec::decode_outcome(&delivery.payload) {
                Ok(outcome) => {
                    debug!(request_id = %request_id, "received response");
                    if let Some(tx) = take() {
                        let _ = tx.send(outcome);
                    }
                    Verdict::Ack
                }
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "failed to deserialize response");
                    if let Some(tx) = take() {
                        let _ = tx.send(Outcome::Error(ErrorRecord::new(
                            ErrorKind::Deserialization,
                            "Failed to deserialize response",
                        )));
                    }
                    Verdict::Nack { requeue: false }
                }
            }
        })
    })
}

async fn publish_cancel_marker(cancel_q: &Arc<dyn Queue>) {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .to_string();
    if let Err(e) = cancel_q
        .enqueue(now_ms.into_bytes(), EnqueueOptions::default())
        .await
    {
        debug!(queue = cancel_q.name(), error = %e, "failed to publish cancel marker");
    }
}

async fn swallow<F>(op: &str, queue: &str, fut: F)
where
    F: Future<Output = Result<(), BrokerError>>,
{
    if let Err(e) = fut.await {
        debug!(queue, op, error = %e, "teardown step failed");
    }
}

/// Best-effort, bounded-time teardown. Liveness beats guaranteed
/// reclamation: every step is budgeted and every failure swallowed.
///
/// Only the per-request queues are paused and deleted. The shared request
/// queue outlives the request; workers keep consuming from it.
async fn teardown(all: &[&Arc<dyn Queue>; 5], ephemeral: &[&Arc<dyn Queue>; 4]) {
    join_all(all.iter().map(|q| async move {
        swallow("await_confirmations", q.name(), q.await_confirmations(DRAIN_BUDGET)).await;
        swallow("await_rpc_handling", q.name(), q.await_rpc_handling(DRAIN_BUDGET)).await;
    }))
    .await;
    join_all(
        ephemeral
            .iter()
            .map(|q| swallow("pause", q.name(), q.pause(PAUSE_BUDGET))),
    )
    .await;
    join_all(
        ephemeral
            .iter()
            .map(|q| swallow("delete", q.name(), q.delete())),
    )
    .await;
}

fn settle(outcome: Outcome, config: &RequestConfig) -> Result<HttpResponse, DispatchError> {
    match outcome {
        Outcome::Canceled(record) => Err(DispatchError::Canceled {
            reason: record.reason,
        }),
        Outcome::Error(record) => match record.kind {
            ErrorKind::Deserialization => Err(DispatchError::Deserialization),
            ErrorKind::Canceled => Err(DispatchError::Canceled {
                reason: record.message,
            }),
            kind => Err(DispatchError::Transport {
                kind,
                message: record.message,
                status: record.status,
            }),
        },
        Outcome::Response(record) => {
            let response = HttpResponse::from(record);
            let accepted = config
                .validate_status
                .as_ref()
                .is_none_or(|validate| validate(response.status));
            if accepted {
                Ok(response)
            } else {
                let status = response.status;
                let kind = if status / 100 == 4 {
                    ErrorKind::BadRequest
                } else {
                    ErrorKind::BadResponse
                };
                Err(DispatchError::Status {
                    status,
                    kind,
                    message: format!("Request failed with status code {status}"),
                    response: Box::new(response),
                })
            }
        }
    }
}
