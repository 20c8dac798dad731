//! The worker execution loop.
//!
//! A [`Worker`] consumes request envelopes from the shared queue, submits
//! each one to the rate-limited runner, executes admitted jobs through the
//! transport, and publishes exactly one outcome per request to that
//! request's response queue. Job failures never kill the loop: every error
//! is converted to an `ErrorRecord` outcome and published like any other
//! result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use courier_broker::{
    handler_fn, Broker, BrokerError, Delivery, EnqueueOptions, MemoryBroker, Queue, QueueOptions,
    Verdict,
};
use courier_proto::{
    codec, CancelRecord, ErrorKind, ErrorRecord, Outcome, ProgressEvent, QueueTopology,
    RequestEnvelope, RequestId, RESPONSE_QUEUE_CAPACITY,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::limiter::{JobFuture, RateLimitedRunner, RunnerConfig, SpillPolicy};
use crate::sanitize::{self, MAX_JSON_DEPTH};
use crate::transport::{
    HttpTransport, TransportClient, TransportDefaults, TransportError, TransportProgress,
    TransportRequest,
};

/// Budget for draining per-request queues after a job settles. Generous;
/// the worker is in no hurry and the budget only bounds stuck listeners.
const DRAIN_BUDGET: Duration = Duration::from_secs(10);

/// How the worker reaches the broker.
#[derive(Clone)]
pub enum WorkerConnection {
    /// Caller-supplied connection, never closed by the worker.
    External(Arc<dyn Broker>),
    /// Connection owned by the worker, closed on shutdown.
    Owned(Arc<dyn Broker>),
}

impl WorkerConnection {
    /// An owned in-process broker connection.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::Owned(Arc::new(MemoryBroker::new()))
    }
}

struct Job {
    envelope: RequestEnvelope,
}

/// The per-request queue handles a job works with. Resolved once at job
/// start so a queue the dispatcher has already deleted is not recreated.
struct JobQueues {
    response: Arc<dyn Queue>,
    upload: Arc<dyn Queue>,
    download: Arc<dyn Queue>,
    cancel: Arc<dyn Queue>,
}

struct WorkerInner {
    name: String,
    broker: Arc<dyn Broker>,
    external_connection: bool,
    transport: Arc<dyn TransportClient>,
    runner: RateLimitedRunner<Job>,
    started: AtomicBool,
    request_queue: Mutex<Option<Arc<dyn Queue>>>,
}

/// A queue-consuming request executor.
///
/// Not restartable: once stopped or shut down, create a new worker.
pub struct Worker {
    inner: Arc<WorkerInner>,
    http: Option<Arc<HttpTransport>>,
}

impl Worker {
    /// Builds a worker over an arbitrary transport.
    ///
    /// The runner's spill policy is forced to [`SpillPolicy::Drop`]: a
    /// worker must fail excess load fast, not let it age in a buffer.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        connection: WorkerConnection,
        mut runner_config: RunnerConfig,
        transport: Arc<dyn TransportClient>,
    ) -> Self {
        if runner_config.spill != SpillPolicy::Drop {
            debug!("overriding runner spill policy to drop");
            runner_config.spill = SpillPolicy::Drop;
        }
        let (broker, external_connection) = match connection {
            WorkerConnection::External(broker) => (broker, true),
            WorkerConnection::Owned(broker) => (broker, false),
        };

        let inner = Arc::new_cyclic(|weak: &Weak<WorkerInner>| {
            let exec_weak = weak.clone();
            let spill_weak = weak.clone();
            let runner = RateLimitedRunner::new(
                runner_config,
                Arc::new(move |job: Job| {
                    let weak = exec_weak.clone();
                    Box::pin(async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.process(job).await;
                        }
                    }) as JobFuture
                }),
                Some(Arc::new(move |job: Job| {
                    if let Some(inner) = spill_weak.upgrade() {
                        inner.reject_spilled(job);
                    }
                })),
            );
            WorkerInner {
                name: name.into(),
                broker,
                external_connection,
                transport,
                runner,
                started: AtomicBool::new(false),
                request_queue: Mutex::new(None),
            }
        });
        Self { inner, http: None }
    }

    /// Builds a worker backed by the reqwest transport.
    pub fn with_http(
        name: impl Into<String>,
        connection: WorkerConnection,
        runner_config: RunnerConfig,
        defaults: TransportDefaults,
    ) -> Result<Self, WorkerError> {
        let http = Arc::new(HttpTransport::new(defaults)?);
        let transport: Arc<dyn TransportClient> = http.clone();
        let mut worker = Self::new(name, connection, runner_config, transport);
        worker.http = Some(http);
        Ok(worker)
    }

    /// Builds a worker from a loaded [`WorkerConfig`].
    pub fn from_config(
        config: WorkerConfig,
        connection: WorkerConnection,
    ) -> Result<Self, WorkerError> {
        Self::with_http(config.queue, connection, config.runner, config.transport)
    }

    /// The underlying HTTP transport, when the worker was built with one.
    /// Exposes transport defaults and interceptor registration.
    #[must_use]
    pub fn http_transport(&self) -> Option<&Arc<HttpTransport>> {
        self.http.as_ref()
    }

    /// Starts consuming the shared queue. Idempotent while running.
    pub async fn start(&self) -> Result<(), WorkerError> {
        if self.inner.runner.is_shut_down() {
            return Err(WorkerError::ShutDown);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.runner.start();

        let queue = self
            .inner
            .broker
            .get_queue(&self.inner.name, QueueOptions::confirm())
            .await?;
        let weak = Arc::downgrade(&self.inner);
        queue
            .listen(handler_fn(move |delivery: Delivery| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => inner.accept(delivery).await,
                        None => Verdict::Nack { requeue: true },
                    }
                })
            }))
            .await?;
        *lock(&self.inner.request_queue) = Some(queue);
        info!(queue = %self.inner.name, "worker started");
        Ok(())
    }

    /// Stops consuming and waits for active jobs to settle. Buffered
    /// messages stay on the shared queue for other workers.
    pub async fn stop(&self) {
        let queue = lock(&self.inner.request_queue).take();
        if let Some(queue) = queue {
            if let Err(e) = queue.pause(DRAIN_BUDGET).await {
                debug!(error = %e, "failed to pause request queue");
            }
        }
        self.inner.runner.stop().await;
        info!(queue = %self.inner.name, "worker stopped");
    }

    /// Stops, refuses further work, and closes an owned connection.
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        self.stop().await;
        self.inner.runner.shutdown().await;
        if !self.inner.external_connection {
            self.inner.broker.close().await?;
        }
        info!(queue = %self.inner.name, "worker shut down");
        Ok(())
    }

    /// Buffered plus active jobs in the rate limiter.
    #[must_use]
    pub fn get_pressure(&self) -> usize {
        self.inner.runner.pressure()
    }

    #[must_use]
    pub fn running(&self) -> bool {
        self.inner.runner.running()
    }

    /// Whether a job is currently executing.
    #[must_use]
    pub fn working(&self) -> bool {
        self.inner.runner.working()
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.runner.is_shut_down()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl WorkerInner {
    async fn accept(&self, delivery: Delivery) -> Verdict {
        match codec::decode_envelope(&delivery.payload) {
            Ok(envelope) => {
                debug!(request_id = %envelope.request_id, "accepted request");
                // A drop is handled by the spill hook; the message itself
                // is consumed either way.
                self.runner.submit(Job { envelope });
                Verdict::Ack
            }
            Err(e) => {
                warn!(error = %e, "received malformed request envelope");
                if let Some(request_id) = delivery
                    .correlation_id
                    .as_deref()
                    .and_then(|c| RequestId::parse(c).ok())
                {
                    let topology = QueueTopology::resolve(&self.name, request_id);
                    self.publish_resolved(
                        &topology.response,
                        &Outcome::Error(ErrorRecord::new(
                            ErrorKind::Deserialization,
                            format!("Failed to deserialize request envelope: {e}"),
                        )),
                    )
                    .await;
                }
                Verdict::Nack { requeue: false }
            }
        }
    }

    fn reject_spilled(self: &Arc<Self>, job: Job) {
        let inner = self.clone();
        tokio::spawn(async move {
            let request_id = job.envelope.request_id;
            warn!(request_id = %request_id, "request dropped by rate limiter");
            let topology = QueueTopology::resolve(&inner.name, request_id);
            inner
                .publish_resolved(
                    &topology.response,
                    &Outcome::Error(
                        ErrorRecord::new(ErrorKind::Internal, "Request dropped by rate limiter")
                            .with_status(429),
                    ),
                )
                .await;
        });
    }

    async fn process(&self, job: Job) {
        let request_id = job.envelope.request_id;
        let topology = QueueTopology::resolve(&self.name, request_id);
        debug!(request_id = %request_id, method = %job.envelope.method, "processing job");

        let queues = match self.job_queues(&topology).await {
            Ok(queues) => queues,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "failed to resolve job queues");
                self.publish_resolved(
                    &topology.response,
                    &Outcome::Error(sanitize::internal_error(&e)),
                )
                .await;
                return;
            }
        };

        let outcome = self.run_job(&queues, job.envelope).await;
        publish_to(&queues.response, &outcome).await;
        drain_job_queues(&queues).await;
        debug!(request_id = %request_id, "job settled");
    }

    async fn job_queues(&self, topology: &QueueTopology) -> Result<JobQueues, BrokerError> {
        Ok(JobQueues {
            response: self
                .broker
                .get_queue(&topology.response, QueueOptions::capacity(RESPONSE_QUEUE_CAPACITY))
                .await?,
            upload: self
                .broker
                .get_queue(&topology.upload_progress, QueueOptions::default())
                .await?,
            download: self
                .broker
                .get_queue(&topology.download_progress, QueueOptions::default())
                .await?,
            cancel: self
                .broker
                .get_queue(&topology.cancel, QueueOptions::default())
                .await?,
        })
    }

    async fn run_job(&self, queues: &JobQueues, mut envelope: RequestEnvelope) -> Outcome {
        if let Some(params) = envelope.params.as_mut() {
            sanitize::sanitize_json(params, MAX_JSON_DEPTH);
        }
        if let Some(data) = envelope.data.as_mut() {
            sanitize::sanitize_json(data, MAX_JSON_DEPTH);
        }

        let token = CancellationToken::new();
        let cancel_token = token.clone();
        if let Err(e) = queues
            .cancel
            .listen(handler_fn(move |_delivery: Delivery| {
                let token = cancel_token.clone();
                Box::pin(async move {
                    token.cancel();
                    Verdict::Ack
                })
            }))
            .await
        {
            return Outcome::Error(sanitize::internal_error(&e));
        }

        // Progress ticks flow through a channel so the relay can await the
        // publishes; the transport callbacks stay synchronous.
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let relay = {
            let upload = queues.upload.clone();
            let download = queues.download.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let queue = if event.upload { &upload } else { &download };
                    match codec::encode_progress(&event) {
                        Ok(payload) => {
                            if let Err(e) = queue.enqueue(payload, EnqueueOptions::default()).await
                            {
                                debug!(queue = queue.name(), error = %e, "failed to relay progress tick");
                            }
                        }
                        Err(e) => debug!(error = %e, "failed to encode progress tick"),
                    }
                }
            })
        };
        let upload_tx = tx.clone();
        let on_upload: TransportProgress = Arc::new(move |event| {
            let _ = upload_tx.send(event);
        });
        let download_tx = tx.clone();
        let on_download: TransportProgress = Arc::new(move |event| {
            let _ = download_tx.send(event);
        });
        drop(tx);

        let response_type = envelope.response_type;
        let result = self
            .transport
            .execute(TransportRequest {
                envelope,
                on_upload_progress: Some(on_upload),
                on_download_progress: Some(on_download),
                cancel: token,
            })
            .await;

        // The transport request (and with it the last senders) is gone;
        // the relay drains what remains and exits.
        if relay.await.is_err() {
            debug!("progress relay task failed");
        }

        match result {
            Ok(response) => Outcome::Response(sanitize::response_record(response, response_type)),
            Err(TransportError::Canceled) => {
                debug!("job canceled");
                Outcome::Canceled(CancelRecord::new("Request aborted"))
            }
            Err(e) => Outcome::Error(sanitize::error_record(&e)),
        }
    }

    async fn publish_resolved(&self, queue_name: &str, outcome: &Outcome) {
        match self
            .broker
            .get_queue(queue_name, QueueOptions::capacity(RESPONSE_QUEUE_CAPACITY))
            .await
        {
            Ok(queue) => publish_to(&queue, outcome).await,
            Err(e) => warn!(queue = queue_name, error = %e, "failed to resolve response queue"),
        }
    }
}

async fn publish_to(queue: &Arc<dyn Queue>, outcome: &Outcome) {
    // A caller is parked on this queue; if the real outcome cannot be
    // encoded (an oversized record, say), an internal error takes its
    // place so the caller still settles.
    let payload = match codec::encode_outcome(outcome) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(queue = queue.name(), error = %e, "failed to encode outcome, substituting internal error");
            let substitute = Outcome::Error(ErrorRecord::new(
                ErrorKind::Internal,
                "Response could not be encoded for transport",
            ));
            match codec::encode_outcome(&substitute) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(queue = queue.name(), error = %e, "failed to encode substitute outcome");
                    return;
                }
            }
        }
    };
    if let Err(e) = queue.enqueue(payload, EnqueueOptions::default()).await {
        warn!(queue = queue.name(), error = %e, "failed to publish outcome");
    }
}

/// Post-job drain: wait for confirmations and listener handoff on the
/// per-request queues, then pause the cancel listener this job installed.
/// The queues themselves belong to the dispatcher; the worker never
/// deletes them.
async fn drain_job_queues(queues: &JobQueues) {
    for queue in [&queues.response, &queues.upload, &queues.download, &queues.cancel] {
        if let Err(e) = queue.await_confirmations(DRAIN_BUDGET).await {
            debug!(queue = queue.name(), error = %e, "confirmation drain failed");
        }
        if let Err(e) = queue.await_rpc_handling(DRAIN_BUDGET).await {
            debug!(queue = queue.name(), error = %e, "rpc drain failed");
        }
    }
    if let Err(e) = queues.cancel.pause(DRAIN_BUDGET).await {
        debug!(queue = queues.cancel.name(), error = %e, "cancel listener pause failed");
    }
}
