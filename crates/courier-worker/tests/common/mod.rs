//! Shared fixtures for the worker integration tests.

use std::sync::{Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use courier_proto::{ProgressEvent, RequestEnvelope};
use courier_worker::{TransportClient, TransportError, TransportRequest, TransportResponse};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub type Responder =
    Box<dyn Fn(&RequestEnvelope) -> Result<TransportResponse, TransportError> + Send + Sync>;

/// A scriptable [`TransportClient`]. Records every envelope it sees,
/// optionally emits download ticks and sleeps before answering, and
/// honours cancellation during the sleep.
pub struct StubTransport {
    responder: Responder,
    delay: Duration,
    download_ticks: u64,
    calls: Mutex<Vec<RequestEnvelope>>,
}

impl StubTransport {
    pub fn with(responder: Responder) -> Self {
        Self {
            responder,
            delay: Duration::ZERO,
            download_ticks: 0,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers every request with the given status and JSON body.
    pub fn respond_json(status: u16, body: serde_json::Value) -> Self {
        Self::with(Box::new(move |_| Ok(json_response(status, &body))))
    }

    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn download_ticks(mut self, ticks: u64) -> Self {
        self.download_ticks = ticks;
        self
    }

    pub fn calls(&self) -> Vec<RequestEnvelope> {
        self.calls.lock().unwrap().clone()
    }
}

pub fn json_response(status: u16, body: &serde_json::Value) -> TransportResponse {
    TransportResponse {
        status,
        status_text: if status == 200 { "OK" } else { "" }.to_owned(),
        headers: vec![("content-type".to_owned(), b"application/json".to_vec())],
        body: serde_json::to_vec(body).unwrap(),
    }
}

#[async_trait]
impl TransportClient for StubTransport {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.lock().unwrap().push(request.envelope.clone());

        if let Some(callback) = &request.on_download_progress {
            let total = self.download_ticks * 100;
            for i in 1..=self.download_ticks {
                callback(ProgressEvent::download(i * 100, Some(total), 100));
            }
        }

        if !self.delay.is_zero() {
            tokio::select! {
                () = request.cancel.cancelled() => return Err(TransportError::Canceled),
                () = tokio::time::sleep(self.delay) => {}
            }
        }
        (self.responder)(&request.envelope)
    }
}
