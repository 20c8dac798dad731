//! The transport seam and its reqwest-backed implementation.
//!
//! The worker never calls reqwest directly; it programs against
//! [`TransportClient`] so tests can substitute a stub and deployments can
//! wrap the client with custom behaviour.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use courier_proto::{BodyFormat, ProgressEvent, RequestEnvelope};
use futures_util::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Callback receiving progress ticks as the transport moves bytes.
pub type TransportProgress = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request failed: {message}")]
    Request {
        message: String,
        /// Status code when the failure carried a response.
        status: Option<u16>,
    },

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Request canceled")]
    Canceled,
}

/// One request handed to the transport.
///
/// The envelope is the transmissible configuration; the callbacks and the
/// token are worker-local resources wired back in after the queue hop.
pub struct TransportRequest {
    pub envelope: RequestEnvelope,
    pub on_upload_progress: Option<TransportProgress>,
    pub on_download_progress: Option<TransportProgress>,
    pub cancel: CancellationToken,
}

/// The raw transport result, before sanitisation.
///
/// Header values are kept as bytes; the sanitizer decides what is
/// representable on the wire.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

/// Executes one request. Implementations must honour the cancellation
/// token by failing with [`TransportError::Canceled`] promptly.
#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn execute(&self, request: TransportRequest)
        -> Result<TransportResponse, TransportError>;
}

/// Ambient request defaults applied to every envelope the worker executes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportDefaults {
    /// Prefix for relative request urls. An envelope's own `base_url`
    /// takes precedence.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Headers applied before the envelope's own.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Fallback timeout when the envelope carries none.
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Mutates the envelope before the transport executes it.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn intercept(&self, envelope: &mut RequestEnvelope) -> Result<(), TransportError>;
}

/// Mutates the raw response before sanitisation.
#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    async fn intercept(&self, response: &mut TransportResponse) -> Result<(), TransportError>;
}

/// Registered interceptor chains, run in registration order.
#[derive(Clone, Default)]
pub struct Interceptors {
    pub request: Vec<Arc<dyn RequestInterceptor>>,
    pub response: Vec<Arc<dyn ResponseInterceptor>>,
}

/// Redirect cap applied when an envelope does not set `max_redirects`.
const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Characters left intact by form encoding, `encodeURIComponent`-style.
const FORM_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// `application/x-www-form-urlencoded` encoding of a JSON body. Nested
/// objects use bracket paths, array members repeat under a `[]` suffix.
fn form_encode(data: &serde_json::Value) -> String {
    let mut pairs = Vec::new();
    form_pairs(data, None, &mut pairs);
    pairs
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, FORM_ENCODE),
                utf8_percent_encode(v, FORM_ENCODE)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn form_pairs(value: &serde_json::Value, key: Option<&str>, out: &mut Vec<(String, String)>) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            for (name, child) in map {
                let full = match key {
                    Some(k) => format!("{k}[{name}]"),
                    None => name.clone(),
                };
                form_pairs(child, Some(&full), out);
            }
        }
        Value::Array(items) => {
            if let Some(k) = key {
                let full = format!("{k}[]");
                for item in items {
                    form_pairs(item, Some(&full), out);
                }
            }
        }
        Value::Null => {}
        Value::Bool(b) => {
            if let Some(k) = key {
                out.push((k.to_owned(), b.to_string()));
            }
        }
        Value::Number(n) => {
            if let Some(k) = key {
                out.push((k.to_owned(), n.to_string()));
            }
        }
        Value::String(s) => {
            if let Some(k) = key {
                out.push((k.to_owned(), s.clone()));
            }
        }
    }
}

fn redirect_limit(envelope: &RequestEnvelope) -> usize {
    envelope
        .max_redirects
        .map_or(DEFAULT_MAX_REDIRECTS, |limit| limit as usize)
}

fn build_client(
    max_redirects: usize,
    user_agent: Option<&str>,
) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(max_redirects));
    if let Some(agent) = user_agent {
        builder = builder.user_agent(agent.to_owned());
    }
    builder.build().map_err(|e| TransportError::Request {
        message: e.to_string(),
        status: None,
    })
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// reqwest-backed [`TransportClient`].
pub struct HttpTransport {
    client: reqwest::Client,
    defaults: RwLock<TransportDefaults>,
    interceptors: RwLock<Interceptors>,
}

impl HttpTransport {
    pub fn new(defaults: TransportDefaults) -> Result<Self, TransportError> {
        let client = build_client(DEFAULT_MAX_REDIRECTS, defaults.user_agent.as_deref())?;
        Ok(Self {
            client,
            defaults: RwLock::new(defaults),
            interceptors: RwLock::new(Interceptors::default()),
        })
    }

    #[must_use]
    pub fn defaults(&self) -> TransportDefaults {
        read_lock(&self.defaults).clone()
    }

    pub fn set_defaults(&self, defaults: TransportDefaults) {
        *write_lock(&self.defaults) = defaults;
    }

    #[must_use]
    pub fn interceptors(&self) -> Interceptors {
        read_lock(&self.interceptors).clone()
    }

    pub fn add_request_interceptor(&self, interceptor: Arc<dyn RequestInterceptor>) {
        write_lock(&self.interceptors).request.push(interceptor);
    }

    pub fn add_response_interceptor(&self, interceptor: Arc<dyn ResponseInterceptor>) {
        write_lock(&self.interceptors).response.push(interceptor);
    }

    fn resolve_url(envelope: &RequestEnvelope, defaults: &TransportDefaults) -> String {
        if envelope.url.starts_with("http://") || envelope.url.starts_with("https://") {
            return envelope.url.clone();
        }
        let base = envelope
            .base_url
            .as_deref()
            .or(defaults.base_url.as_deref());
        match base {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                envelope.url.trim_start_matches('/')
            ),
            None => envelope.url.clone(),
        }
    }
}

fn map_reqwest_error(e: &reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Request {
            message: e.to_string(),
            status: e.status().map(|s| s.as_u16()),
        }
    }
}

#[async_trait]
impl TransportClient for HttpTransport {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let TransportRequest {
            mut envelope,
            on_upload_progress,
            on_download_progress,
            cancel,
        } = request;

        let interceptors = self.interceptors();
        for interceptor in &interceptors.request {
            interceptor.intercept(&mut envelope).await?;
        }

        let defaults = self.defaults();
        let url = Self::resolve_url(&envelope, &defaults);
        let method = reqwest::Method::from_bytes(envelope.method.to_uppercase().as_bytes())
            .map_err(|e| TransportError::Request {
                message: format!("invalid method {:?}: {e}", envelope.method),
                status: None,
            })?;

        // reqwest pins the redirect policy to the client, so a per-request
        // cap needs its own client.
        let client = if redirect_limit(&envelope) == DEFAULT_MAX_REDIRECTS {
            self.client.clone()
        } else {
            build_client(redirect_limit(&envelope), defaults.user_agent.as_deref())?
        };

        let mut builder = client.request(method, url);
        for (name, value) in &defaults.headers {
            builder = builder.header(name, value);
        }
        for (name, value) in &envelope.headers {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = envelope.timeout_ms.map(Duration::from_millis).or(defaults.timeout)
        {
            builder = builder.timeout(timeout);
        }
        if let Some(params) = &envelope.params {
            builder = builder.query(params);
        }
        let mut upload_len = None;
        if let Some(data) = &envelope.data {
            let encoded_len = match envelope.body_format {
                BodyFormat::Json => serde_json::to_vec(data).ok().map(|b| b.len() as u64),
                BodyFormat::Form => Some(form_encode(data).len() as u64),
            };
            if let (Some(len), Some(limit)) = (encoded_len, envelope.max_body_length) {
                if len > limit {
                    return Err(TransportError::Request {
                        message: format!(
                            "request body of {len} bytes exceeds the body length limit of {limit} bytes"
                        ),
                        status: None,
                    });
                }
            }
            upload_len = encoded_len;
            builder = match envelope.body_format {
                BodyFormat::Json => builder.json(data),
                BodyFormat::Form => {
                    if envelope.get_header("content-type").is_none() {
                        builder = builder
                            .header("content-type", "application/x-www-form-urlencoded");
                    }
                    builder.body(form_encode(data))
                }
            };
        }

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(TransportError::Canceled),
            result = builder.send() => result.map_err(|e| map_reqwest_error(&e))?,
        };

        // The request body is fully handed off once send resolves; a single
        // tick reports it.
        if let (Some(callback), Some(len)) = (&on_upload_progress, upload_len) {
            callback(ProgressEvent::upload(len, Some(len), len));
        }

        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or("").to_owned();
        let headers: Vec<(String, Vec<u8>)> = response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
            .collect();
        let total = response.content_length();

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return Err(TransportError::Canceled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(e.to_string())
                } else {
                    TransportError::Body(e.to_string())
                }
            })?;
            body.extend_from_slice(&chunk);
            if let Some(limit) = envelope.max_content_length {
                if body.len() as u64 > limit {
                    return Err(TransportError::Body(format!(
                        "response exceeded the configured content length limit of {limit} bytes"
                    )));
                }
            }
            if let Some(callback) = &on_download_progress {
                callback(ProgressEvent::download(
                    body.len() as u64,
                    total,
                    chunk.len() as u64,
                ));
            }
        }

        let mut transport_response = TransportResponse {
            status: status.as_u16(),
            status_text,
            headers,
            body,
        };
        for interceptor in &interceptors.response {
            interceptor.intercept(&mut transport_response).await?;
        }
        debug!(status = transport_response.status, "transport call settled");
        Ok(transport_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_proto::RequestId;

    fn envelope(url: &str, base: Option<&str>) -> RequestEnvelope {
        RequestEnvelope {
            request_id: RequestId::new(),
            method: "get".to_owned(),
            url: url.to_owned(),
            base_url: base.map(str::to_owned),
            headers: Vec::new(),
            params: None,
            data: None,
            body_format: BodyFormat::default(),
            timeout_ms: None,
            response_type: courier_proto::ResponseType::Json,
            max_redirects: None,
            max_content_length: None,
            max_body_length: None,
        }
    }

    #[test]
    fn redirect_limit_prefers_the_envelope() {
        assert_eq!(redirect_limit(&envelope("/", None)), DEFAULT_MAX_REDIRECTS);
        let mut env = envelope("/", None);
        env.max_redirects = Some(2);
        assert_eq!(redirect_limit(&env), 2);
    }

    #[test]
    fn form_encoding_uses_bracket_paths() {
        let data = serde_json::json!({
            "tags": ["a", "b"],
            "user": {"name": "fred flintstone"},
        });
        assert_eq!(
            form_encode(&data),
            "tags%5B%5D=a&tags%5B%5D=b&user%5Bname%5D=fred%20flintstone"
        );
    }

    #[tokio::test]
    async fn request_body_limit_rejects_before_sending() {
        let transport = HttpTransport::new(TransportDefaults::default()).unwrap();
        let mut env = envelope("http://localhost:9/none", None);
        env.data = Some(serde_json::json!({"blob": "a".repeat(64)}));
        env.max_body_length = Some(8);

        let err = transport
            .execute(TransportRequest {
                envelope: env,
                on_upload_progress: None,
                on_download_progress: None,
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap_err();
        match err {
            TransportError::Request { message, status } => {
                assert!(message.contains("body length limit"));
                assert_eq!(status, None);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn absolute_url_ignores_base() {
        let defaults = TransportDefaults {
            base_url: Some("https://fallback.example".to_owned()),
            ..TransportDefaults::default()
        };
        let url = HttpTransport::resolve_url(&envelope("https://api.example/v1", None), &defaults);
        assert_eq!(url, "https://api.example/v1");
    }

    #[test]
    fn relative_url_joins_envelope_base_over_default() {
        let defaults = TransportDefaults {
            base_url: Some("https://fallback.example".to_owned()),
            ..TransportDefaults::default()
        };
        let url = HttpTransport::resolve_url(
            &envelope("/user/12345", Some("https://api.example/")),
            &defaults,
        );
        assert_eq!(url, "https://api.example/user/12345");

        let url = HttpTransport::resolve_url(&envelope("user", None), &defaults);
        assert_eq!(url, "https://fallback.example/user");
    }
}
