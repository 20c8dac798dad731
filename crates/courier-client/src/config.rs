//! Caller-facing request configuration.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use courier_proto::{BodyFormat, ProgressEvent, ResponseType};
use tokio_util::sync::CancellationToken;

use crate::serializer::ParamsSerializer;

/// Predicate deciding whether a response status settles the request
/// successfully.
pub type StatusValidator = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Callback invoked for each relayed progress tick.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Hook invoked by a local transport before following a redirect.
///
/// Local-only: the compatibility gate rejects requests carrying one.
pub type RedirectHook = Arc<dyn Fn(&str) + Send + Sync>;

/// DNS lookup override for a local transport. Local-only, gate-rejected.
pub type LookupOverride = Arc<dyn Fn(&str) -> std::net::IpAddr + Send + Sync>;

/// A request configuration.
///
/// Transmissible fields are copied into the wire envelope by the
/// compatibility gate; callbacks and local resources stay on this side of
/// the boundary. The agent, redirect and lookup slots exist only so the
/// gate can reject them with a synthetic 406; they require local process
/// resources a remote worker cannot use.
#[derive(Clone, Default)]
pub struct RequestConfig {
    pub method: String,
    pub url: String,
    pub base_url: Option<String>,
    pub headers: Vec<(String, String)>,
    pub params: Option<serde_json::Value>,
    pub data: Option<serde_json::Value>,
    pub body_format: BodyFormat,
    pub timeout: Option<Duration>,
    pub response_type: ResponseType,
    pub max_redirects: Option<u32>,
    pub max_content_length: Option<u64>,
    pub max_body_length: Option<u64>,

    /// Defaults to accepting 2xx when constructed via the method helpers.
    /// `None` accepts any status.
    pub validate_status: Option<StatusValidator>,
    pub on_upload_progress: Option<ProgressCallback>,
    pub on_download_progress: Option<ProgressCallback>,
    pub cancel: Option<CancellationToken>,
    pub params_serializer: Option<ParamsSerializer>,

    pub before_redirect: Option<RedirectHook>,
    pub http_agent: Option<Arc<dyn Any + Send + Sync>>,
    pub https_agent: Option<Arc<dyn Any + Send + Sync>>,
    pub lookup: Option<LookupOverride>,
}

impl RequestConfig {
    /// Creates a configuration with the conventional 2xx status predicate.
    #[must_use]
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            validate_status: Some(Arc::new(|status| (200..300).contains(&status))),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("get", url)
    }

    #[must_use]
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new("delete", url)
    }

    #[must_use]
    pub fn head(url: impl Into<String>) -> Self {
        Self::new("head", url)
    }

    #[must_use]
    pub fn options(url: impl Into<String>) -> Self {
        Self::new("options", url)
    }

    #[must_use]
    pub fn post(url: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new("post", url).with_data(data)
    }

    #[must_use]
    pub fn put(url: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new("put", url).with_data(data)
    }

    #[must_use]
    pub fn patch(url: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new("patch", url).with_data(data)
    }

    #[must_use]
    pub fn post_form(url: impl Into<String>, data: serde_json::Value) -> Self {
        Self::post(url, data).with_body_format(BodyFormat::Form)
    }

    #[must_use]
    pub fn put_form(url: impl Into<String>, data: serde_json::Value) -> Self {
        Self::put(url, data).with_body_format(BodyFormat::Form)
    }

    #[must_use]
    pub fn patch_form(url: impl Into<String>, data: serde_json::Value) -> Self {
        Self::patch(url, data).with_body_format(BodyFormat::Form)
    }

    #[must_use]
    pub fn with_body_format(mut self, format: BodyFormat) -> Self {
        self.body_format = format;
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Replaces the status predicate. `None` accepts any status.
    #[must_use]
    pub fn with_validate_status(mut self, validator: Option<StatusValidator>) -> Self {
        self.validate_status = validator;
        self
    }
}

impl std::fmt::Debug for RequestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestConfig")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("base_url", &self.base_url)
            .field("headers", &self.headers)
            .field("params", &self.params)
            .field("timeout", &self.timeout)
            .field("response_type", &self.response_type)
            .field("has_cancel", &self.cancel.is_some())
            .field("has_params_serializer", &self.params_serializer.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_helpers_set_method_and_predicate() {
        let config = RequestConfig::get("/health");
        assert_eq!(config.method, "get");
        let validate = config.validate_status.unwrap();
        assert!(validate(204));
        assert!(!validate(404));
    }

    #[test]
    fn post_carries_data() {
        let config = RequestConfig::post("/user", serde_json::json!({"name": "Fred"}));
        assert_eq!(config.method, "post");
        assert!(config.data.is_some());
    }
}
