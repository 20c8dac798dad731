//! The transmissible request envelope.

use serde::{Deserialize, Serialize};

use crate::types::RequestId;

/// How the caller wants the response body decoded.
///
/// `Stream` exists so the dispatcher can reject it with a synthetic 406:
/// streamed bodies cannot cross the queue boundary end-to-end.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Json,
    Text,
    Binary,
    Stream,
}

/// How the `data` value is encoded into the request body.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    #[default]
    Json,
    /// `application/x-www-form-urlencoded`.
    Form,
}

impl BodyFormat {
    #[must_use]
    pub fn is_json(&self) -> bool {
        *self == Self::Json
    }
}

/// A sanitized copy of the caller's request configuration.
///
/// This struct is the allow-list: every field is serializable by
/// construction, so callbacks, agents, adapters and cancellation handles
/// can never cross the process boundary. Immutable once built; the only
/// mutation the dispatcher performs is clearing `params` after resolving a
/// custom query serializer into the URL locally.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Correlation ID for this request.
    pub request_id: RequestId,

    /// HTTP method, lowercase ("get", "post", ...).
    pub method: String,

    /// Request URL, possibly relative to the worker's base URL.
    pub url: String,

    /// Base URL override. Usually unset: the worker's own default applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Request headers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,

    /// Query parameters, serialized by the worker unless the dispatcher
    /// already resolved them into `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,

    /// Request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Body encoding applied to `data` by the worker's transport.
    #[serde(default, skip_serializing_if = "BodyFormat::is_json")]
    pub body_format: BodyFormat,

    /// Request timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Expected response body decoding.
    #[serde(default)]
    pub response_type: ResponseType,

    /// Maximum redirects the worker's transport may follow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_redirects: Option<u32>,

    /// Maximum allowed response content length in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_content_length: Option<u64>,

    /// Maximum allowed request body length in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_body_length: Option<u64>,
}

impl RequestEnvelope {
    /// Creates an envelope with a fresh request ID and the given method/url.
    #[must_use]
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            method: method.into(),
            url: url.into(),
            base_url: None,
            headers: Vec::new(),
            params: None,
            data: None,
            body_format: BodyFormat::default(),
            timeout_ms: None,
            response_type: ResponseType::default(),
            max_redirects: None,
            max_content_length: None,
            max_body_length: None,
        }
    }

    /// Gets a header value by name (case-insensitive).
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
