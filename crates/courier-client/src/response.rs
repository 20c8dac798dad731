//! The settled response handed back to callers.

use courier_proto::{BodyKind, ResponseRecord};
use serde::de::DeserializeOwned;

use crate::error::DispatchError;

/// A settled HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub body_kind: BodyKind,
}

impl HttpResponse {
    /// Gets a header value by name (case-insensitive).
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, DispatchError> {
        serde_json::from_slice(&self.body).map_err(|e| DispatchError::Decode(e.to_string()))
    }

    /// Decodes the body as UTF-8 text.
    pub fn text(&self) -> Result<String, DispatchError> {
        String::from_utf8(self.body.clone()).map_err(|e| DispatchError::Decode(e.to_string()))
    }
}

impl From<ResponseRecord> for HttpResponse {
    fn from(record: ResponseRecord) -> Self {
        Self {
            status: record.status,
            status_text: record.status_text,
            headers: record.headers,
            body: record.body,
            body_kind: record.body_kind,
        }
    }
}
