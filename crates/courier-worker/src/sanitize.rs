//! Conversion of transport results into transmissible wire records.
//!
//! Everything that cannot cross the queue is stripped here: header values
//! that are not UTF-8, bodies beyond the message size budget, error
//! internals beyond the message chain, and JSON nested past the depth
//! guard.

use std::error::Error as StdError;
use std::fmt::Write as _;

use courier_proto::{BodyKind, ErrorKind, ErrorRecord, ResponseRecord, ResponseType, MAX_MESSAGE_SIZE};
use serde_json::Value;
use tracing::{debug, warn};

use crate::transport::{TransportError, TransportResponse};

/// Nesting depth beyond which JSON metadata is replaced with null.
/// `Value` trees are acyclic, so the guard only bounds pathological depth.
pub const MAX_JSON_DEPTH: usize = 32;

/// Slack reserved for the non-body fields of an encoded outcome.
const BODY_BUDGET: usize = MAX_MESSAGE_SIZE - 64 * 1024;

/// Builds the wire record for a settled transport response.
#[must_use]
pub fn response_record(response: TransportResponse, response_type: ResponseType) -> ResponseRecord {
    let headers = response
        .headers
        .into_iter()
        .filter_map(|(name, value)| match String::from_utf8(value) {
            Ok(value) => Some((name, value)),
            Err(_) => {
                debug!(header = %name, "dropping header with non-UTF8 value");
                None
            }
        })
        .collect();

    let mut body = response.body;
    if body.len() > BODY_BUDGET {
        warn!(
            size = body.len(),
            budget = BODY_BUDGET,
            "truncating response body to the message size budget"
        );
        body.truncate(BODY_BUDGET);
    }

    let body_kind = if body.is_empty() {
        BodyKind::Empty
    } else {
        match response_type {
            ResponseType::Json => BodyKind::Json,
            ResponseType::Text => BodyKind::Text,
            ResponseType::Binary | ResponseType::Stream => BodyKind::Binary,
        }
    };

    ResponseRecord {
        status: response.status,
        status_text: response.status_text,
        headers,
        body,
        body_kind,
    }
}

/// Builds the wire record for a transport failure, flattening the error's
/// source chain into the message.
#[must_use]
pub fn error_record(err: &TransportError) -> ErrorRecord {
    let (kind, status) = match err {
        TransportError::Timeout(_) => (ErrorKind::Timeout, None),
        TransportError::Connect(_) => (ErrorKind::Network, None),
        TransportError::Request { status, .. } => match status {
            Some(status) => (ErrorKind::BadResponse, Some(*status)),
            None => (ErrorKind::Network, None),
        },
        TransportError::Body(_) => (ErrorKind::BadResponse, None),
        TransportError::Canceled => (ErrorKind::Canceled, None),
    };

    let mut record = ErrorRecord::new(kind, flatten_chain(err));
    if let Some(status) = status {
        record = record.with_status(status);
    }
    record
}

/// An `Internal` record for failures in the worker itself.
#[must_use]
pub fn internal_error(err: &dyn StdError) -> ErrorRecord {
    ErrorRecord::new(ErrorKind::Internal, flatten_chain(err))
}

fn flatten_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(message, ": {cause}");
        source = cause.source();
    }
    message
}

/// Recursively walks a JSON value, replacing anything nested deeper than
/// `depth` levels with null.
pub fn sanitize_json(value: &mut Value, depth: usize) {
    if depth == 0 {
        if !value.is_null() {
            debug!("truncating JSON metadata past the depth guard");
            *value = Value::Null;
        }
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                sanitize_json(item, depth - 1);
            }
        }
        Value::Object(entries) => {
            for (_, item) in entries.iter_mut() {
                sanitize_json(item, depth - 1);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
    }
}
