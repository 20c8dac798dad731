//! Compatibility gate.
//!
//! Decides, without contacting the broker, whether a request configuration
//! can cross the queue boundary: produces either a transmissible envelope,
//! a synthetic 406 response naming the unsupported option, or an immediate
//! cancellation when the caller's signal already fired.

use courier_proto::{CancelRecord, RequestEnvelope, RequestId, ResponseRecord, ResponseType};
use tracing::debug;

use crate::config::RequestConfig;
use crate::serializer::build_url;

/// The gate's decision.
pub enum Gated {
    Envelope(Box<RequestEnvelope>),
    Synthetic(ResponseRecord),
    Canceled(CancelRecord),
}

fn unsupported_option(option: &str) -> ResponseRecord {
    ResponseRecord::with_status(
        406,
        format!(
            "Option \"{option}\" cannot be set on the client adapter and must be set on the courier worker server"
        ),
    )
}

/// Runs the gate for `config` under the pre-generated `request_id`.
pub fn gate(config: &RequestConfig, request_id: RequestId) -> Gated {
    if config.response_type == ResponseType::Stream {
        debug!(request_id = %request_id, "rejecting unsupported response type \"stream\"");
        return Gated::Synthetic(ResponseRecord::with_status(
            406,
            "Response Type \"stream\" Not Supported",
        ));
    }
    if config.before_redirect.is_some() {
        debug!(request_id = %request_id, "rejecting unsupported option \"before_redirect\"");
        return Gated::Synthetic(unsupported_option("before_redirect"));
    }
    if config.http_agent.is_some() {
        debug!(request_id = %request_id, "rejecting unsupported option \"http_agent\"");
        return Gated::Synthetic(unsupported_option("http_agent"));
    }
    if config.https_agent.is_some() {
        debug!(request_id = %request_id, "rejecting unsupported option \"https_agent\"");
        return Gated::Synthetic(unsupported_option("https_agent"));
    }
    if config.lookup.is_some() {
        debug!(request_id = %request_id, "rejecting unsupported option \"lookup\"");
        return Gated::Synthetic(unsupported_option("lookup"));
    }

    let mut envelope = RequestEnvelope::new(config.method.clone(), config.url.clone());
    envelope.request_id = request_id;
    envelope.base_url = config.base_url.clone();
    envelope.headers = config.headers.clone();
    envelope.params = config.params.clone();
    envelope.data = config.data.clone();
    envelope.body_format = config.body_format;
    envelope.timeout_ms = config.timeout.map(|t| t.as_millis() as u64);
    envelope.response_type = config.response_type;
    envelope.max_redirects = config.max_redirects;
    envelope.max_content_length = config.max_content_length;
    envelope.max_body_length = config.max_body_length;

    // A serializer function cannot cross the boundary: resolve the URL
    // locally and clear params; the URL already encodes them.
    if let Some(serializer) = &config.params_serializer {
        envelope.url = build_url(&envelope.url, envelope.params.as_ref(), Some(serializer));
        envelope.params = None;
        debug!(request_id = %request_id, url = %envelope.url, "resolved query string locally");
    }

    if let Some(cancel) = &config.cancel {
        if cancel.is_cancelled() {
            debug!(request_id = %request_id, "request canceled before dispatch");
            return Gated::Canceled(CancelRecord::new("Request aborted"));
        }
    }

    Gated::Envelope(Box::new(envelope))
}
