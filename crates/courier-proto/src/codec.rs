//! Payload encoding and decoding.
//!
//! Two formats cross the wire: the request envelope is JSON (it is a copy
//! of caller-supplied configuration and benefits from being inspectable),
//! while outcomes and progress events use rkyv binary serialisation.

use rkyv::rancor::Error as RkyvError;

use crate::envelope::RequestEnvelope;
use crate::error::ProtocolError;
use crate::outcome::Outcome;
use crate::progress::ProgressEvent;

/// Maximum payload size (10 MB).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

fn check_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Encodes a request envelope to JSON bytes.
pub fn encode_envelope(envelope: &RequestEnvelope) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(envelope)
        .map_err(|e| ProtocolError::Serialisation(e.to_string()))?;
    check_size(bytes.len())?;
    Ok(bytes)
}

/// Decodes a request envelope from JSON bytes.
pub fn decode_envelope(bytes: &[u8]) -> Result<RequestEnvelope, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialisation(e.to_string()))
}

/// Encodes an outcome to rkyv bytes.
pub fn encode_outcome(outcome: &Outcome) -> Result<Vec<u8>, ProtocolError> {
    let bytes = rkyv::to_bytes::<RkyvError>(outcome)
        .map_err(|e| ProtocolError::Serialisation(e.to_string()))?;
    check_size(bytes.len())?;
    Ok(bytes.into_vec())
}

/// Decodes an outcome from rkyv bytes, validating the archive.
pub fn decode_outcome(bytes: &[u8]) -> Result<Outcome, ProtocolError> {
    rkyv::from_bytes::<Outcome, RkyvError>(bytes)
        .map_err(|e| ProtocolError::Deserialisation(e.to_string()))
}

/// Encodes a progress event to rkyv bytes.
pub fn encode_progress(event: &ProgressEvent) -> Result<Vec<u8>, ProtocolError> {
    rkyv::to_bytes::<RkyvError>(event)
        .map(|b| b.into_vec())
        .map_err(|e| ProtocolError::Serialisation(e.to_string()))
}

/// Decodes a progress event from rkyv bytes, validating the archive.
pub fn decode_progress(bytes: &[u8]) -> Result<ProgressEvent, ProtocolError> {
    rkyv::from_bytes::<ProgressEvent, RkyvError>(bytes)
        .map_err(|e| ProtocolError::Deserialisation(e.to_string()))
}
