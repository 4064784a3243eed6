//! Encoding of a log entry: the JSON array of events from one `produce`
//! call, optionally raw-deflated.
//!
//! Decoding accepts both forms: an entry that parses as a JSON array is
//! taken as-is, anything else is inflated first.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use crate::error::CodecError;
use crate::event::EventEnvelope;

/// Serialize a batch, compressing it when `compress` is set.
///
/// # Errors
///
/// Returns [`CodecError`] if serialization or compression fails.
pub fn encode_batch(events: &[EventEnvelope], compress: bool) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(events)?;
    if !compress {
        return Ok(json);
    }
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(json.len() / 2), Compression::fast());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decode an entry into its raw event values, in producer order.
///
/// Events are returned as untyped JSON so a single malformed event can be
/// skipped without losing the rest of the batch.
///
/// # Errors
///
/// Returns [`CodecError`] if the entry cannot be inflated or is not a JSON
/// array.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<serde_json::Value>, CodecError> {
    if bytes.first() == Some(&b'[')
        && let Ok(values) = serde_json::from_slice(bytes)
    {
        return Ok(values);
    }
    let mut json = Vec::with_capacity(bytes.len() * 4);
    DeflateDecoder::new(bytes).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}
