use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Result, RpcError};

/// Content type attached to every request and reply.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Outbound request body: `{"input": "<text>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictRequest {
    /// Input text to analyze.
    pub input: String,
}

impl PredictRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// One labeled span of the input, as returned by the worker.
///
/// Offsets are character indices into the request input; the client passes
/// them through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpan {
    pub start_index: i64,
    pub end_index: i64,
    /// Entity label (e.g. `PER`, `LOC`).
    pub entity: String,
}

impl EntitySpan {
    pub fn new(start_index: i64, end_index: i64, entity: impl Into<String>) -> Self {
        Self {
            start_index,
            end_index,
            entity: entity.into(),
        }
    }
}

pub fn encode_request(req: &PredictRequest) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(req)?))
}

/// Worker-side counterpart of [`encode_request`].
pub fn decode_request(payload: &[u8]) -> Result<PredictRequest> {
    serde_json::from_slice(payload).map_err(|e| RpcError::Decode(e.to_string()))
}

/// Worker-side encoding of a reply body.
pub fn encode_response(spans: &[EntitySpan]) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(spans)?))
}

/// Decode a reply body into an ordered list of spans.
///
/// Any shape mismatch (not UTF-8, not an array, missing or mistyped field)
/// becomes [`RpcError::Decode`].
pub fn decode_response(payload: &[u8]) -> Result<Vec<EntitySpan>> {
    serde_json::from_slice(payload).map_err(|e| RpcError::Decode(e.to_string()))
}
