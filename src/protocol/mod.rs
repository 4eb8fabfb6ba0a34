//! Wire protocol between the gateway and the prediction worker.
//!
//! Requests and replies are plain JSON bodies. Correlation and reply routing
//! travel as broker metadata on the [`Envelope`](crate::Envelope), so nothing
//! in this module knows about tokens or queues.
mod message;

pub use message::{
    //
    decode_request,
    decode_response,
    encode_request,
    encode_response,
    EntitySpan,
    PredictRequest,
    CONTENT_TYPE_JSON,
};
