//! Batch handling for the offline channel.
//!
//! This crate provides:
//! - BatchHandler: provider selection with fallback, store/send/clean routing
//! - RetryPolicy: status and attempt-ceiling classification
//! - Transport: sender capability, with a reqwest-backed HttpTransport

mod error;
mod handler;
mod retry;
mod transport;

pub use error::{HandlerError, HandlerResult};
pub use handler::BatchHandler;
pub use retry::{RetryPolicy, SendVerdict};
pub use transport::{
    HttpTransport, HttpTransportConfig, SendRequest, Transport, TransportResponse,
    JSON_STREAM_CONTENT_TYPE,
};
