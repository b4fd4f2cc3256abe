//! HTTP transport for the IMS API.
//!
//! - Attaches the session's bearer token to every request
//! - Cancels an in-flight request when an identical one is issued
//! - Bounds every call with a timeout
//! - Normalizes failures into `ApiError`, tearing the session down on 401

mod backend;
mod client;
mod error;
mod inflight;
mod request;

pub use backend::{BackendError, HttpBackend, HttpRequest, HttpResponse, ReqwestBackend};
pub use client::{RequestState, Transport, DEFAULT_TIMEOUT};
pub use error::{ApiError, ErrorKind};
pub use request::{Method, RequestDescriptor};

#[cfg(test)]
pub(crate) use backend::fake;
