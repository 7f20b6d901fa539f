//! Error taxonomy for the control plane. Synchronous failures surface here and
//! map to HTTP status codes at the API layer; asynchronous failures (worker
//! crash, subscriber drop, overflow) become events or telemetry instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Invalid session config or cap values. Surfaced as 400.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Resource exhaustion at admission (e.g. all CUDA slots taken). Surfaced as 400.
    #[error("{0}")]
    Admission(String),

    /// Unknown session id. Surfaced as 404.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Worker spawn failure. Mid-life worker failures are published as
    /// `status{stage: failed}` events, not through this variant.
    #[error("worker error: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ControlError>;
