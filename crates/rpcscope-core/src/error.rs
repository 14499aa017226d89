//! Error types for rpcscope.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid interface UUID: {0}")]
    InvalidUuid(String),

    #[error("RPC {operation} failed with status {status}")]
    Rpc {
        operation: &'static str,
        status: u32,
    },

    #[error("Trace session error: {0}")]
    Trace(String),

    #[error("Monitor is already started")]
    MonitorAlreadyStarted,

    #[error("Monitor is not started")]
    MonitorNotStarted,

    #[error("Not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("Malformed registry: {0}")]
    Registry(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
