//! Error taxonomy shared across transports, lifecycle and dispatch.
//!
//! Lifecycle operations never surface these to callers directly (they log and
//! return booleans); dispatch converts them into structured call outcomes so
//! the HTTP front door can map failures to status codes without downcasting.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Unknown tool or server name. Lookup failures carry the name.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend process behind a stdio connection has exited.
    #[error("backend process terminated: {0}")]
    ProcessTerminated(String),

    /// A call, handshake or health check exceeded its bound.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed JSON, a reply missing both `result` and `error`, or an
    /// unexpected HTTP status.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A server definition references environment data that is not present.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every candidate endpoint for a transport was tried and none succeeded.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// Short stable tag for log fields and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::NotFound(_) => "not_found",
            HubError::ProcessTerminated(_) => "process_terminated",
            HubError::Timeout(_) => "timeout",
            HubError::Protocol(_) => "protocol",
            HubError::Configuration(_) => "configuration",
            HubError::TransportUnavailable(_) => "transport_unavailable",
            HubError::Io(_) => "io",
        }
    }
}
