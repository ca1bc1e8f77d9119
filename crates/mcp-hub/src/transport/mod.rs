//! Transport channels for the three supported wire framings.
//!
//! Each channel is a thin "send bytes, receive one correlated reply"
//! abstraction; the JSON-RPC envelope itself lives in [`crate::protocol`] and
//! is shared, not duplicated per transport.

pub mod http;
pub mod sse;
pub mod stdio;

use serde::{Deserialize, Serialize};

/// Closed set of wire protocols a backend server may speak. Adding a
/// transport means adding a variant here and matching exhaustively at the
/// dispatch/lifecycle seams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::Sse => "sse",
        };
        f.write_str(s)
    }
}
