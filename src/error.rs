//! Error types surfaced by pool operations.

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error object a server attaches to a failed JSON-RPC response.
///
/// Codes are kept as raw integers: the pool reports them verbatim and never
/// branches on anything beyond "the server spoke", so there is nothing to
/// gain from naming the reserved ranges.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ServerError {
    /// A number indicating the error type that occurred.
    pub code: i64,
    /// A short description of the error.
    pub message: String,
    /// Additional information about the error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ServerError {
    /// `-32601`, sent back for server-initiated requests the pool does not
    /// implement.
    pub(crate) fn method_not_found(method: &str) -> Self {
        ServerError {
            code: -32601,
            message: format!("method not found: {}", method),
            data: None,
        }
    }
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ServerError {}

/// An error returned to the caller of a pool operation.
///
/// Every failure carries a stable `kind` tag (see [`Error::kind`]) so upstream
/// dispatch layers can route on it without string matching, plus a
/// human-readable message. There is no global error channel; every call is
/// self-contained.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The requested entity (file, definition, symbol, action id) does not
    /// exist.
    NotFound(String),
    /// The given position does not resolve to anything the server can act on.
    InvalidPosition(String),
    /// The request deadline elapsed before a response arrived.
    Timeout {
        /// Method that timed out.
        method: String,
        /// Deadline that elapsed.
        after: Duration,
    },
    /// The transport to the server died while the request was in flight.
    ConnectionLost(String),
    /// The server answered with a JSON-RPC error object.
    Server(ServerError),
    /// The primary path and every fallback strategy failed.
    ///
    /// Each entry names a strategy that was attempted and why it failed.
    Unavailable(Vec<(String, String)>),
    /// A `WorkspaceEdit` contained overlapping edits within one file.
    OverlappingEdits(String),
    /// The byte stream violated the base protocol framing.
    Framing(String),
    /// A response arrived but could not be interpreted.
    Protocol(String),
    /// The child process could not be launched, or exited during the spawn
    /// grace window.
    SpawnFailed(String),
}

impl Error {
    /// Stable tag identifying the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not-found",
            Error::InvalidPosition(_) => "invalid-position",
            Error::Timeout { .. } => "timeout",
            Error::ConnectionLost(_) => "connection-lost",
            Error::Server(_) => "server-error",
            Error::Unavailable(_) => "unavailable",
            Error::OverlappingEdits(_) => "overlapping-edits",
            Error::Framing(_) => "framing-error",
            Error::Protocol(_) => "protocol-error",
            Error::SpawnFailed(_) => "spawn-failed",
        }
    }

    pub(crate) fn timeout(method: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            method: method.into(),
            after,
        }
    }

    pub(crate) fn connection_lost(context: impl Into<String>) -> Self {
        Error::ConnectionLost(context.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "not found: {}", msg),
            Error::InvalidPosition(msg) => write!(f, "invalid position: {}", msg),
            Error::Timeout { method, after } => {
                write!(f, "request `{}` timed out after {:?}", method, after)
            }
            Error::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            Error::Server(err) => write!(f, "server error {}", err),
            Error::Unavailable(attempts) => {
                write!(f, "no strategy available")?;
                for (name, reason) in attempts {
                    write!(f, "; {}: {}", name, reason)?;
                }
                Ok(())
            }
            Error::OverlappingEdits(path) => write!(f, "overlapping edits in {}", path),
            Error::Framing(msg) => write!(f, "framing error: {}", msg),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::SpawnFailed(msg) => write!(f, "spawn failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Server(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<crate::codec::ParseError> for Error {
    fn from(err: crate::codec::ParseError) -> Self {
        Error::Framing(err.to_string())
    }
}
