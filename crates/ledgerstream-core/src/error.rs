//! Error taxonomy for the streaming client.

use thiserror::Error;

use crate::message::EventKind;

/// Errors raised by a transport session (connect, send or receive).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// TCP/TLS/WebSocket handshake failed (refused, reset, DNS, ...).
    #[error("connect failed: {0}")]
    Connect(String),

    /// WebSocket send/receive error on an established session.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The peer closed the session.
    #[error("connection closed by peer")]
    Closed,

    /// The server refused the handshake (authentication, protocol version).
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The endpoint URL cannot be used at all.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl TransportError {
    /// Returns `true` if reconnecting cannot fix this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::InvalidEndpoint(_))
    }
}

/// Errors surfaced to callers of the client API.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The request exceeded its deadline.
    #[error("request '{command}' timed out after {ms}ms")]
    Timeout { command: String, ms: u64 },

    /// The connection dropped while the request was pending.
    #[error("connection lost while request was pending")]
    ConnectionLost,

    /// No session is currently established.
    #[error("not connected")]
    NotConnected,

    /// The logical connection terminated and will not be retried.
    #[error("fatal connection error: {0}")]
    Fatal(String),

    /// The node answered with an error response.
    #[error(
        "'{command}' failed: {error}{}",
        .message.as_deref().map(|m| format!(" ({m})")).unwrap_or_default()
    )]
    Rpc {
        command: String,
        error: String,
        code: Option<i64>,
        message: Option<String>,
    },

    /// Too many derived requests are already outstanding.
    #[error("'{command}' not sent: derived request backlog full")]
    Overloaded { command: String },

    /// Request parameters were not a JSON object.
    #[error("invalid params for '{command}': expected a JSON object")]
    InvalidParams { command: String },

    /// The client was shut down.
    #[error("client closed")]
    Closed,

    /// Encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StreamError {
    /// Returns `true` if retrying the same request may succeed on the same connection.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Rpc { error, .. } => {
                matches!(error.as_str(), "tooBusy" | "slowDown" | "noNetwork")
            }
            _ => false,
        }
    }

    /// Returns `true` if the error belongs to the current session rather than the request.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost
                | Self::NotConnected
                | Self::Closed
                | Self::Transport(_)
                | Self::Fatal(_)
        )
    }
}

/// Errors loading a [`ClientConfig`](crate::config::ClientConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors produced by application event handlers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler's queue was full and an event was dropped for it.
    #[error("handler queue full, dropped {kind} event")]
    Lagged { kind: EventKind },
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

impl From<StreamError> for HandlerError {
    fn from(e: StreamError) -> Self {
        Self::Failed(e.to_string())
    }
}

/// Where a reported error came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSource {
    /// An application handler registered for `kind`.
    Handler { kind: EventKind, handle: u64 },
    /// A request issued from a handler via `derive`.
    DerivedRequest { command: String },
    /// An inbound frame that could not be routed.
    Protocol,
    /// A subscription that could not be restored after reconnect.
    Replay { subscription: String },
}

/// An error observed off the request path, broadcast on the client's error channel.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: ErrorSource,
    pub message: String,
}

impl ErrorReport {
    pub fn new(source: ErrorSource, message: impl Into<String>) -> Self {
        Self { source, message: message.into() }
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            ErrorSource::Handler { kind, handle } => {
                write!(f, "[handler {handle} on {kind}] {}", self.message)
            }
            ErrorSource::DerivedRequest { command } => {
                write!(f, "[derived {command}] {}", self.message)
            }
            ErrorSource::Protocol => write!(f, "[protocol] {}", self.message),
            ErrorSource::Replay { subscription } => {
                write!(f, "[replay {subscription}] {}", self.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(TransportError::Rejected("401".into()).is_fatal());
        assert!(TransportError::InvalidEndpoint("ftp://x".into()).is_fatal());
        assert!(!TransportError::Connect("refused".into()).is_fatal());
        assert!(!TransportError::Closed.is_fatal());
    }

    #[test]
    fn rpc_error_display_includes_message() {
        let err = StreamError::Rpc {
            command: "book_changes".into(),
            error: "lgrNotFound".into(),
            code: Some(21),
            message: Some("ledgerNotFound".into()),
        };
        assert_eq!(err.to_string(), "'book_changes' failed: lgrNotFound (ledgerNotFound)");
    }

    #[test]
    fn retryable_errors() {
        assert!(StreamError::Timeout { command: "x".into(), ms: 1 }.is_retryable());
        assert!(!StreamError::ConnectionLost.is_retryable());
        assert!(StreamError::ConnectionLost.is_connection_scoped());
        let busy = StreamError::Rpc {
            command: "subscribe".into(),
            error: "tooBusy".into(),
            code: None,
            message: None,
        };
        assert!(busy.is_retryable());
    }
}
