//! The transport session boundary and the request seam used by replay.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{StreamError, TransportError};
use crate::message::Params;

/// Write half of a session.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Send one text frame.
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Close the session gracefully. Errors are ignored.
    async fn close(&mut self);
}

/// Read half of a session.
#[async_trait]
pub trait FrameStream: Send + 'static {
    /// Next text frame; `None` once the session is closed.
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;
}

/// One physical connection, split so reads and writes run on separate tasks.
pub struct Session {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl Session {
    pub fn new(sink: impl FrameSink, stream: impl FrameStream) -> Self {
        Self { sink: Box::new(sink), stream: Box::new(stream) }
    }
}

/// Opens sessions to an endpoint.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; the connection manager keeps one
/// behind an `Arc` and calls `open` again on every reconnect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, endpoint: &str) -> Result<Session, TransportError>;
}

/// Anything that can issue a correlated command and await its result.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn command(&self, command: &str, params: Params) -> Result<Value, StreamError>;
}
