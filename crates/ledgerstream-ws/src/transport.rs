//! WebSocket transport over tokio-tungstenite.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use ledgerstream_core::error::TransportError;
use ledgerstream_core::transport::{Connector, FrameSink, FrameStream, Session};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` / `wss://` sessions.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(10) }
    }
}

impl WsConnector {
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &str) -> Result<Session, TransportError> {
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(TransportError::InvalidEndpoint(format!(
                "{endpoint} (expected ws:// or wss://)"
            )));
        }

        let (ws, response) = tokio::time::timeout(self.connect_timeout, connect_async(endpoint))
            .await
            .map_err(|_| {
                TransportError::Connect(format!(
                    "handshake timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(classify)?;
        debug!(url = endpoint, status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = ws.split();
        Ok(Session::new(WsSink(sink), WsFrames(stream)))
    }
}

fn classify(e: WsError) -> TransportError {
    match e {
        WsError::Url(e) => TransportError::InvalidEndpoint(e.to_string()),
        WsError::Http(response) => {
            let status = response.status();
            if matches!(status.as_u16(), 401 | 403 | 426) {
                TransportError::Rejected(format!("HTTP {status}"))
            } else {
                TransportError::Connect(format!("HTTP {status}"))
            }
        }
        other => TransportError::Connect(other.to_string()),
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.0
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

struct WsFrames(SplitStream<WsStream>);

#[async_trait]
impl FrameStream for WsFrames {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("ignoring non-UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "server closed the session");
                    return None;
                }
                // tungstenite answers pings itself.
                Ok(_) => {}
                Err(e) => return Some(Err(TransportError::WebSocket(e.to_string()))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_websocket_scheme() {
        let err = WsConnector::default().open("https://xrplcluster.com").await.err().unwrap();
        assert!(matches!(err, TransportError::InvalidEndpoint(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        // Port 9 on localhost is almost never listening.
        let connector = WsConnector::with_connect_timeout(Duration::from_secs(2));
        match connector.open("ws://127.0.0.1:9").await {
            Err(e) => assert!(!e.is_fatal(), "{e}"),
            Ok(_) => panic!("unexpected listener on port 9"),
        }
    }
}
