//! Scripted in-process transport for client tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use ledgerstream_core::error::TransportError;
use ledgerstream_core::transport::{Connector, FrameSink, FrameStream, Session};
use ledgerstream_core::ClientConfig;
use ledgerstream_ws::ConnectionState;

/// Server end of one mock session.
pub struct ServerSide {
    pub from_client: mpsc::UnboundedReceiver<String>,
    pub to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
}

/// Connector whose `open` outcomes are scripted; unscripted opens succeed.
pub struct MockConnector {
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    sessions: mpsc::UnboundedSender<ServerSide>,
    opens: Mutex<Vec<Instant>>,
}

impl MockConnector {
    pub fn new(
        script: Vec<Result<(), TransportError>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into()),
            sessions: tx,
            opens: Mutex::new(Vec::new()),
        });
        (connector, rx)
    }

    /// When each `open` call happened.
    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _endpoint: &str) -> Result<Session, TransportError> {
        self.opens.lock().unwrap().push(Instant::now());
        let scripted = self.script.lock().unwrap().pop_front();
        if let Some(Err(e)) = scripted {
            return Err(e);
        }

        let (c2s_tx, c2s_rx) = mpsc::unbounded_channel();
        let (s2c_tx, s2c_rx) = mpsc::unbounded_channel();
        let _ = self.sessions.send(ServerSide { from_client: c2s_rx, to_client: s2c_tx });
        Ok(Session::new(MockSink(c2s_tx), MockStream(s2c_rx)))
    }
}

struct MockSink(mpsc::UnboundedSender<String>);

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.0.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {}
}

struct MockStream(mpsc::UnboundedReceiver<Result<String, TransportError>>);

#[async_trait]
impl FrameStream for MockStream {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        self.0.recv().await
    }
}

/// How the mock node answers one request.
pub enum Reply {
    Success(Value),
    Error(&'static str),
    Delayed(Duration, Value),
    Ignore,
}

/// A mock node answering requests with a responder function.
pub struct MockNode {
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    requests: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl MockNode {
    pub fn spawn<F>(side: ServerSide, responder: F) -> Self
    where
        F: Fn(&Value) -> Reply + Send + 'static,
    {
        let ServerSide { mut from_client, to_client } = side;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);
        let out = to_client.clone();
        let task = tokio::spawn(async move {
            while let Some(frame) = from_client.recv().await {
                let req: Value = serde_json::from_str(&frame).unwrap();
                log.lock().unwrap().push(req.clone());
                let id = req["id"].clone();
                match responder(&req) {
                    Reply::Success(result) => {
                        let _ = out.send(Ok(success(&id, result)));
                    }
                    Reply::Error(error) => {
                        let _ = out.send(Ok(failure(&id, error)));
                    }
                    Reply::Delayed(delay, result) => {
                        let out = out.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = out.send(Ok(success(&id, result)));
                        });
                    }
                    Reply::Ignore => {}
                }
            }
        });
        Self { to_client, requests, task }
    }

    /// Acknowledge every request with an empty result.
    pub fn ack_all(side: ServerSide) -> Self {
        Self::spawn(side, |_| Reply::Success(json!({})))
    }

    /// Push a stream event to the client.
    pub fn push(&self, event: Value) {
        let _ = self.to_client.send(Ok(event.to_string()));
    }

    pub fn push_raw(&self, frame: &str) {
        let _ = self.to_client.send(Ok(frame.to_string()));
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, command: &str) -> Vec<Value> {
        self.requests().into_iter().filter(|r| r["command"] == command).collect()
    }

    /// Wait until at least `n` requests have arrived.
    pub async fn wait_for_requests(&self, n: usize) {
        while self.requests.lock().unwrap().len() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Reset the session from the server side.
    pub fn kill(self) {
        let _ = self.to_client.send(Err(TransportError::WebSocket("connection reset".into())));
        self.task.abort();
    }
}

pub fn success(id: &Value, result: Value) -> String {
    json!({"id": id, "type": "response", "status": "success", "result": result}).to_string()
}

pub fn failure(id: &Value, error: &str) -> String {
    json!({"id": id, "type": "response", "status": "error", "error": error}).to_string()
}

pub fn ledger_closed(index: u64) -> Value {
    json!({
        "type": "ledgerClosed",
        "ledger_index": index,
        "ledger_hash": format!("{index:064X}"),
        "ledger_time": 750_000_000 + index,
        "txn_count": 12
    })
}

/// Small backoffs and timeouts so tests run quickly.
pub fn fast_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.reconnect.initial_backoff_ms = 10;
    config.reconnect.max_backoff_ms = 50;
    config.reconnect.jitter_fraction = 0.0;
    config.request_timeout_ms = 2_000;
    config.replay.initial_backoff_ms = 5;
    config
}

/// Wait until the state satisfies `pred`, returning it.
pub async fn wait_for_state<F>(
    rx: &mut watch::Receiver<ConnectionState>,
    pred: F,
) -> ConnectionState
where
    F: Fn(&ConnectionState) -> bool,
{
    loop {
        let state = rx.borrow_and_update().clone();
        if pred(&state) {
            return state;
        }
        rx.changed().await.unwrap();
    }
}

/// Bound a test step so a regression fails instead of hanging.
pub async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut).await.expect("test step timed out")
}
