//! Request dispatcher: correlates outbound commands with their responses.
//!
//! Every request gets a fresh id and a pending entry holding a oneshot
//! sender. The entry is removed exactly once: by a matching response, by a
//! timeout, by a connection drop, by shutdown, or when the caller stops
//! waiting. Whichever happens first decides the outcome.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use ledgerstream_core::error::StreamError;
use ledgerstream_core::message::{response_outcome, Params, Request};
use ledgerstream_core::transport::Requester;

use crate::connection::ConnectionManager;

/// Where encoded request frames go.
pub trait FrameSender: Send + Sync + 'static {
    fn send_frame(&self, frame: String) -> Result<(), StreamError>;
}

impl FrameSender for ConnectionManager {
    fn send_frame(&self, frame: String) -> Result<(), StreamError> {
        self.send(frame)
    }
}

/// What happens to a pending request when the connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Fail with `ConnectionLost`.
    Fail,
    /// Keep waiting and re-send the same frame on the next session.
    Reissue,
}

struct PendingRequest {
    command: String,
    frame: String,
    issued_at: Instant,
    on_drop: DropPolicy,
    awaiting_reissue: bool,
    tx: oneshot::Sender<Result<Value, StreamError>>,
}

type PendingMap = HashMap<u64, PendingRequest>;

struct DispatcherInner {
    sender: Arc<dyn FrameSender>,
    next_id: AtomicU64,
    pending: Mutex<PendingMap>,
    default_timeout: Duration,
    idempotent: HashSet<String>,
}

impl DispatcherInner {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes the pending entry when the caller's future completes or is dropped.
struct PendingGuard<'a> {
    inner: &'a DispatcherInner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending().remove(&self.id);
    }
}

#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<DispatcherInner>,
}

impl RequestDispatcher {
    pub fn new(
        sender: Arc<dyn FrameSender>,
        default_timeout: Duration,
        idempotent: HashSet<String>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                sender,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                default_timeout,
                idempotent,
            }),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Number of requests still awaiting an outcome.
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    /// Send a command with the default timeout.
    pub async fn request(&self, command: &str, params: Params) -> Result<Value, StreamError> {
        self.request_with_timeout(command, params, self.inner.default_timeout).await
    }

    /// Send a command and wait for its outcome, at most `timeout`.
    pub async fn request_with_timeout(
        &self,
        command: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<Value, StreamError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Request::new(id, command, params).to_frame()?;
        let (tx, rx) = oneshot::channel();

        let on_drop = if self.inner.idempotent.contains(command) {
            DropPolicy::Reissue
        } else {
            DropPolicy::Fail
        };

        self.inner.pending().insert(
            id,
            PendingRequest {
                command: command.to_string(),
                frame: frame.clone(),
                issued_at: Instant::now(),
                on_drop,
                awaiting_reissue: false,
                tx,
            },
        );
        let _guard = PendingGuard { inner: self.inner.as_ref(), id };

        debug!(id, command, "sending request");
        self.inner.sender.send_frame(frame)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(StreamError::Closed),
            Err(_) => {
                warn!(id, command, timeout_ms = timeout.as_millis() as u64, "request timed out");
                Err(StreamError::Timeout {
                    command: command.to_string(),
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Deliver a response to whoever is waiting on `id`.
    ///
    /// Returns the body back when nothing is waiting (late or unsolicited).
    pub fn resolve(&self, id: u64, body: Value) -> Option<Value> {
        let Some(pending) = self.inner.pending().remove(&id) else {
            return Some(body);
        };
        debug!(
            id,
            command = %pending.command,
            elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
            "response matched"
        );
        let outcome = response_outcome(body).map_err(|failure| StreamError::Rpc {
            command: pending.command,
            error: failure.error,
            code: failure.code,
            message: failure.message,
        });
        let _ = pending.tx.send(outcome);
        None
    }

    /// The session ended: fail what cannot survive it, park the rest.
    pub fn on_link_down(&self) {
        let mut pending = self.inner.pending();
        let failed: Vec<u64> = pending
            .iter()
            .filter(|(_, p)| p.on_drop == DropPolicy::Fail || p.tx.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in &failed {
            if let Some(p) = pending.remove(id) {
                let _ = p.tx.send(Err(StreamError::ConnectionLost));
            }
        }
        for p in pending.values_mut() {
            p.awaiting_reissue = true;
        }
        if !failed.is_empty() || !pending.is_empty() {
            debug!(
                failed = failed.len(),
                parked = pending.len(),
                "pending requests after link down"
            );
        }
    }

    /// Re-send parked idempotent requests on the new session. Returns how many were sent.
    pub fn reissue_pending(&self) -> usize {
        let frames: Vec<(u64, String)> = self
            .inner
            .pending()
            .iter_mut()
            .filter(|(_, p)| p.awaiting_reissue && !p.tx.is_closed())
            .map(|(id, p)| {
                p.awaiting_reissue = false;
                (*id, p.frame.clone())
            })
            .collect();

        let mut sent = 0;
        for (id, frame) in frames {
            match self.inner.sender.send_frame(frame) {
                Ok(()) => {
                    debug!(id, "re-issued request");
                    sent += 1;
                }
                Err(e) => warn!(id, error = %e, "failed to re-issue request"),
            }
        }
        sent
    }

    /// Fail every pending request with `Closed`.
    pub fn cancel_all(&self) {
        self.fail_all(|| StreamError::Closed);
    }

    /// The connection ended without a shutdown request: parked requests
    /// will never be re-sent, so fail everything with `ConnectionLost`.
    pub fn abandon_all(&self) {
        self.fail_all(|| StreamError::ConnectionLost);
    }

    fn fail_all(&self, error: impl Fn() -> StreamError) {
        let drained: Vec<PendingRequest> = self.inner.pending().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending requests");
        }
        for p in drained {
            let _ = p.tx.send(Err(error()));
        }
    }
}

#[async_trait]
impl Requester for RequestDispatcher {
    async fn command(&self, command: &str, params: Params) -> Result<Value, StreamError> {
        self.request(command, params).await
    }
}
