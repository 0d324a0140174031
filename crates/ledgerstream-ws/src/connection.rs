//! Connection manager: one logical connection over a sequence of sessions.
//!
//! A supervisor task owns the reconnect loop. Each session gets a writer
//! task (draining an outbound queue into the sink) and a reader task
//! (feeding every inbound frame to [`LinkEvents::on_frame`]). At most one
//! session is alive at a time.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ledgerstream_core::error::{StreamError, TransportError};
use ledgerstream_core::policy::RetryPolicy;
use ledgerstream_core::transport::{Connector, FrameSink, Session};

/// Why the logical connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `disconnect()` was called.
    Requested,
    /// A non-retryable error (or reconnect disabled).
    Fatal(String),
    /// Reconnect attempts exhausted.
    GaveUp { attempts: u32 },
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "closed by request"),
            Self::Fatal(reason) => write!(f, "{reason}"),
            Self::GaveUp { attempts } => write!(f, "gave up after {attempts} reconnect attempts"),
        }
    }
}

/// State of the logical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Session up and subscriptions restored.
    Connected,
    /// Waiting out a backoff delay.
    Reconnecting,
    /// Terminal.
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed(reason) => write!(f, "closed ({reason})"),
        }
    }
}

/// Callbacks driven by the connection manager.
#[async_trait]
pub trait LinkEvents: Send + Sync + 'static {
    /// A session was opened. `Connected` is published once this returns.
    async fn on_link_up(&self);

    /// The session ended (drop, error or shutdown).
    fn on_link_down(&self);

    /// An inbound frame, in transport order. Must not block.
    fn on_frame(&self, frame: String);

    /// The logical connection ended for good. Called once, after the last
    /// `on_link_down` and before `Closed` is published.
    fn on_closed(&self, reason: &CloseReason);
}

/// Metrics snapshot for the connection manager.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    pub sessions_opened: u64,
    pub failed_attempts: u64,
    pub reconnections: u64,
    pub last_backoff: Option<Duration>,
}

struct ManagerInner {
    endpoint: String,
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    metrics: Mutex<ConnectionMetrics>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ManagerInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            info!(url = %self.endpoint, from = %previous, to = %state, "connection state changed");
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Drives the transport through its reconnect lifecycle.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ManagerInner {
                endpoint: endpoint.into(),
                connector,
                policy,
                state_tx,
                shutdown_tx,
                outbound: Mutex::new(None),
                supervisor: Mutex::new(None),
                metrics: Mutex::new(ConnectionMetrics::default()),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        lock(&self.inner.metrics).clone()
    }

    /// Returns `true` while a session is open (including the replay window).
    pub fn is_link_up(&self) -> bool {
        lock(&self.inner.outbound).is_some()
    }

    /// Start the supervisor task. Calling it again is a no-op.
    pub fn start(&self, events: Arc<dyn LinkEvents>) -> Result<(), StreamError> {
        if self.state().is_closed() || self.inner.is_shutdown() {
            return Err(StreamError::Closed);
        }
        let mut supervisor = lock(&self.inner.supervisor);
        if supervisor.is_none() {
            let inner = Arc::clone(&self.inner);
            *supervisor = Some(tokio::spawn(supervise(inner, events)));
        }
        Ok(())
    }

    /// Queue a frame on the current session.
    pub fn send(&self, frame: String) -> Result<(), StreamError> {
        match lock(&self.inner.outbound).as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| StreamError::ConnectionLost),
            None => Err(StreamError::NotConnected),
        }
    }

    /// Raise the shutdown flag without waiting for the supervisor.
    pub fn signal_shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }

    /// Stop reconnecting, close the session and wait for the supervisor to exit.
    pub async fn disconnect(&self) {
        self.signal_shutdown();
        let handle = lock(&self.inner.supervisor).take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(error = %e, "connection supervisor ended abnormally");
                }
            }
            None => self.inner.set_state(ConnectionState::Closed(CloseReason::Requested)),
        }
        if !self.state().is_closed() {
            self.inner.set_state(ConnectionState::Closed(CloseReason::Requested));
        }
    }
}

enum SessionEnd {
    Shutdown,
    Dropped(Option<TransportError>),
}

async fn supervise(inner: Arc<ManagerInner>, events: Arc<dyn LinkEvents>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut attempt: u32 = 0;
    let mut opened_before = false;

    let reason = loop {
        if *shutdown.borrow_and_update() {
            break CloseReason::Requested;
        }

        inner.set_state(ConnectionState::Connecting);
        info!(url = %inner.endpoint, attempt, "connecting");

        let opened = tokio::select! {
            res = inner.connector.open(&inner.endpoint) => res,
            _ = shutdown.changed() => break CloseReason::Requested,
        };

        let last_error = match opened {
            Ok(session) => {
                attempt = 0;
                {
                    let mut metrics = lock(&inner.metrics);
                    metrics.sessions_opened += 1;
                    if opened_before {
                        metrics.reconnections += 1;
                    }
                }
                opened_before = true;

                match run_session(&inner, &events, session, &mut shutdown).await {
                    SessionEnd::Shutdown => break CloseReason::Requested,
                    SessionEnd::Dropped(err) => {
                        let reason = err
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "connection closed".into());
                        warn!(url = %inner.endpoint, error = %reason, "session dropped");
                        reason
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                error!(url = %inner.endpoint, error = %e, "fatal connection error");
                break CloseReason::Fatal(e.to_string());
            }
            Err(e) => {
                warn!(url = %inner.endpoint, error = %e, "connect failed");
                lock(&inner.metrics).failed_attempts += 1;
                e.to_string()
            }
        };

        attempt += 1;
        let Some(delay) = inner.policy.next_delay(attempt) else {
            break if attempt == 1 {
                CloseReason::Fatal(last_error)
            } else {
                CloseReason::GaveUp { attempts: attempt - 1 }
            };
        };

        lock(&inner.metrics).last_backoff = Some(delay);
        inner.set_state(ConnectionState::Reconnecting);
        info!(url = %inner.endpoint, attempt, "reconnecting in {delay:?}");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break CloseReason::Requested,
        }
    };

    if !matches!(reason, CloseReason::Requested) {
        error!(url = %inner.endpoint, reason = %reason, "connection closed for good");
    }
    events.on_closed(&reason);
    inner.set_state(ConnectionState::Closed(reason));
}

async fn run_session(
    inner: &Arc<ManagerInner>,
    events: &Arc<dyn LinkEvents>,
    session: Session,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let Session { sink, mut stream } = session;
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let (down_tx, mut down_rx) = mpsc::channel::<Option<TransportError>>(2);

    let writer = tokio::spawn(write_loop(sink, out_rx, down_tx.clone()));

    let reader_events = Arc::clone(events);
    let reader = tokio::spawn(async move {
        let err = loop {
            match stream.next_frame().await {
                Some(Ok(frame)) => reader_events.on_frame(frame),
                Some(Err(e)) => break Some(e),
                None => break None,
            }
        };
        let _ = down_tx.send(err).await;
    });

    *lock(&inner.outbound) = Some(out_tx);
    debug!(url = %inner.endpoint, "session established, restoring state");

    let early_end = tokio::select! {
        _ = events.on_link_up() => None,
        err = down_rx.recv() => Some(SessionEnd::Dropped(err.flatten())),
        _ = shutdown.changed() => Some(SessionEnd::Shutdown),
    };

    let end = match early_end {
        Some(end) => end,
        None => {
            inner.set_state(ConnectionState::Connected);
            tokio::select! {
                err = down_rx.recv() => SessionEnd::Dropped(err.flatten()),
                _ = shutdown.changed() => SessionEnd::Shutdown,
            }
        }
    };

    // Dropping the sender lets the writer flush what is queued and close the sink.
    let outbound = lock(&inner.outbound).take();
    drop(outbound);
    reader.abort();
    events.on_link_down();

    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        debug!(url = %inner.endpoint, "writer did not close in time");
    }
    end
}

async fn write_loop(
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::UnboundedReceiver<String>,
    down: mpsc::Sender<Option<TransportError>>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "WS send failed");
            let _ = down.send(Some(e)).await;
            break;
        }
    }
    sink.close().await;
}
