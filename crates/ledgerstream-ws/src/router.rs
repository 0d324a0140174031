//! Event router: classifies inbound frames and fans events out to handlers.
//!
//! Responses go to the [`RequestDispatcher`]. Stream events go to every
//! handler registered for their kind. Each handler owns a bounded queue and
//! a worker task, so a slow handler only delays itself.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use ledgerstream_core::error::{ErrorReport, ErrorSource, HandlerError, StreamError};
use ledgerstream_core::message::{params_from_value, EventKind, InboundMessage, StreamEvent};

use crate::dispatcher::RequestDispatcher;

/// Application callback for one event kind.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        event: Arc<StreamEvent>,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

/// Wrap a closure as a handler:
///
/// ```ignore
/// client.on(EventKind::LedgerClosed, handler_fn(|event, _ctx| async move {
///     println!("{}", event.payload);
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<StreamEvent>, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<StreamEvent>, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        event: Arc<StreamEvent>,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        (self.0)(event, ctx.clone()).await
    }
}

/// What a handler can do besides looking at its event.
#[derive(Clone)]
pub struct HandlerContext {
    dispatcher: RequestDispatcher,
    /// Derived requests in flight.
    derived: Arc<Semaphore>,
    /// Derived tasks outstanding, waiting or in flight.
    backlog: Arc<Semaphore>,
    errors: broadcast::Sender<ErrorReport>,
    cancel: watch::Receiver<bool>,
}

impl HandlerContext {
    pub fn new(
        dispatcher: RequestDispatcher,
        derived: Arc<Semaphore>,
        backlog: usize,
        errors: broadcast::Sender<ErrorReport>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            dispatcher,
            derived,
            backlog: Arc::new(Semaphore::new(backlog.max(1))),
            errors,
            cancel,
        }
    }

    /// Issue a request and wait for it inline. Holds up this handler only.
    pub async fn request(&self, command: &str, params: Value) -> Result<Value, StreamError> {
        let params = params_from_value(command, params)?;
        self.dispatcher.request(command, params).await
    }

    /// Issue a request on its own task and hand the outcome to `on_result`.
    ///
    /// The handler returns immediately, so the next event is not held up by
    /// this request's latency. Failures are reported on the error channel
    /// and still passed to `on_result`. When the derived backlog is full the
    /// request is not sent and fails with [`StreamError::Overloaded`].
    pub fn derive<F, Fut>(&self, command: &str, params: Value, on_result: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Value, StreamError>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let ctx = self.clone();
        let command = command.to_string();
        let slot = Arc::clone(&self.backlog).try_acquire_owned().ok();
        tokio::spawn(async move {
            let result = match slot {
                Some(_slot) => match ctx.run_derived(&command, params).await {
                    Some(result) => result,
                    None => return,
                },
                None => Err(StreamError::Overloaded { command: command.clone() }),
            };

            if let Err(e) = &result {
                if ctx.is_cancelled() {
                    return;
                }
                warn!(command = %command, error = %e, "derived request failed");
                ctx.report(ErrorSource::DerivedRequest { command: command.clone() }, e.to_string());
            }
            if let Err(e) = on_result(result).await {
                warn!(command = %command, error = %e, "derived result handler failed");
                ctx.report(ErrorSource::DerivedRequest { command }, e.to_string());
            }
        })
    }

    /// Wait for an in-flight slot and send. `None` when shut down first.
    async fn run_derived(
        &self,
        command: &str,
        params: Value,
    ) -> Option<Result<Value, StreamError>> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.derived).acquire_owned() => permit.ok()?,
            _ = self.cancelled() => return None,
        };
        let result = match params_from_value(command, params) {
            Ok(params) => self.dispatcher.request(command, params).await,
            Err(e) => Err(e),
        };
        drop(permit);
        Some(result)
    }

    /// Returns `true` once the client is shutting down.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when the client starts shutting down.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Publish an error on the client's error channel.
    pub fn report(&self, source: ErrorSource, message: impl Into<String>) {
        // No receivers is fine.
        let _ = self.errors.send(ErrorReport::new(source, message));
    }
}

/// Identifies one registration, for [`EventRouter::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerHandle {
    kind: EventKind,
    id: u64,
}

impl HandlerHandle {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Routing counters.
#[derive(Debug, Clone, Default)]
pub struct RouterMetrics {
    pub frames_received: u64,
    pub responses_matched: u64,
    pub events_routed: u64,
    pub unclassified: u64,
    pub dropped_events: u64,
    pub protocol_errors: u64,
}

struct Route {
    id: u64,
    tx: mpsc::Sender<Arc<StreamEvent>>,
}

struct RouterInner {
    routes: RwLock<HashMap<EventKind, Vec<Route>>>,
    next_id: AtomicU64,
    dispatcher: RequestDispatcher,
    ctx: HandlerContext,
    queue_capacity: usize,
    metrics: Mutex<RouterMetrics>,
}

impl RouterInner {
    fn metrics(&self) -> std::sync::MutexGuard<'_, RouterMetrics> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl EventRouter {
    pub fn new(dispatcher: RequestDispatcher, ctx: HandlerContext, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                routes: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                dispatcher,
                ctx,
                queue_capacity: queue_capacity.max(1),
                metrics: Mutex::new(RouterMetrics::default()),
            }),
        }
    }

    /// Register a handler for `kind`. Must be called inside a Tokio runtime.
    pub fn on(&self, kind: EventKind, handler: impl EventHandler) -> HandlerHandle {
        self.on_shared(kind, Arc::new(handler))
    }

    pub fn on_shared(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> HandlerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        tokio::spawn(handler_worker(kind, id, handler, rx, self.inner.ctx.clone()));

        self.inner
            .routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(kind)
            .or_default()
            .push(Route { id, tx });
        debug!(%kind, handle = id, "handler registered");
        HandlerHandle { kind, id }
    }

    /// Remove a handler. Events already queued for it are still processed.
    pub fn off(&self, handle: HandlerHandle) -> bool {
        let mut routes = self.inner.routes.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(list) = routes.get_mut(&handle.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != handle.id);
        let removed = list.len() != before;
        if list.is_empty() {
            routes.remove(&handle.kind);
        }
        removed
    }

    /// Drop every registration; workers exit once their queues drain.
    pub fn clear(&self) {
        self.inner.routes.write().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.inner
            .routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    pub fn metrics(&self) -> RouterMetrics {
        self.inner.metrics().clone()
    }

    /// Classify one inbound frame and route it. Never blocks.
    pub fn dispatch(&self, frame: &str) {
        self.inner.metrics().frames_received += 1;
        match InboundMessage::parse(frame) {
            Ok(InboundMessage::Response { id, body }) => {
                match self.inner.dispatcher.resolve(id, body) {
                    None => self.inner.metrics().responses_matched += 1,
                    Some(body) => {
                        debug!(id, "response with no waiting request");
                        self.deliver(StreamEvent { kind: EventKind::Unclassified, payload: body });
                    }
                }
            }
            Ok(InboundMessage::Event(event)) => self.deliver(event),
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                self.inner.metrics().protocol_errors += 1;
                self.inner.ctx.report(ErrorSource::Protocol, e.to_string());
            }
        }
    }

    fn deliver(&self, event: StreamEvent) {
        let kind = event.kind;
        let event = Arc::new(event);
        let mut dropped = Vec::new();
        {
            let routes = self.inner.routes.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            match routes.get(&kind) {
                Some(list) => {
                    for route in list {
                        match route.tx.try_send(Arc::clone(&event)) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => dropped.push(route.id),
                            Err(TrySendError::Closed(_)) => {}
                        }
                    }
                }
                None => trace!(%kind, "no handler registered"),
            }
        }

        {
            let mut metrics = self.inner.metrics();
            metrics.events_routed += 1;
            if kind == EventKind::Unclassified {
                metrics.unclassified += 1;
            }
            metrics.dropped_events += dropped.len() as u64;
        }

        for handle in dropped {
            warn!(%kind, handle, "handler queue full, event dropped");
            let lagged = HandlerError::Lagged { kind };
            self.inner.ctx.report(ErrorSource::Handler { kind, handle }, lagged.to_string());
        }
    }
}

async fn handler_worker(
    kind: EventKind,
    id: u64,
    handler: Arc<dyn EventHandler>,
    mut rx: mpsc::Receiver<Arc<StreamEvent>>,
    ctx: HandlerContext,
) {
    while let Some(event) = rx.recv().await {
        let outcome = AssertUnwindSafe(handler.handle(event, &ctx)).catch_unwind().await;
        let err = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(panic) => HandlerError::Panicked(panic_message(panic.as_ref())),
        };
        warn!(%kind, handle = id, error = %err, "handler error");
        ctx.report(ErrorSource::Handler { kind, handle: id }, err.to_string());
    }
    trace!(%kind, handle = id, "handler worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
