//! The client facade tying connection, dispatcher, registry and router together.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Semaphore};
use tracing::{debug, error, info};

use ledgerstream_core::config::ClientConfig;
use ledgerstream_core::error::{ErrorReport, ErrorSource, StreamError};
use ledgerstream_core::message::{params_from_value, EventKind};
use ledgerstream_core::policy::RetryPolicy;
use ledgerstream_core::subscription::{
    command_params, Registration, Removal, Subscription, SubscriptionRegistry,
};
use ledgerstream_core::transport::Connector;

use crate::connection::{
    CloseReason, ConnectionManager, ConnectionMetrics, ConnectionState, LinkEvents,
};
use crate::dispatcher::RequestDispatcher;
use crate::router::{EventHandler, EventRouter, HandlerContext, HandlerHandle, RouterMetrics};
use crate::transport::WsConnector;

/// Streaming client over a single logical WebSocket connection.
///
/// Features:
/// - Auto-reconnect with capped exponential backoff
/// - Subscriptions restored on every new session before `Connected` is published
/// - Concurrent requests multiplexed by id, with per-request timeouts
/// - Per-kind event handlers that can issue derived requests without blocking
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct LedgerStreamClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    connection: ConnectionManager,
    dispatcher: RequestDispatcher,
    registry: SubscriptionRegistry,
    router: EventRouter,
    errors: broadcast::Sender<ErrorReport>,
    cancel: Arc<watch::Sender<bool>>,
    derived: Arc<Semaphore>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.connection.signal_shutdown();
    }
}

/// Session lifecycle hooks wired into the connection manager.
struct Lifecycle {
    dispatcher: RequestDispatcher,
    registry: SubscriptionRegistry,
    router: EventRouter,
    errors: broadcast::Sender<ErrorReport>,
    cancel: Arc<watch::Sender<bool>>,
    derived: Arc<Semaphore>,
    replay_policy: RetryPolicy,
}

#[async_trait]
impl LinkEvents for Lifecycle {
    async fn on_link_up(&self) {
        let report = self.registry.replay(&self.dispatcher, &self.replay_policy).await;
        for (sub, reason) in &report.failed {
            error!(subscription = %sub, reason = %reason, "subscription not restored");
            let _ = self.errors.send(ErrorReport::new(
                ErrorSource::Replay { subscription: sub.to_string() },
                reason.clone(),
            ));
        }
        let reissued = self.dispatcher.reissue_pending();
        if reissued > 0 {
            info!(reissued, "re-issued pending requests");
        }
    }

    fn on_link_down(&self) {
        self.registry.mark_offline();
        self.dispatcher.on_link_down();
    }

    fn on_frame(&self, frame: String) {
        self.router.dispatch(&frame);
    }

    fn on_closed(&self, reason: &CloseReason) {
        self.cancel.send_replace(true);
        self.derived.close();
        match reason {
            CloseReason::Requested => self.dispatcher.cancel_all(),
            _ => self.dispatcher.abandon_all(),
        }
        self.router.clear();
    }
}

impl LedgerStreamClient {
    /// Build a client for a `ws://` / `wss://` endpoint without connecting.
    pub fn new(endpoint: impl Into<String>, config: ClientConfig) -> Self {
        Self::with_connector(endpoint, config, Arc::new(WsConnector::default()))
    }

    /// Build a client over a custom transport.
    pub fn with_connector(
        endpoint: impl Into<String>,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let connection = ConnectionManager::new(endpoint, connector, config.reconnect.policy());
        let dispatcher = RequestDispatcher::new(
            Arc::new(connection.clone()),
            config.request_timeout(),
            config.idempotent_set(),
        );
        let (errors, _) = broadcast::channel(config.error_channel_capacity.max(1));
        let (cancel, cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel);
        let derived = Arc::new(Semaphore::new(config.max_derived_requests.max(1)));
        let ctx = HandlerContext::new(
            dispatcher.clone(),
            Arc::clone(&derived),
            config.max_pending_derived_requests,
            errors.clone(),
            cancel_rx,
        );
        let router = EventRouter::new(dispatcher.clone(), ctx, config.handler_queue_capacity);

        Self {
            inner: Arc::new(ClientInner {
                config,
                connection,
                dispatcher,
                registry: SubscriptionRegistry::new(),
                router,
                errors,
                cancel,
                derived,
            }),
        }
    }

    /// Build and connect; returns once the first session is ready.
    pub async fn connect(
        endpoint: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self, StreamError> {
        let client = Self::new(endpoint, config);
        client.start().await?;
        Ok(client)
    }

    /// Start the connection and wait until it is `Connected` or closed for good.
    pub async fn start(&self) -> Result<(), StreamError> {
        let lifecycle = Arc::new(Lifecycle {
            dispatcher: self.inner.dispatcher.clone(),
            registry: self.inner.registry.clone(),
            router: self.inner.router.clone(),
            errors: self.inner.errors.clone(),
            cancel: Arc::clone(&self.inner.cancel),
            derived: Arc::clone(&self.inner.derived),
            replay_policy: self.inner.config.replay.policy(),
        });
        let mut states = self.inner.connection.state_changes();
        self.inner.connection.start(lifecycle)?;

        loop {
            let state = states.borrow_and_update().clone();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed(CloseReason::Requested) => return Err(StreamError::Closed),
                ConnectionState::Closed(reason) => {
                    return Err(StreamError::Fatal(reason.to_string()))
                }
                _ => {}
            }
            if states.changed().await.is_err() {
                return Err(StreamError::Closed);
            }
        }
    }

    pub fn endpoint(&self) -> &str {
        self.inner.connection.endpoint()
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        match self.inner.connection.state() {
            ConnectionState::Closed(CloseReason::Requested) => Err(StreamError::Closed),
            ConnectionState::Closed(reason) => Err(StreamError::Fatal(reason.to_string())),
            _ => Ok(()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ----- subscriptions -----

    /// Add a subscription. It is sent now when the connection is ready,
    /// otherwise on the next session. Adding one twice is a no-op.
    pub async fn subscribe(&self, sub: Subscription) -> Result<(), StreamError> {
        self.ensure_open()?;
        match self.inner.registry.add(sub.clone()) {
            Registration::AlreadyPresent => {
                debug!(subscription = %sub, "already subscribed");
                Ok(())
            }
            Registration::Deferred => {
                debug!(subscription = %sub, "subscription deferred until connected");
                Ok(())
            }
            Registration::SendNow => {
                let subs = std::slice::from_ref(&sub);
                let params = command_params(subs, false);
                let outcome = self.inner.dispatcher.request("subscribe", params).await;
                let retract = self.inner.registry.settle(subs, outcome.is_ok());
                match outcome {
                    Ok(_) if !retract.is_empty() => {
                        debug!(subscription = %sub, "removed while subscribing, retracting");
                        self.send_unsubscribe(&retract).await
                    }
                    Ok(_) => {
                        info!(subscription = %sub, "subscribed");
                        Ok(())
                    }
                    Err(e) if e.is_connection_scoped() => {
                        debug!(
                            subscription = %sub,
                            error = %e,
                            "connection dropped, will subscribe on reconnect"
                        );
                        Ok(())
                    }
                    Err(e) => {
                        self.inner.registry.remove(&sub);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Remove a subscription. Removing one that is absent is a no-op.
    ///
    /// If the server refuses the `unsubscribe`, the entry is put back and
    /// the error returned.
    pub async fn unsubscribe(&self, sub: Subscription) -> Result<(), StreamError> {
        match self.inner.registry.remove(&sub) {
            Removal::Absent | Removal::Forgotten => Ok(()),
            Removal::Retracted => {
                debug!(subscription = %sub, "subscribe in flight, will retract once answered");
                Ok(())
            }
            Removal::SendNow => match self.send_unsubscribe(std::slice::from_ref(&sub)).await {
                Ok(()) => {
                    info!(subscription = %sub, "unsubscribed");
                    Ok(())
                }
                Err(e) => {
                    self.inner.registry.reinstate(sub);
                    Err(e)
                }
            },
        }
    }

    /// Send `unsubscribe`; a dropped session already forgot the subscriptions.
    async fn send_unsubscribe(&self, subs: &[Subscription]) -> Result<(), StreamError> {
        match self.inner.dispatcher.request("unsubscribe", command_params(subs, true)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_connection_scoped() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Every active subscription, in insertion order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.registry.snapshot()
    }

    // ----- requests -----

    /// Send a command with the configured timeout. `params` must be a JSON object or null.
    pub async fn request(&self, command: &str, params: Value) -> Result<Value, StreamError> {
        self.request_with_timeout(command, params, self.inner.dispatcher.default_timeout()).await
    }

    pub async fn request_with_timeout(
        &self,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, StreamError> {
        self.ensure_open()?;
        let params = params_from_value(command, params)?;
        self.inner.dispatcher.request_with_timeout(command, params, timeout).await
    }

    /// Requests awaiting an outcome.
    pub fn pending_requests(&self) -> usize {
        self.inner.dispatcher.pending_count()
    }

    // ----- events -----

    /// Register a handler for one event kind.
    pub fn on(&self, kind: EventKind, handler: impl EventHandler) -> HandlerHandle {
        self.inner.router.on(kind, handler)
    }

    pub fn off(&self, handle: HandlerHandle) -> bool {
        self.inner.router.off(handle)
    }

    /// Errors raised off the request path: handler failures, derived
    /// request failures, malformed frames, replay failures.
    pub fn errors(&self) -> broadcast::Receiver<ErrorReport> {
        self.inner.errors.subscribe()
    }

    // ----- observation -----

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state_changes()
    }

    pub fn router_metrics(&self) -> RouterMetrics {
        self.inner.router.metrics()
    }

    pub fn connection_metrics(&self) -> ConnectionMetrics {
        self.inner.connection.metrics()
    }

    /// Shut down: stop reconnecting, fail pending requests with `Closed`,
    /// cancel derived work and release handlers.
    pub async fn disconnect(&self) {
        self.inner.cancel.send_replace(true);
        self.inner.connection.disconnect().await;
        self.inner.dispatcher.cancel_all();
        self.inner.derived.close();
        self.inner.router.clear();
        info!(url = %self.endpoint(), "client disconnected");
    }
}
