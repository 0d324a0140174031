//! ledgerstream-ws: WebSocket streaming client for ledger nodes.
//!
//! Provides:
//! - [`ConnectionManager`]: reconnect supervisor publishing [`ConnectionState`]
//! - [`RequestDispatcher`]: id-correlated requests with timeouts
//! - [`EventRouter`]: per-kind handler fan-out with derived requests
//! - [`LedgerStreamClient`]: the facade combining all of the above
//! - [`WsConnector`]: tokio-tungstenite transport
//!
//! # Example
//!
//! ```rust,no_run
//! use ledgerstream_core::{ClientConfig, EventKind, StreamName, Subscription};
//! use ledgerstream_ws::{handler_fn, LedgerStreamClient};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), ledgerstream_core::StreamError> {
//! let config = ClientConfig::default();
//! let client = LedgerStreamClient::connect("wss://xrplcluster.com", config).await?;
//! client.on(EventKind::LedgerClosed, handler_fn(|event, ctx| async move {
//!     if let Some(index) = event.ledger_index() {
//!         ctx.derive("book_changes", json!({ "ledger_index": index }), move |res| async move {
//!             println!("{index}: {:?}", res.map(|r| r["changes"].clone()));
//!             Ok(())
//!         });
//!     }
//!     Ok(())
//! }));
//! client.subscribe(Subscription::stream(StreamName::Ledger)).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod router;
pub mod transport;

pub use client::LedgerStreamClient;
pub use connection::{
    CloseReason, ConnectionManager, ConnectionMetrics, ConnectionState, LinkEvents,
};
pub use dispatcher::{DropPolicy, FrameSender, RequestDispatcher};
pub use router::{
    handler_fn, EventHandler, EventRouter, FnHandler, HandlerContext, HandlerHandle,
    RouterMetrics,
};
pub use transport::WsConnector;
