//! ledgerstream-core: foundation traits and types for LedgerStream.
//!
//! # Overview
//!
//! LedgerStream is a streaming client for ledger nodes that speak a
//! publish/subscribe + request/response hybrid protocol over a single
//! WebSocket (the XRPL `subscribe` API being the reference). The core crate
//! defines:
//!
//! - [`Connector`] / [`FrameSink`] / [`FrameStream`]: the transport session boundary
//! - [`Request`] / [`InboundMessage`] / [`StreamEvent`]: wire types and routing classification
//! - [`StreamError`] / [`TransportError`] / [`HandlerError`]: structured error types
//! - [`SubscriptionRegistry`]: the replayable set of active subscriptions
//! - [`policy`] module: exponential backoff
//! - [`config`] module: serde-loadable client configuration

pub mod config;
pub mod error;
pub mod message;
pub mod policy;
pub mod subscription;
pub mod transport;

pub use config::{ClientConfig, ReconnectConfig, ReplayConfig};
pub use error::{ConfigError, ErrorReport, ErrorSource, HandlerError, StreamError, TransportError};
pub use message::{EventKind, InboundMessage, Params, Request, RpcFailure, StreamEvent};
pub use subscription::{
    Book, Issue, Registration, Removal, ReplayReport, StreamName, Subscription,
    SubscriptionKind, SubscriptionRegistry,
};
pub use transport::{Connector, FrameSink, FrameStream, Requester, Session};
