//! Reliability policies shared by reconnect and subscription replay.

pub mod retry;

pub use retry::{RetryConfig, RetryPolicy};
