//! Client SDK for Shoal chat servers.
//!
//! One [`client::Client`] owns one server's authenticated session: the
//! stateless HTTP login, the persistent WebSocket upgrade, request/response
//! and subscription calls over that socket, and disconnect detection. The
//! SDK does not reconnect automatically; consumers listen for the disconnect
//! callback and drive a fresh `login → connect → join` cycle themselves.

pub mod client;
pub mod error;
pub mod rpc;
pub mod types;

pub use client::{Client, ClientConfig};
pub use error::ClientError;
