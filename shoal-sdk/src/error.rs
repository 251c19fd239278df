//! Error taxonomy for the SDK surface.

use thiserror::Error;

/// Errors surfaced by [`crate::client::Client`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Login was rejected, or the login response carried no usable token.
    /// The message comes from the server's error field when one is present.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// An operation was attempted out of the required order
    /// (e.g. `connect` before `login`, `join` before `connect`).
    #[error("{0}")]
    State(&'static str),

    /// The handshake/join exchange failed; wraps the underlying cause.
    #[error("join failed: {0}")]
    Protocol(#[source] anyhow::Error),

    /// Socket-level failure: the connection could not be opened, a frame
    /// could not be sent, or a pending call was dropped by a close.
    #[error("transport error: {0}")]
    Transport(String),

    /// A single feed event failed to decode or deliver. Consumers log these;
    /// they never tear down the session.
    #[error("subscription error: {0}")]
    Subscription(String),
}
