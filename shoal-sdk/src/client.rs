//! Transport client for one Shoal server.
//!
//! Owns a single server's authenticated session end to end: the stateless
//! HTTP login, the WebSocket upgrade (token delivered through the
//! connection-params frame, never the URL), the handshake/join exchange that
//! yields the initial state snapshot, and explicit teardown.
//!
//! Call order is enforced contractually: `login` before `connect`, `connect`
//! before `join`/`send_message`. Any socket close invalidates the connection
//! and everything derived from it; recovery is a fresh `login → connect →
//! join` cycle driven by the caller. The SDK never reconnects on its own.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::json;
use tokio::sync::watch;

use crate::error::ClientError;
use crate::rpc::{self, DisconnectCallback, RpcHandle};
use crate::types::{
    ChannelId, HandshakeReply, LoginErrorBody, LoginRequest, LoginResponse, MessageId,
    ServerSnapshot,
};

/// How long `join` waits for the socket to open before giving up.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for one server connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host. A full URL is accepted; any scheme prefix and trailing
    /// slash are stripped before the endpoint URLs are rebuilt.
    pub host: String,
    /// Use https/wss for both endpoints.
    pub use_ssl: bool,
}

/// One server's session: login token, live connection, disconnect callback.
pub struct Client {
    config: ClientConfig,
    http: reqwest::Client,
    token: Option<String>,
    rpc: Option<RpcHandle>,
    open_rx: Option<watch::Receiver<bool>>,
    on_disconnect: Option<DisconnectCallback>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            token: None,
            rpc: None,
            open_rx: None,
            on_disconnect: None,
        }
    }

    /// Register a callback invoked whenever the connection is lost,
    /// including closes during the login/connect/join chain.
    pub fn set_on_disconnect(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.on_disconnect = Some(Arc::new(callback));
    }

    /// Log in over HTTP. On success the session token is retained for the
    /// life of this client; it is not renewed automatically.
    pub async fn login(
        &mut self,
        identity: &str,
        password: &str,
        invite: Option<&str>,
    ) -> Result<LoginResponse, ClientError> {
        let url = format!("{}/login", http_base(&self.config));
        tracing::debug!(host = %self.config.host, "Logging in");

        let response = self
            .http
            .post(&url)
            .json(&LoginRequest {
                identity: identity.to_string(),
                password: password.to_string(),
                invite: invite.map(str::to_string),
            })
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("login request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body: LoginErrorBody = response.json().await.unwrap_or_default();
            return Err(ClientError::Auth(login_error_message(status.as_u16(), &body)));
        }

        let data: LoginResponse = response
            .json()
            .await
            .map_err(|_| ClientError::Auth("login succeeded but the response was unreadable".to_string()))?;
        let Some(token) = data.token.clone() else {
            return Err(ClientError::Auth("login succeeded but no token was returned".to_string()));
        };

        self.token = Some(token);
        Ok(data)
    }

    /// Open the persistent connection. Idempotent while the io task is
    /// alive: the existing handle is returned. After any socket close the
    /// old handle is discarded and a fresh socket is opened, so a caller
    /// can re-drive `connect → join` on the same client. The socket opens
    /// asynchronously; use [`Client::wait_connected`] to observe it.
    pub fn connect(&mut self) -> Result<RpcHandle, ClientError> {
        // The io task holds the sender side of the open watch until it
        // exits, so a closed watch means the connection is gone.
        if let Some(rpc) = &self.rpc
            && self.open_rx.as_ref().is_some_and(|rx| rx.has_changed().is_ok())
        {
            return Ok(rpc.clone());
        }
        let Some(token) = self.token.clone() else {
            return Err(ClientError::State("must login before connecting"));
        };

        let url = ws_base(&self.config);
        tracing::debug!(host = %self.config.host, "Connecting WebSocket");

        let (open_tx, open_rx) = watch::channel(false);
        let rpc = rpc::spawn(url, token, open_tx, self.on_disconnect.clone());
        self.open_rx = Some(open_rx);
        self.rpc = Some(rpc.clone());
        Ok(rpc)
    }

    /// Wait for the socket to open. Returns true immediately when open and
    /// false on timeout; never errors. The losing side of the race is
    /// abandoned, not cancelled.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let Some(rx) = &self.open_rx else { return false };
        if *rx.borrow() {
            return true;
        }
        let mut rx = rx.clone();
        tokio::time::timeout(timeout, async move {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    /// Perform the handshake/join exchange and return the initial snapshot.
    ///
    /// Requires `connect` first. The handshake must yield a non-empty hash
    /// before the join call is issued. `password` is only needed when the
    /// server reports one; the client does not pre-validate that locally.
    /// Failures at either step surface as a single [`ClientError::Protocol`].
    pub async fn join(&self, password: Option<&str>) -> Result<ServerSnapshot, ClientError> {
        let Some(rpc) = self.rpc.clone() else {
            return Err(ClientError::State("must connect before joining"));
        };

        if !self.wait_connected(DEFAULT_CONNECT_TIMEOUT).await {
            return Err(ClientError::Protocol(anyhow!("socket did not open")));
        }

        tracing::debug!(host = %self.config.host, "Performing handshake");
        let result: anyhow::Result<ServerSnapshot> = async {
            let reply = rpc.query("others.handshake", None).await?;
            let handshake: HandshakeReply = serde_json::from_value(reply)?;
            if handshake.handshake_hash.is_empty() {
                anyhow::bail!("handshake returned no hash");
            }

            let mut input = json!({ "handshakeHash": handshake.handshake_hash });
            if let Some(password) = password {
                input["password"] = json!(password);
            }
            let snapshot = rpc.query("others.joinServer", Some(input)).await?;
            Ok(serde_json::from_value(snapshot)?)
        }
        .await;

        match result {
            Ok(snapshot) => {
                tracing::debug!(host = %self.config.host, server = %snapshot.server_name, "Joined");
                Ok(snapshot)
            }
            Err(e) => {
                tracing::warn!(host = %self.config.host, error = %e, "Join failed");
                Err(ClientError::Protocol(e))
            }
        }
    }

    /// Send a message. `files` carries ids of previously uploaded files.
    pub async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &str,
        files: &[String],
    ) -> Result<MessageId, ClientError> {
        let Some(rpc) = self.rpc.clone() else {
            return Err(ClientError::State("must connect before sending"));
        };
        let reply = rpc
            .mutate(
                "messages.send",
                Some(json!({ "channelId": channel_id, "content": content, "files": files })),
            )
            .await?;
        serde_json::from_value(reply)
            .map_err(|e| ClientError::Protocol(anyhow!("unreadable messages.send reply: {e}")))
    }

    /// Handle to the live connection, if any.
    pub fn rpc(&self) -> Option<RpcHandle> {
        self.rpc.clone()
    }

    /// Close the socket and clear all connection state. Idempotent; safe
    /// when never connected. The login token survives for a later reconnect.
    pub fn disconnect(&mut self) {
        if let Some(rpc) = self.rpc.take() {
            rpc.close();
        }
        self.open_rx = None;
    }

    /// True only when a handle exists and the socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.rpc.is_some() && self.open_rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// The retained session token, if logged in.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

/// Strip any scheme prefix and trailing slash from a configured host.
fn clean_host(host: &str) -> &str {
    let host = host
        .strip_prefix("http://")
        .or_else(|| host.strip_prefix("https://"))
        .unwrap_or(host);
    host.strip_suffix('/').unwrap_or(host)
}

fn http_base(config: &ClientConfig) -> String {
    let scheme = if config.use_ssl { "https" } else { "http" };
    format!("{scheme}://{}", clean_host(&config.host))
}

fn ws_base(config: &ClientConfig) -> String {
    let scheme = if config.use_ssl { "wss" } else { "ws" };
    format!("{scheme}://{}", clean_host(&config.host))
}

/// Prefer the server's own wording; fall back to the bare HTTP status.
fn login_error_message(status: u16, body: &LoginErrorBody) -> String {
    if let Some(errors) = &body.errors {
        return match errors {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
    }
    if let Some(error) = &body.error {
        return error.clone();
    }
    format!("HTTP {status}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::new(ClientConfig { host: "localhost:4991".to_string(), use_ssl: false })
    }

    #[test]
    fn host_normalization() {
        assert_eq!(clean_host("chat.example.com"), "chat.example.com");
        assert_eq!(clean_host("chat.example.com/"), "chat.example.com");
        assert_eq!(clean_host("http://10.0.0.5:4991"), "10.0.0.5:4991");
        assert_eq!(clean_host("https://chat.example.com/"), "chat.example.com");
    }

    #[test]
    fn endpoint_urls_follow_ssl_flag() {
        let plain = ClientConfig { host: "http://h:1/".to_string(), use_ssl: false };
        assert_eq!(http_base(&plain), "http://h:1");
        assert_eq!(ws_base(&plain), "ws://h:1");

        let tls = ClientConfig { host: "h".to_string(), use_ssl: true };
        assert_eq!(http_base(&tls), "https://h");
        assert_eq!(ws_base(&tls), "wss://h");
    }

    #[test]
    fn login_error_message_prefers_server_fields() {
        let structured = LoginErrorBody {
            error: Some("ignored".to_string()),
            errors: Some(serde_json::json!("invite required")),
        };
        assert_eq!(login_error_message(403, &structured), "invite required");

        let single = LoginErrorBody { error: Some("bad credentials".to_string()), errors: None };
        assert_eq!(login_error_message(401, &single), "bad credentials");

        assert_eq!(login_error_message(500, &LoginErrorBody::default()), "HTTP 500");
    }

    #[test]
    fn connect_requires_login() {
        let mut client = client();
        assert!(matches!(client.connect(), Err(ClientError::State(_))));
    }

    #[tokio::test]
    async fn join_and_send_require_connect() {
        let client = client();
        assert!(matches!(client.join(None).await, Err(ClientError::State(_))));
        assert!(matches!(
            client.send_message(1, "hello", &[]).await,
            Err(ClientError::State(_))
        ));
        assert!(!client.is_connected());
        assert!(!client.wait_connected(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn connect_replaces_a_dead_connection() {
        let mut client =
            Client::new(ClientConfig { host: "127.0.0.1:1".to_string(), use_ssl: false });
        client.token = Some("tok".to_string());
        client.connect().unwrap();

        // Nothing listens on the port, so the io task exits straight away
        // and drops its side of the open watch.
        for _ in 0..200 {
            if client.open_rx.as_ref().is_some_and(|rx| rx.has_changed().is_err()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(client.open_rx.as_ref().unwrap().has_changed().is_err());

        client.connect().unwrap();
        assert!(
            client.open_rx.as_ref().unwrap().has_changed().is_ok(),
            "a dead connection must be replaced with a fresh io task"
        );
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut client = client();
        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());
    }
}
