//! Request/response and subscription framing over one WebSocket.
//!
//! A single io task owns the socket. Callers talk to it through a clonable
//! [`RpcHandle`]; call replies come back over oneshots and subscription data
//! over per-subscription channels. The server's surface is addressed by
//! dotted path (`others.handshake`, `messages.send`, `channels.onReadStateUpdate`).
//!
//! The session token travels in the first frame after the socket opens
//! (`connectionParams`), never in the URL.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::error::ClientError;

/// Buffered events per subscription before the io task starts dropping.
const SUBSCRIPTION_BUFFER: usize = 256;
/// Buffered ops into the io task.
const OP_BUFFER: usize = 64;

/// Callback invoked once when the socket closes for any reason.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Outgoing frame.
#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<RequestParams<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestParams<'a> {
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<Value>,
}

/// Incoming frame. `result` and `error` are mutually exclusive in practice.
#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<IncomingResult>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct IncomingResult {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, Copy)]
enum CallKind {
    Query,
    Mutation,
}

impl CallKind {
    fn method(self) -> &'static str {
        match self {
            CallKind::Query => "query",
            CallKind::Mutation => "mutation",
        }
    }
}

enum Op {
    Call {
        kind: CallKind,
        path: String,
        input: Option<Value>,
        reply: oneshot::Sender<Result<Value, ClientError>>,
    },
    Subscribe {
        path: String,
        events: mpsc::Sender<Value>,
        reply: oneshot::Sender<u64>,
    },
    Unsubscribe {
        id: u64,
    },
    Close,
}

/// Clonable handle to a live connection's io task.
#[derive(Clone)]
pub struct RpcHandle {
    op_tx: mpsc::Sender<Op>,
}

impl RpcHandle {
    pub async fn query(&self, path: &str, input: Option<Value>) -> Result<Value, ClientError> {
        self.call(CallKind::Query, path, input).await
    }

    pub async fn mutate(&self, path: &str, input: Option<Value>) -> Result<Value, ClientError> {
        self.call(CallKind::Mutation, path, input).await
    }

    async fn call(
        &self,
        kind: CallKind,
        path: &str,
        input: Option<Value>,
    ) -> Result<Value, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.op_tx
            .send(Op::Call { kind, path: path.to_string(), input, reply: reply_tx })
            .await
            .map_err(|_| ClientError::Transport("connection closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| ClientError::Transport("connection closed before reply".to_string()))?
    }

    /// Open a server-push stream. Events arrive as raw JSON values; decoding
    /// is the consumer's concern so one bad event never kills the feed.
    pub async fn subscribe(
        &self,
        path: &str,
    ) -> Result<(SubscriptionHandle, mpsc::Receiver<Value>), ClientError> {
        let (events_tx, events_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.op_tx
            .send(Op::Subscribe { path: path.to_string(), events: events_tx, reply: reply_tx })
            .await
            .map_err(|_| ClientError::Transport("connection closed".to_string()))?;
        let id = reply_rx
            .await
            .map_err(|_| ClientError::Transport("connection closed during subscribe".to_string()))?;
        Ok((SubscriptionHandle { id, op_tx: self.op_tx.clone() }, events_rx))
    }

    /// Ask the io task to close the socket. Fire-and-forget; safe to call
    /// when the task is already gone.
    pub fn close(&self) {
        let _ = self.op_tx.try_send(Op::Close);
    }
}

/// Cancels one subscription. Fire-and-forget; safe after disconnect.
pub struct SubscriptionHandle {
    id: u64,
    op_tx: mpsc::Sender<Op>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(&self) {
        // The io task may already be gone, which is fine.
        let _ = self.op_tx.try_send(Op::Unsubscribe { id: self.id });
    }
}

/// Pending-call and subscription bookkeeping, separated from socket I/O so
/// frame dispatch is testable without a connection.
#[derive(Default)]
struct Router {
    last_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Value, ClientError>>>,
    subscriptions: HashMap<u64, mpsc::Sender<Value>>,
}

impl Router {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn route(&mut self, frame: Incoming) {
        let Some(id) = frame.id else {
            tracing::debug!("Frame without id ignored");
            return;
        };

        if let Some(reply) = self.pending.remove(&id) {
            let outcome = match frame.error {
                Some(err) => Err(ClientError::Protocol(anyhow::anyhow!(err.message))),
                None => Ok(frame.result.and_then(|r| r.data).unwrap_or(Value::Null)),
            };
            let _ = reply.send(outcome);
            return;
        }

        if !self.subscriptions.contains_key(&id) {
            return;
        }
        if let Some(err) = frame.error {
            // One bad event; the stream itself stays up.
            tracing::warn!(id, error = %err.message, "Subscription event error");
            return;
        }
        match frame.result {
            Some(result) if result.kind.as_deref() == Some("stopped") => {
                self.subscriptions.remove(&id);
            }
            Some(result) => {
                if let (Some(events), Some(data)) = (self.subscriptions.get(&id), result.data)
                    && let Err(e) = events.try_send(data)
                {
                    tracing::warn!(id, error = %e, "Dropped subscription event");
                }
            }
            None => {}
        }
    }

    /// Fail every pending call and end every feed.
    fn fail_all(&mut self, reason: &str) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(ClientError::Transport(reason.to_string())));
        }
        // Dropping the senders ends each feed's receiver.
        self.subscriptions.clear();
    }
}

/// Spawn the io task for one connection.
///
/// `open_tx` flips to true once the socket (and the connection-params frame)
/// is up, and back to false when it closes. `on_disconnect` fires exactly
/// once on close, whatever the cause.
pub(crate) fn spawn(
    url: String,
    token: String,
    open_tx: watch::Sender<bool>,
    on_disconnect: Option<DisconnectCallback>,
) -> RpcHandle {
    let (op_tx, op_rx) = mpsc::channel(OP_BUFFER);
    tokio::spawn(run_io(url, token, op_rx, open_tx, on_disconnect));
    RpcHandle { op_tx }
}

async fn run_io(
    url: String,
    token: String,
    mut op_rx: mpsc::Receiver<Op>,
    open_tx: watch::Sender<bool>,
    on_disconnect: Option<DisconnectCallback>,
) {
    let mut router = Router::default();

    let ws = match tokio_tungstenite::connect_async(&url).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "WebSocket connect failed");
            finish(&mut router, &open_tx, on_disconnect);
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    // Out-of-band auth: the token rides in the first frame, not the URL.
    let params = json!({ "method": "connectionParams", "data": { "token": token } });
    if sink.send(Message::text(params.to_string())).await.is_err() {
        tracing::warn!(url = %url, "WebSocket closed before connection params");
        finish(&mut router, &open_tx, on_disconnect);
        return;
    }

    let _ = open_tx.send(true);
    tracing::debug!(url = %url, "WebSocket connected");

    loop {
        tokio::select! {
            op = op_rx.recv() => match op {
                Some(Op::Call { kind, path, input, reply }) => {
                    let id = router.next_id();
                    let frame = Request {
                        id,
                        method: kind.method(),
                        params: Some(RequestParams { path: &path, input }),
                    };
                    match send_frame(&mut sink, &frame).await {
                        Ok(()) => {
                            router.pending.insert(id, reply);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(ClientError::Transport(e.to_string())));
                            break;
                        }
                    }
                }
                Some(Op::Subscribe { path, events, reply }) => {
                    let id = router.next_id();
                    let frame = Request {
                        id,
                        method: "subscription",
                        params: Some(RequestParams { path: &path, input: None }),
                    };
                    match send_frame(&mut sink, &frame).await {
                        Ok(()) => {
                            router.subscriptions.insert(id, events);
                            let _ = reply.send(id);
                        }
                        Err(e) => {
                            tracing::warn!(path = %path, error = %e, "Subscribe failed");
                            break;
                        }
                    }
                }
                Some(Op::Unsubscribe { id }) => {
                    if router.subscriptions.remove(&id).is_some() {
                        let frame = Request { id, method: "subscription.stop", params: None };
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Op::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Incoming>(text.as_str()) {
                        Ok(incoming) => router.route(incoming),
                        Err(e) => tracing::warn!(error = %e, "Undecodable frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!(url = %url, "WebSocket closed by server");
                    break;
                }
                Some(Ok(_)) => {} // ping/pong/binary: nothing to route
                Some(Err(e)) => {
                    tracing::warn!(url = %url, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    finish(&mut router, &open_tx, on_disconnect);
}

async fn send_frame<S>(sink: &mut S, frame: &Request<'_>) -> anyhow::Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(frame)?;
    sink.send(Message::text(text)).await?;
    Ok(())
}

fn finish(router: &mut Router, open_tx: &watch::Sender<bool>, on_disconnect: Option<DisconnectCallback>) {
    router.fail_all("connection closed");
    let _ = open_tx.send(false);
    if let Some(callback) = on_disconnect {
        callback();
    }
}
