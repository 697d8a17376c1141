//! JSON-RPC 2.0 client bound to one language server's stdio pipes.
//!
//! One client owns three background tasks: a writer that serializes frame
//! writes, a reader that decodes frames and routes responses to their pending
//! slots, and a relay that answers server-initiated requests so servers never
//! deadlock waiting on us. Server-to-client traffic is fanned out on a bounded
//! broadcast ring; the reader never blocks on subscriber work.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lsp_types::{CancelParams, NumberOrString};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::codec::LanguageServerCodec;
use crate::error::{Error, Result, ServerError};
use crate::jsonrpc::{self, Incoming, IncomingKind, Pending};

/// Writer queue depth. Frame bodies are pre-serialized, so entries are cheap.
const OUTBOUND_QUEUE: usize = 64;

/// Capacity of the server-message ring. When subscribers lag behind, the
/// oldest messages are dropped with a warning.
const EVENT_RING: usize = 256;

/// A server-initiated message observed on the connection.
#[derive(Clone, Debug)]
pub enum ServerMessage {
    /// A request from the server that expects a response.
    Request {
        /// The server's request ID, echoed verbatim in the reply.
        id: Value,
        /// Method name.
        method: String,
        /// The `params` member, if present.
        params: Option<Value>,
    },
    /// A notification from the server.
    Notification {
        /// Method name.
        method: String,
        /// The `params` member, if present.
        params: Option<Value>,
    },
}

enum Outgoing {
    Frame(String),
    Shutdown,
}

struct ClientInner {
    tx: mpsc::Sender<Outgoing>,
    request_id: AtomicI64,
    pending: Arc<Pending>,
    alive: Arc<AtomicBool>,
    events: broadcast::Sender<ServerMessage>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Handle for communicating with one language server.
///
/// This type provides a very cheap implementation of [`Clone`] so it can be
/// passed around freely; all clones share one connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Builds a client on top of the given byte streams and spawns its
    /// background tasks.
    pub fn new<I, O>(stdin: I, stdout: O) -> Self
    where
        I: AsyncWrite + Send + Unpin + 'static,
        O: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (events, relay_rx) = broadcast::channel(EVENT_RING);
        let pending = Arc::new(Pending::new());
        let alive = Arc::new(AtomicBool::new(true));

        // The relay receiver exists before the reader can broadcast anything,
        // so no early server request slips past unanswered.
        let writer = tokio::spawn(write_loop(stdin, rx));
        let reader = tokio::spawn(read_loop(
            stdout,
            pending.clone(),
            alive.clone(),
            events.clone(),
        ));
        let relay = tokio::spawn(relay_loop(relay_rx, tx.clone()));

        RpcClient {
            inner: Arc::new(ClientInner {
                tx,
                request_id: AtomicI64::new(1),
                pending,
                alive,
                events,
                tasks: StdMutex::new(vec![writer, reader, relay]),
            }),
        }
    }

    /// Subscribes to server-initiated messages on this connection.
    ///
    /// Subscribers that fall behind lose the oldest messages first.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.inner.events.subscribe()
    }

    /// Whether the connection is still usable.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Number of requests currently awaiting a response. Used by embedders
    /// and tests to check quiescence.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Sends a typed LSP request and awaits its response.
    pub async fn request<R>(&self, params: R::Params, deadline: Duration) -> Result<R::Result>
    where
        R: lsp_types::request::Request,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| Error::Protocol(format!("unserializable `{}` params: {}", R::METHOD, e)))?;
        let value = self.request_raw(R::METHOD, params, deadline).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("malformed `{}` response: {}", R::METHOD, e)))
    }

    /// Sends a request by method name and returns the raw result value.
    ///
    /// Used for the handful of methods whose response shape differs between
    /// servers and is parsed defensively by the caller.
    pub async fn request_raw(
        &self,
        method: &'static str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value> {
        if !self.is_alive() {
            return Err(Error::connection_lost("server is not running"));
        }

        let id = self.next_id();
        // Open the slot before the frame hits the wire; a fast server must
        // not be able to answer into the void.
        let rx = self.inner.pending.wait(id);
        let frame = jsonrpc::request_body(id, method, params);

        debug!(id, method, "sending request");
        if self.inner.tx.send(Outgoing::Frame(frame)).await.is_err() {
            self.inner.pending.forget(id);
            return Err(Error::connection_lost("writer task stopped"));
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => {
                debug!(id, ok = outcome.is_ok(), "received response");
                outcome.map_err(Error::Server)
            }
            Ok(Err(_)) => Err(Error::connection_lost("server closed the connection")),
            Err(_) => {
                self.inner.pending.forget(id);
                self.cancel(id).await;
                Err(Error::timeout(method, deadline))
            }
        }
    }

    /// Sends a typed LSP notification. Fire-and-forget.
    pub async fn notify<N>(&self, params: N::Params) -> Result<()>
    where
        N: lsp_types::notification::Notification,
    {
        if !self.is_alive() {
            return Err(Error::connection_lost("server is not running"));
        }

        let params = serde_json::to_value(params)
            .map_err(|e| Error::Protocol(format!("unserializable `{}` params: {}", N::METHOD, e)))?;
        trace!(method = N::METHOD, "sending notification");
        self.inner
            .tx
            .send(Outgoing::Frame(jsonrpc::notification_body(N::METHOD, params)))
            .await
            .map_err(|_| Error::connection_lost("writer task stopped"))
    }

    /// Sends a best-effort `$/cancelRequest` for the given request ID.
    pub async fn cancel(&self, id: i64) {
        let params = CancelParams {
            id: NumberOrString::Number(id as i32),
        };
        let _ = self
            .notify::<lsp_types::notification::Cancel>(params)
            .await;
    }

    /// Tears the connection down: stops the writer (closing the server's
    /// stdin), fails every pending request, and joins the background tasks.
    pub async fn close(&self) {
        if self.inner.alive.swap(false, Ordering::AcqRel) {
            let _ = self.inner.tx.send(Outgoing::Shutdown).await;
        }
        self.inner.pending.drain();

        let handles: Vec<_> = {
            let mut tasks = self.inner.tasks.lock().expect("task list poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }

    fn next_id(&self) -> i64 {
        self.inner.request_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("alive", &self.is_alive())
            .field("pending", &self.inner.pending)
            .finish()
    }
}

async fn write_loop<I>(stdin: I, mut rx: mpsc::Receiver<Outgoing>)
where
    I: AsyncWrite + Send + Unpin + 'static,
{
    let mut framed = FramedWrite::new(stdin, LanguageServerCodec::default());

    while let Some(outgoing) = rx.recv().await {
        match outgoing {
            Outgoing::Frame(body) => {
                if let Err(e) = framed.send(body).await {
                    warn!("failed to write frame to server: {}", e);
                    break;
                }
            }
            Outgoing::Shutdown => break,
        }
    }
    // Dropping the sink closes the server's stdin.
}

async fn read_loop<O>(
    stdout: O,
    pending: Arc<Pending>,
    alive: Arc<AtomicBool>,
    events: broadcast::Sender<ServerMessage>,
) where
    O: AsyncRead + Send + Unpin + 'static,
{
    let mut framed = FramedRead::new(stdout, LanguageServerCodec::default());

    while let Some(frame) = framed.next().await {
        let text = match frame {
            Ok(text) => text,
            Err(e) => {
                warn!("dropping connection: {}", e);
                break;
            }
        };

        let incoming = match Incoming::parse(&text) {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!("ignoring malformed message from server: {}", e);
                continue;
            }
        };
        match incoming.classify() {
            IncomingKind::Response { id, outcome } => pending.complete(id, outcome),
            IncomingKind::ServerRequest { id, method, params } => {
                // Send only fails with zero subscribers; the relay task is
                // always subscribed while the connection lives.
                let _ = events.send(ServerMessage::Request { id, method, params });
            }
            IncomingKind::Notification { method, params } => {
                let _ = events.send(ServerMessage::Notification { method, params });
            }
            IncomingKind::Unusable(reason) => {
                warn!("ignoring message from server: {}", reason)
            }
        }
    }

    alive.store(false, Ordering::Release);
    pending.drain();
    debug!("server connection closed");
}

/// Answers server-initiated requests so well-behaved servers never stall on
/// us, and swallows notifications that nobody else consumes.
async fn relay_loop(mut rx: broadcast::Receiver<ServerMessage>, tx: mpsc::Sender<Outgoing>) {
    loop {
        match rx.recv().await {
            Ok(ServerMessage::Request { id, method, params }) => {
                trace!(method = %method, "answering server request");
                let frame = auto_reply(id, &method, params.as_ref());
                if tx.send(Outgoing::Frame(frame)).await.is_err() {
                    break;
                }
            }
            Ok(ServerMessage::Notification { method, .. }) => {
                trace!(method = %method, "server notification");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("dropped {} oldest server message(s)", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn auto_reply(id: Value, method: &str, params: Option<&Value>) -> String {
    let outcome = match method {
        // Claim "no configuration" for each requested item.
        "workspace/configuration" => {
            let items = params
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map(|a| a.len())
                .unwrap_or(0);
            Ok(Value::Array(vec![json!({}); items]))
        }
        "window/workDoneProgress/create" | "client/registerCapability" => Ok(Value::Null),
        // The pool never applies server-pushed edits on the server's behalf.
        "workspace/applyEdit" => Ok(json!({ "applied": false })),
        _ => Err(ServerError::method_not_found(method)),
    };
    jsonrpc::response_body(id, outcome)
}
