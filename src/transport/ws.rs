use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::Transport;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::multiplex::{ChangeCallback, UpstreamHandle};
use crate::operation::Method;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::query::Query;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = oneshot::Sender<BridgeResult<Value>>;

/// JSON-over-WebSocket client for [`server::api`](crate::server::api).
///
/// A supervisor task owns the socket and redials with exponential backoff
/// after it drops. While the socket is down requests fail with
/// [`BridgeError::Disconnected`]; requests in flight when it drops fail the
/// same way and notification routes are forgotten.
pub struct WsTransport {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    url: Url,
    request_timeout: Duration,
    reconnect_initial_delay: Duration,
    reconnect_max_delay: Duration,
    connected: AtomicBool,
    epoch: AtomicU64,
    closed: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    pending: DashMap<u64, Reply>,
    routes: DashMap<u64, ChangeCallback>,
    next_id: AtomicU64,
}

impl WsTransport {
    /// Dial `url` and keep the connection alive in the background
    pub async fn connect(url: &str, config: &BridgeConfig) -> BridgeResult<Self> {
        let url =
            Url::parse(url).map_err(|e| BridgeError::Transport(format!("invalid ws url: {e}")))?;
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| BridgeError::Transport(format!("connect {url}: {e}")))?;

        let inner = Arc::new(Inner {
            url,
            request_timeout: config.request_timeout(),
            reconnect_initial_delay: config.reconnect_initial_delay(),
            reconnect_max_delay: config.reconnect_max_delay(),
            connected: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            outbound: Mutex::new(None),
            pending: DashMap::new(),
            routes: DashMap::new(),
            next_id: AtomicU64::new(0),
        });

        // Mark the channel usable before returning so the first request
        // does not race the supervisor.
        let outgoing = inner.open_channel();
        let supervisor = tokio::spawn(supervise(inner.clone(), stream, outgoing));
        tracing::info!(url = %inner.url, "connected to bridge server");

        Ok(Self {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Stop redialing and fail everything in flight
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
        self.inner.on_disconnect();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl Transport for WsTransport {
    fn invoke(&self, method: Method, args: Vec<Value>) -> BoxFuture<'_, BridgeResult<Value>> {
        Box::pin(async move {
            let (id, reply) = self.inner.issue(|id| ClientMessage::Call {
                id,
                method: method.as_str().to_string(),
                args,
            })?;
            self.inner.wait(id, reply).await
        })
    }

    fn subscribe(
        &self,
        query: Query,
        on_change: ChangeCallback,
    ) -> BoxFuture<'_, BridgeResult<UpstreamHandle>> {
        Box::pin(async move {
            let inner = &self.inner;
            let id = inner.next_id();
            // The route goes in before the request so no early change is lost.
            inner.routes.insert(id, on_change);
            let message = ClientMessage::Subscribe {
                id,
                query: query.to_value(),
            };
            let reply = match inner.request(id, message) {
                Ok(reply) => reply,
                Err(err) => {
                    inner.routes.remove(&id);
                    return Err(err);
                }
            };

            if let Err(err) = inner.wait(id, reply).await {
                inner.routes.remove(&id);
                if matches!(err, BridgeError::Timeout(_)) {
                    // The server may still open it; ask for it back.
                    inner.send(ClientMessage::Unsubscribe {
                        id: inner.next_id(),
                        subscription: id,
                    });
                }
                return Err(err);
            }

            let inner = self.inner.clone();
            Ok(UpstreamHandle::new(move || {
                inner.routes.remove(&id);
                let issued = inner.issue(|request| ClientMessage::Unsubscribe {
                    id: request,
                    subscription: id,
                });
                let inner = inner.clone();
                async move {
                    let (request, reply) = issued?;
                    inner.wait(request, reply).await.map(|_| ())
                }
            }))
        })
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn connection_epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Install a fresh outbound queue, start a new epoch and mark the
    /// channel connected
    fn open_channel(&self) -> mpsc::UnboundedReceiver<ClientMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        rx
    }

    fn send(&self, message: ClientMessage) -> bool {
        match &*self.outbound.lock() {
            Some(outbound) => outbound.send(message).is_ok(),
            None => false,
        }
    }

    /// Queue a request now; its reply is awaited separately with [`Inner::wait`].
    fn issue(
        &self,
        build: impl FnOnce(u64) -> ClientMessage,
    ) -> BridgeResult<(u64, oneshot::Receiver<BridgeResult<Value>>)> {
        let id = self.next_id();
        let reply = self.request(id, build(id))?;
        Ok((id, reply))
    }

    fn request(
        &self,
        id: u64,
        message: ClientMessage,
    ) -> BridgeResult<oneshot::Receiver<BridgeResult<Value>>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if !self.send(message) {
            self.pending.remove(&id);
            return Err(BridgeError::Disconnected);
        }
        Ok(rx)
    }

    async fn wait(
        &self,
        id: u64,
        reply: oneshot::Receiver<BridgeResult<Value>>,
    ) -> BridgeResult<Value> {
        match tokio::time::timeout(self.request_timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::Disconnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(BridgeError::Timeout(self.request_timeout))
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "dropping unparseable server frame");
                return;
            }
        };

        match message {
            ServerMessage::Result { id, value } => {
                if let Some((_, reply)) = self.pending.remove(&id) {
                    let _ = reply.send(Ok(value));
                }
            }
            ServerMessage::Error { id, code, message } => {
                if let Some((_, reply)) = self.pending.remove(&id) {
                    let _ = reply.send(Err(BridgeError::from_wire(code, message)));
                }
            }
            ServerMessage::Change {
                subscription,
                old,
                new,
            } => {
                let route = self
                    .routes
                    .get(&subscription)
                    .map(|route| Arc::clone(route.value()));
                if let Some(on_change) = route {
                    on_change(&old, &new);
                }
            }
            ServerMessage::Pong => {}
        }
    }

    fn on_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.outbound.lock() = None;

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(BridgeError::Disconnected));
            }
        }
        self.routes.clear();
    }

    async fn redial(&self) -> Option<WsStream> {
        let mut delay = self.reconnect_initial_delay;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            tokio::time::sleep(delay).await;

            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((stream, _)) => return Some(stream),
                Err(err) => {
                    tracing::debug!(
                        url = %self.url,
                        error = %err,
                        "redial failed, retrying in {:?}",
                        delay
                    );
                    delay = (delay * 2).min(self.reconnect_max_delay);
                }
            }
        }
    }
}

async fn supervise(
    inner: Arc<Inner>,
    mut stream: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
) {
    loop {
        pump(&inner, stream, outgoing).await;
        inner.on_disconnect();
        tracing::warn!(url = %inner.url, "bridge connection lost");

        match inner.redial().await {
            Some(next) => {
                stream = next;
                outgoing = inner.open_channel();
                tracing::info!(url = %inner.url, "bridge connection restored");
            }
            None => return,
        }
    }
}

/// Move frames in both directions until the socket or the outbound queue ends
async fn pump(
    inner: &Inner,
    stream: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
) {
    let (mut ws_tx, mut ws_rx) = stream.split();

    loop {
        tokio::select! {
            message = outgoing.recv() => {
                let Some(message) = message else { break };
                match serde_json::to_string(&message) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "failed to encode client frame"),
                }
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let text: String = text.to_string();
                    inner.handle_frame(&text);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = ws_tx.close().await;
}
