use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use super::Dispatcher;
use crate::multiplex::Subscription;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::query::Query;
use crate::storage::Storage;

/// Subscriptions opened by one WebSocket connection
#[derive(Default)]
struct Session {
    closed: bool,
    subscriptions: HashMap<u64, Subscription>,
    /// Subscribe requests still waiting on storage
    opening: HashSet<u64>,
    /// Ids unsubscribed while still in `opening`
    cancelled: HashSet<u64>,
}

impl Session {
    /// Drop `id` from the subscription and any pending one
    fn unsubscribe(&mut self, id: u64) -> Option<Subscription> {
        if self.opening.contains(&id) {
            self.cancelled.insert(id);
        }
        self.subscriptions.remove(&id)
    }

    /// Settle an opening id; false when the result must be thrown away
    fn finish_opening(&mut self, id: u64) -> bool {
        self.opening.remove(&id);
        let cancelled = self.cancelled.remove(&id);
        !self.closed && !cancelled
    }
}

pub fn router<S: Storage>(dispatcher: Arc<Dispatcher<S>>) -> Router {
    Router::new()
        .route("/", get(|| async { "DX WebDB Bridge" }))
        .route("/health", get(|| async { Json("OK") }))
        .route("/ws", get(ws_handler::<S>))
        .with_state(dispatcher)
}

/// Serve `dispatcher` on an already bound listener
pub async fn serve<S: Storage>(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher<S>>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "bridge server listening");

    axum::serve(listener, router(dispatcher))
        .await
        .context("bridge server stopped")?;

    Ok(())
}

pub async fn start<S: Storage>(port: u16, dispatcher: Arc<Dispatcher<S>>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    serve(listener, dispatcher).await
}

async fn ws_handler<S: Storage>(
    State(dispatcher): State<Arc<Dispatcher<S>>>,
    ws: WebSocketUpgrade,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(dispatcher, socket))
}

async fn handle_ws<S: Storage>(dispatcher: Arc<Dispatcher<S>>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(text) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    let session = Arc::new(Mutex::new(Session::default()));
    tracing::debug!("bridge session opened");

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let text: String = text.to_string();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Call { id, method, args }) => {
                        let dispatcher = dispatcher.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let reply = match dispatcher.dispatch(&method, args).await {
                                Ok(value) => ServerMessage::Result { id, value },
                                Err(err) => ServerMessage::error(id, &err),
                            };
                            let _ = tx.send(reply);
                        });
                    }
                    Ok(ClientMessage::Subscribe { id, query }) => {
                        session.lock().opening.insert(id);
                        tokio::spawn(open_subscription(
                            dispatcher.clone(),
                            session.clone(),
                            tx.clone(),
                            id,
                            query,
                        ));
                    }
                    Ok(ClientMessage::Unsubscribe { id, subscription }) => {
                        // Unknown ids are acknowledged too: the client may retry a release.
                        let removed = session.lock().unsubscribe(subscription);
                        drop(removed);
                        let _ = tx.send(ServerMessage::Result {
                            id,
                            value: Value::Null,
                        });
                    }
                    Ok(ClientMessage::Ping) => {
                        let _ = tx.send(ServerMessage::Pong);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping unparseable client frame");
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Binary(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
        }
    }

    let orphaned: Vec<Subscription> = {
        let mut session = session.lock();
        session.closed = true;
        session.subscriptions.drain().map(|(_, sub)| sub).collect()
    };
    tracing::debug!(released = orphaned.len(), "bridge session closed");
    drop(orphaned);

    send_task.abort();
}

async fn open_subscription<S: Storage>(
    dispatcher: Arc<Dispatcher<S>>,
    session: Arc<Mutex<Session>>,
    tx: mpsc::UnboundedSender<ServerMessage>,
    id: u64,
    query: Value,
) {
    let query = match Query::from_value(query) {
        Ok(query) => query,
        Err(err) => {
            session.lock().finish_opening(id);
            let _ = tx.send(ServerMessage::error(id, &err));
            return;
        }
    };

    let notify = tx.clone();
    let subscribed = dispatcher
        .subscribe(query, move |old: &Value, new: &Value| {
            let _ = notify.send(ServerMessage::Change {
                subscription: id,
                old: old.clone(),
                new: new.clone(),
            });
        })
        .await;

    match subscribed {
        Ok(subscription) => {
            let rejected = {
                let mut session = session.lock();
                if session.finish_opening(id) {
                    session.subscriptions.insert(id, subscription);
                    None
                } else {
                    Some(subscription)
                }
            };
            // Socket closed or client unsubscribed while storage was still working.
            if let Some(subscription) = rejected {
                tracing::debug!(id, "discarding subscription abandoned while opening");
                drop(subscription);
                return;
            }
            let _ = tx.send(ServerMessage::Result {
                id,
                value: Value::Null,
            });
        }
        Err(err) => {
            session.lock().finish_opening(id);
            let _ = tx.send(ServerMessage::error(id, &err));
        }
    }
}
