use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use super::Transport;
use crate::error::{BridgeError, BridgeResult};
use crate::multiplex::{ChangeCallback, Subscription, UpstreamHandle};
use crate::operation::Method;
use crate::query::Query;
use crate::server::Dispatcher;
use crate::storage::Storage;

/// In-process channel into a [`Dispatcher`].
///
/// `disconnect()` behaves like a dropped connection: requests fail with
/// [`BridgeError::Disconnected`] and every subscription the dispatcher holds
/// for this channel is detached.
pub struct LocalTransport<S: Storage> {
    dispatcher: Arc<Dispatcher<S>>,
    connected: AtomicBool,
    epoch: AtomicU64,
    next_leg: AtomicU64,
    legs: Arc<Mutex<HashMap<u64, Subscription>>>,
}

impl<S: Storage> LocalTransport<S> {
    pub fn new(dispatcher: Arc<Dispatcher<S>>) -> Self {
        Self {
            dispatcher,
            connected: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
            next_leg: AtomicU64::new(0),
            legs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<S>> {
        &self.dispatcher
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let dropped: Vec<Subscription> = self.legs.lock().drain().map(|(_, leg)| leg).collect();
        tracing::debug!(legs = dropped.len(), "local transport disconnected");
        drop(dropped);
    }

    pub fn reconnect(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(epoch, "local transport reconnected");
    }

    /// Subscriptions currently held on the dispatcher side
    pub fn open_legs(&self) -> usize {
        self.legs.lock().len()
    }
}

impl<S: Storage> Transport for LocalTransport<S> {
    fn invoke(&self, method: Method, args: Vec<Value>) -> BoxFuture<'_, BridgeResult<Value>> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(BridgeError::Disconnected);
            }
            self.dispatcher.dispatch(method.as_str(), args).await
        })
    }

    fn subscribe(
        &self,
        query: Query,
        on_change: ChangeCallback,
    ) -> BoxFuture<'_, BridgeResult<UpstreamHandle>> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(BridgeError::Disconnected);
            }

            let subscription = self
                .dispatcher
                .subscribe(query, move |old: &Value, new: &Value| on_change(old, new))
                .await?;

            // The channel dropped while the dispatcher was subscribing.
            if !self.is_connected() {
                drop(subscription);
                return Err(BridgeError::Disconnected);
            }

            let id = self.next_leg.fetch_add(1, Ordering::SeqCst);
            self.legs.lock().insert(id, subscription);

            let legs = self.legs.clone();
            Ok(UpstreamHandle::new(move || {
                let removed = legs.lock().remove(&id);
                drop(removed);
                async { Ok(()) }
            }))
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}
