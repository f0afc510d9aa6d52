//! Client side of the message channel
//!
//! A [`Transport`] carries operations to a [`Dispatcher`](crate::Dispatcher)
//! living elsewhere. Two implementations ship with the crate:
//!
//! - [`LocalTransport`]: in-process, straight into a dispatcher
//! - [`WsTransport`]: JSON over WebSocket against [`server::api`](crate::server::api)

mod local;
mod ws;

pub use local::LocalTransport;
pub use ws::WsTransport;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::BridgeResult;
use crate::multiplex::{ChangeCallback, Upstream, UpstreamHandle};
use crate::operation::Method;
use crate::query::Query;

/// An opaque request/response channel with a notification path
pub trait Transport: Send + Sync + 'static {
    /// Send `method(args)` to the remote side and wait for its reply
    fn invoke(&self, method: Method, args: Vec<Value>) -> BoxFuture<'_, BridgeResult<Value>>;

    /// Open a remote subscription; `on_change` receives every notification
    /// the remote side sends for it until the handle is released.
    fn subscribe(
        &self,
        query: Query,
        on_change: ChangeCallback,
    ) -> BoxFuture<'_, BridgeResult<UpstreamHandle>>;

    fn is_connected(&self) -> bool;

    /// Incremented every time the channel is (re)established. A change means
    /// the remote side lost every subscription opened before it, even if no
    /// disconnected state was ever observed.
    fn connection_epoch(&self) -> u64;
}

/// [`Upstream`] view of a transport, multiplexed by the adapter
pub struct TransportLeg<T> {
    transport: Arc<T>,
}

impl<T> TransportLeg<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

impl<T: Transport> Upstream for TransportLeg<T> {
    fn subscribe(
        &self,
        query: Query,
        on_change: ChangeCallback,
    ) -> BoxFuture<'static, BridgeResult<UpstreamHandle>> {
        let transport = self.transport.clone();
        Box::pin(async move { transport.subscribe(query, on_change).await })
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}
