//! Capability set of the real database manager
//!
//! The bridge never executes queries itself; the serving side wires an
//! implementation of [`Storage`] into a [`Dispatcher`](crate::Dispatcher).
//! The trait uses manual `BoxFuture` returns instead of `async_trait`.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{BridgeError, BridgeResult};
use crate::multiplex::{ChangeCallback, Upstream, UpstreamHandle};
use crate::query::{Item, Query};

/// Operations a database manager exposes to the bridge
pub trait Storage: Send + Sync + 'static {
    /// Number of items matching `query`
    fn count(&self, query: Query) -> BoxFuture<'_, BridgeResult<u64>>;

    /// First item matching `query`, if any
    fn get(&self, query: Query) -> BoxFuture<'_, BridgeResult<Option<Item>>>;

    fn create(&self, table: String, items: Vec<Item>) -> BoxFuture<'_, BridgeResult<()>>;

    fn update(&self, table: String, items: Vec<Item>) -> BoxFuture<'_, BridgeResult<()>>;

    /// Delete every item matching `query`
    fn delete(&self, query: Query) -> BoxFuture<'_, BridgeResult<()>>;

    /// Create an index over `keys` of `table`.
    ///
    /// Optional: engines without secondary indexes keep the default, which
    /// fails with [`BridgeError::MissingCapability`].
    fn index(
        &self,
        table: String,
        index: String,
        keys: Option<Vec<String>>,
    ) -> BoxFuture<'_, BridgeResult<()>> {
        let _ = (table, keys);
        Box::pin(async move { Err(BridgeError::MissingCapability(format!("index {index}"))) })
    }

    /// Items matching `query`, in query order
    fn find(&self, query: Query) -> BoxFuture<'_, BridgeResult<Vec<Item>>>;

    /// Watch the result of `query`; `on_change(old, new)` fires on every
    /// mutation that changes it. The returned handle stops the watch.
    fn subscribe(
        &self,
        query: Query,
        on_change: ChangeCallback,
    ) -> BoxFuture<'_, BridgeResult<UpstreamHandle>>;
}

/// [`Upstream`] view of a storage engine, multiplexed by the dispatcher
pub struct StorageLeg<S> {
    storage: Arc<S>,
}

impl<S> StorageLeg<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

impl<S: Storage> Upstream for StorageLeg<S> {
    fn subscribe(
        &self,
        query: Query,
        on_change: ChangeCallback,
    ) -> BoxFuture<'static, BridgeResult<UpstreamHandle>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscribe(query, on_change).await })
    }
}
