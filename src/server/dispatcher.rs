//! Remote Dispatcher: serves forwarded operations against a [`Storage`]
//!
//! Subscriptions are multiplexed against the storage engine so concurrently
//! arriving remote subscribers of the same (scoped) query share one real
//! storage subscription.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::{BridgeError, BridgeResult, RetryPolicy};
use crate::multiplex::{Subscription, SubscriptionRegistry};
use crate::operation::Call;
use crate::query::{Item, Query};
use crate::storage::{Storage, StorageLeg};

/// Query-rewriting hook applied to every incoming query before it reaches storage
pub type ScopeFn = Arc<dyn Fn(Query) -> Query + Send + Sync>;

/// Server side of the bridge
pub struct Dispatcher<S: Storage> {
    storage: Arc<S>,
    scope: Option<ScopeFn>,
    registry: SubscriptionRegistry<StorageLeg<S>>,
}

impl<S: Storage> Dispatcher<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_teardown_policy(storage, RetryPolicy::teardown())
    }

    pub fn with_teardown_policy(storage: Arc<S>, teardown: RetryPolicy) -> Self {
        let registry =
            SubscriptionRegistry::with_teardown_policy(StorageLeg::new(storage.clone()), teardown);
        Self {
            storage,
            scope: None,
            registry,
        }
    }

    /// Install the scope hook, e.g. to inject authorization constraints
    pub fn with_scope<F>(mut self, scope: F) -> Self
    where
        F: Fn(Query) -> Query + Send + Sync + 'static,
    {
        self.scope = Some(Arc::new(scope));
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn registry(&self) -> &SubscriptionRegistry<StorageLeg<S>> {
        &self.registry
    }

    /// Query as storage will see it
    pub fn scoped(&self, query: Query) -> Query {
        match &self.scope {
            Some(scope) => scope(query),
            None => query,
        }
    }

    pub async fn count(&self, query: Query) -> BridgeResult<u64> {
        self.storage.count(self.scoped(query)).await
    }

    pub async fn get(&self, query: Query) -> BridgeResult<Option<Item>> {
        self.storage.get(self.scoped(query)).await
    }

    pub async fn create(&self, table: String, items: Vec<Item>) -> BridgeResult<()> {
        self.storage.create(table, items).await
    }

    pub async fn update(&self, table: String, items: Vec<Item>) -> BridgeResult<()> {
        self.storage.update(table, items).await
    }

    pub async fn delete(&self, query: Query) -> BridgeResult<()> {
        self.storage.delete(self.scoped(query)).await
    }

    pub async fn index(
        &self,
        table: String,
        index: String,
        keys: Option<Vec<String>>,
    ) -> BridgeResult<()> {
        self.storage.index(table, index, keys).await
    }

    pub async fn find(&self, query: Query) -> BridgeResult<Vec<Item>> {
        self.storage.find(self.scoped(query)).await
    }

    /// Attach `callback` to the storage subscription for the scoped `query`
    pub async fn subscribe<F>(&self, query: Query, callback: F) -> BridgeResult<Subscription>
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        let query = self.scoped(query);
        self.registry.subscribe(query, callback).await
    }

    /// Execute a request/response operation received over the channel.
    ///
    /// `subscribe` needs a notification path back to the caller and is served
    /// by [`Dispatcher::subscribe`] instead.
    pub async fn dispatch(&self, method: &str, args: Vec<Value>) -> BridgeResult<Value> {
        match Call::parse(method, args)? {
            Call::Count(query) => reply(self.count(query).await?),
            Call::Get(query) => reply(self.get(query).await?),
            Call::Create { table, items } => reply(self.create(table, items).await?),
            Call::Update { table, items } => reply(self.update(table, items).await?),
            Call::Delete(query) => reply(self.delete(query).await?),
            Call::Index { table, index, keys } => reply(self.index(table, index, keys).await?),
            Call::Find(query) => reply(self.find(query).await?),
            Call::Subscribe(_) => Err(BridgeError::UnknownOperation(
                "subscribe is not a request/response operation".into(),
            )),
        }
    }

    /// Release every storage subscription held by this dispatcher
    pub fn close(&self) {
        tracing::debug!("closing dispatcher");
        self.registry.close();
    }
}

fn reply<T: Serialize>(value: T) -> BridgeResult<Value> {
    serde_json::to_value(value).map_err(|err| BridgeError::Storage(err.to_string()))
}
