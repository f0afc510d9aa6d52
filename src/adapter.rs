//! Local Multiplexer: the client-side database handle
//!
//! [`RemoteAdapter`] forwards every operation over a [`Transport`] and
//! multiplexes live queries so that at most one remote subscription exists per
//! query fingerprint. After [`RemoteAdapter::open`], a monitor task watches the
//! transport's connection epoch and re-establishes every live fingerprint
//! whenever a new connection has been made, however short the outage was.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::multiplex::{RecoveryReport, Subscription, SubscriptionRegistry};
use crate::operation::Call;
use crate::query::{Item, Query};
use crate::transport::{Transport, TransportLeg};

pub struct RemoteAdapter<T: Transport> {
    transport: Arc<T>,
    registry: SubscriptionRegistry<TransportLeg<T>>,
    poll: Duration,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> RemoteAdapter<T> {
    pub fn new(transport: Arc<T>, config: &BridgeConfig) -> Self {
        let registry = SubscriptionRegistry::with_teardown_policy(
            TransportLeg::new(transport.clone()),
            config.teardown_policy(),
        );
        Self {
            transport,
            registry,
            poll: config.connection_poll(),
            monitor: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn registry(&self) -> &SubscriptionRegistry<TransportLeg<T>> {
        &self.registry
    }

    /// Start watching the transport for reconnects. Idempotent.
    pub fn open(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let transport = self.transport.clone();
        let registry = self.registry.clone();
        let poll = self.poll;
        *monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            let mut was_connected = transport.is_connected();
            let mut seen_epoch = transport.connection_epoch();

            loop {
                ticker.tick().await;
                if !registry.is_open() {
                    break;
                }

                let connected = transport.is_connected();
                let epoch = transport.connection_epoch();
                if connected && epoch != seen_epoch {
                    seen_epoch = epoch;
                    tracing::info!(epoch, "transport reconnected, recovering subscriptions");
                    let report = registry.resubscribe_all().await;
                    if report.failed > 0 {
                        tracing::warn!(
                            recovered = report.recovered,
                            failed = report.failed,
                            "some subscriptions could not be re-established"
                        );
                    }
                } else if !connected && was_connected {
                    tracing::warn!("transport disconnected");
                }
                was_connected = connected;
            }
        }));
    }

    /// Re-establish every live fingerprint now
    pub async fn recover(&self) -> RecoveryReport {
        self.registry.resubscribe_all().await
    }

    /// Stop the monitor and release every remote subscription
    pub fn close(&self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        self.registry.close();
    }

    pub fn is_open(&self) -> bool {
        self.registry.is_open()
    }

    pub async fn count(&self, query: Query) -> BridgeResult<u64> {
        query.validate()?;
        self.call(Call::Count(query)).await
    }

    pub async fn get(&self, query: Query) -> BridgeResult<Option<Item>> {
        query.validate()?;
        self.call(Call::Get(query)).await
    }

    pub async fn create(&self, table: impl Into<String>, items: Vec<Item>) -> BridgeResult<()> {
        self.call(Call::Create {
            table: table.into(),
            items,
        })
        .await
    }

    pub async fn update(&self, table: impl Into<String>, items: Vec<Item>) -> BridgeResult<()> {
        self.call(Call::Update {
            table: table.into(),
            items,
        })
        .await
    }

    pub async fn delete(&self, query: Query) -> BridgeResult<()> {
        query.validate()?;
        self.call(Call::Delete(query)).await
    }

    pub async fn index(
        &self,
        table: impl Into<String>,
        index: impl Into<String>,
        keys: Option<Vec<String>>,
    ) -> BridgeResult<()> {
        self.call(Call::Index {
            table: table.into(),
            index: index.into(),
            keys,
        })
        .await
    }

    pub async fn find(&self, query: Query) -> BridgeResult<Vec<Item>> {
        query.validate()?;
        self.call(Call::Find(query)).await
    }

    /// Attach `callback` to the live query `query`.
    ///
    /// `callback(old, new)` runs for every change the remote side reports.
    /// Only the first local subscriber of a fingerprint opens a remote
    /// subscription; the returned handle detaches this callback alone.
    pub async fn subscribe<F>(&self, query: Query, callback: F) -> BridgeResult<Subscription>
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        query.validate()?;
        self.registry.subscribe(query, callback).await
    }

    async fn call<R: DeserializeOwned>(&self, call: Call) -> BridgeResult<R> {
        if !self.registry.is_open() {
            return Err(BridgeError::Closed);
        }

        let method = call.method();
        let reply = self.transport.invoke(method, call.into_args()).await?;
        serde_json::from_value(reply)
            .map_err(|err| BridgeError::Transport(format!("malformed {method} reply: {err}")))
    }
}

impl<T: Transport> Drop for RemoteAdapter<T> {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
    }
}
