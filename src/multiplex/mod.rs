//! Shared-subscription registry
//!
//! Many local callbacks attach to one upstream subscription per query
//! fingerprint. The registry owns the retained query, the ordered callback set
//! and the upstream lifecycle of every fingerprint, and is used on both sides
//! of the bridge: against the channel in [`RemoteAdapter`](crate::RemoteAdapter)
//! and against the storage engine in [`Dispatcher`](crate::Dispatcher).
//!
//! ```text
//!  subscribe(q, cb) ──► entry for fp(q)?
//!                        ├─ none ────────► Establishing ──upstream ok──► Active
//!                        │                      │ └──upstream err──► discarded, waiters rejected
//!                        ├─ Establishing ► wait for the in-flight call
//!                        ├─ Active ──────► attach immediately
//!                        └─ Broken ──────► re-establish, then attach
//!
//!  last detach ─► entry removed, upstream handle released (once)
//! ```
//!
//! The registry lock is never held across an await, nor while invoking
//! callbacks or upstream calls.

mod handle;

pub use handle::{CallbackId, ChangeCallback, Subscription, UpstreamHandle};

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{BridgeError, BridgeResult, RetryPolicy};
use crate::query::{Fingerprint, Query};
use handle::Detach;

/// The capability being multiplexed: a live subscription source.
pub trait Upstream: Send + Sync + 'static {
    /// Open one upstream subscription delivering `(old, new)` to `on_change`.
    fn subscribe(
        &self,
        query: Query,
        on_change: ChangeCallback,
    ) -> BoxFuture<'static, BridgeResult<UpstreamHandle>>;

    /// Whether releasing a handle can reach the upstream side right now.
    fn is_connected(&self) -> bool {
        true
    }
}

/// Externally visible lifecycle of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Upstream subscribe call in flight
    Establishing,
    /// Upstream subscription live
    Active,
    /// Re-establishment failed; retried on the next recovery or new subscriber
    Broken,
}

/// Outcome of [`SubscriptionRegistry::resubscribe_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub failed: usize,
}

struct Waiter {
    callback: CallbackId,
    reply: oneshot::Sender<BridgeResult<()>>,
}

enum Lifecycle {
    Establishing { waiters: Vec<Waiter> },
    Active { handle: UpstreamHandle },
    Broken,
}

struct Registration {
    id: u64,
    query: Query,
    callbacks: Vec<(CallbackId, ChangeCallback)>,
    // Bumped whenever the upstream leg is recreated; stale legs stop delivering.
    leg: u64,
    lifecycle: Lifecycle,
}

impl Registration {
    fn state(&self) -> RegistrationState {
        match self.lifecycle {
            Lifecycle::Establishing { .. } => RegistrationState::Establishing,
            Lifecycle::Active { .. } => RegistrationState::Active,
            Lifecycle::Broken => RegistrationState::Broken,
        }
    }
}

struct RegistryState {
    open: bool,
    entries: HashMap<Fingerprint, Registration>,
    next_callback: u64,
    next_registration: u64,
}

/// One upstream subscribe attempt for a registration
struct Leg {
    fingerprint: Fingerprint,
    registration: u64,
    leg: u64,
    query: Query,
}

struct Shared<U> {
    upstream: U,
    teardown: RetryPolicy,
    state: Mutex<RegistryState>,
}

/// Reference-counted subscription registry keyed by query fingerprint
pub struct SubscriptionRegistry<U> {
    shared: Arc<Shared<U>>,
}

impl<U> Clone for SubscriptionRegistry<U> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<U: Upstream> SubscriptionRegistry<U> {
    /// Open a registry releasing upstream handles with [`RetryPolicy::teardown`]
    pub fn new(upstream: U) -> Self {
        Self::with_teardown_policy(upstream, RetryPolicy::teardown())
    }

    pub fn with_teardown_policy(upstream: U, teardown: RetryPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                upstream,
                teardown,
                state: Mutex::new(RegistryState {
                    open: true,
                    entries: HashMap::new(),
                    next_callback: 0,
                    next_registration: 0,
                }),
            }),
        }
    }

    pub fn upstream(&self) -> &U {
        &self.shared.upstream
    }

    /// Attach `callback` to the live query `query`.
    ///
    /// Resolves once the shared upstream subscription is active. Only the
    /// first subscriber of a fingerprint triggers an upstream call.
    pub async fn subscribe<F>(&self, query: Query, callback: F) -> BridgeResult<Subscription>
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.attach(query, Arc::new(callback)).await
    }

    pub async fn attach(
        &self,
        query: Query,
        callback: ChangeCallback,
    ) -> BridgeResult<Subscription> {
        let fingerprint = query.fingerprint();
        let detach: Weak<dyn Detach> = Arc::downgrade(&self.shared) as Weak<dyn Detach>;

        let (subscription, ready, establish) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if !state.open {
                return Err(BridgeError::Closed);
            }

            state.next_callback += 1;
            let callback_id = CallbackId(state.next_callback);
            let (reply, ready) = oneshot::channel();
            let waiter = Waiter {
                callback: callback_id,
                reply,
            };

            let mut establish = None;
            let registration = match state.entries.get_mut(&fingerprint) {
                Some(reg) => {
                    reg.callbacks.push((callback_id, callback));
                    match &mut reg.lifecycle {
                        Lifecycle::Establishing { waiters } => waiters.push(waiter),
                        Lifecycle::Active { .. } => {
                            let _ = waiter.reply.send(Ok(()));
                        }
                        Lifecycle::Broken => {
                            reg.leg += 1;
                            reg.lifecycle = Lifecycle::Establishing {
                                waiters: vec![waiter],
                            };
                            establish = Some(Leg {
                                fingerprint: fingerprint.clone(),
                                registration: reg.id,
                                leg: reg.leg,
                                query: reg.query.clone(),
                            });
                        }
                    }
                    reg.id
                }
                None => {
                    state.next_registration += 1;
                    let id = state.next_registration;
                    state.entries.insert(
                        fingerprint.clone(),
                        Registration {
                            id,
                            query: query.clone(),
                            callbacks: vec![(callback_id, callback)],
                            leg: 0,
                            lifecycle: Lifecycle::Establishing {
                                waiters: vec![waiter],
                            },
                        },
                    );
                    establish = Some(Leg {
                        fingerprint: fingerprint.clone(),
                        registration: id,
                        leg: 0,
                        query,
                    });
                    id
                }
            };

            (
                Subscription::new(detach, fingerprint, registration, callback_id),
                ready,
                establish,
            )
        };

        if let Some(leg) = establish {
            self.spawn_establish(leg);
        }

        match ready.await {
            Ok(Ok(())) => Ok(subscription),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(BridgeError::Closed),
        }
    }

    /// Re-issue the upstream subscribe for every fingerprint that still has a
    /// callback attached. Callbacks stay attached; only the upstream leg is
    /// recreated, and the superseded leg stops delivering.
    pub async fn resubscribe_all(&self) -> RecoveryReport {
        let mut stale = Vec::new();
        let legs: Vec<Leg> = {
            let mut guard = self.shared.state.lock();
            if !guard.open {
                return RecoveryReport::default();
            }

            let mut legs = Vec::new();
            for (fingerprint, reg) in guard.entries.iter_mut() {
                if reg.callbacks.is_empty() {
                    continue;
                }
                reg.leg += 1;
                let waiters = match std::mem::replace(&mut reg.lifecycle, Lifecycle::Broken) {
                    Lifecycle::Active { handle } => {
                        stale.push((fingerprint.clone(), handle));
                        Vec::new()
                    }
                    Lifecycle::Establishing { waiters } => waiters,
                    Lifecycle::Broken => Vec::new(),
                };
                reg.lifecycle = Lifecycle::Establishing { waiters };
                legs.push(Leg {
                    fingerprint: fingerprint.clone(),
                    registration: reg.id,
                    leg: reg.leg,
                    query: reg.query.clone(),
                });
            }
            legs
        };

        for (fingerprint, handle) in stale {
            self.shared.release(&fingerprint, handle);
        }

        if legs.is_empty() {
            return RecoveryReport::default();
        }

        tracing::info!(count = legs.len(), "re-establishing upstream subscriptions");

        let tasks: Vec<JoinHandle<bool>> =
            legs.into_iter().map(|leg| self.spawn_establish(leg)).collect();

        let mut report = RecoveryReport::default();
        for outcome in futures::future::join_all(tasks).await {
            match outcome {
                Ok(true) => report.recovered += 1,
                _ => report.failed += 1,
            }
        }
        report
    }

    /// Close the registry: release every upstream subscription and reject
    /// pending subscribers. Later subscribes fail with [`BridgeError::Closed`].
    pub fn close(&self) {
        let drained: Vec<(Fingerprint, Registration)> = {
            let mut state = self.shared.state.lock();
            state.open = false;
            state.entries.drain().collect()
        };

        for (fingerprint, reg) in drained {
            match reg.lifecycle {
                Lifecycle::Active { handle } => self.shared.release(&fingerprint, handle),
                Lifecycle::Establishing { waiters } => {
                    for waiter in waiters {
                        let _ = waiter.reply.send(Err(BridgeError::Closed));
                    }
                }
                Lifecycle::Broken => {}
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    /// Fingerprints that currently have a registration
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.shared.state.lock().entries.keys().cloned().collect()
    }

    pub fn state(&self, fingerprint: &Fingerprint) -> Option<RegistrationState> {
        self.shared
            .state
            .lock()
            .entries
            .get(fingerprint)
            .map(Registration::state)
    }

    pub fn callback_count(&self, fingerprint: &Fingerprint) -> usize {
        self.shared
            .state
            .lock()
            .entries
            .get(fingerprint)
            .map_or(0, |reg| reg.callbacks.len())
    }

    fn spawn_establish(&self, leg: Leg) -> JoinHandle<bool> {
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.establish(leg).await })
    }
}

impl<U: Upstream> Shared<U> {
    async fn establish(self: Arc<Self>, leg: Leg) -> bool {
        tracing::debug!(
            fingerprint = %leg.fingerprint,
            leg = leg.leg,
            "establishing upstream subscription"
        );

        let on_change = fan_out(
            Arc::downgrade(&self),
            leg.fingerprint.clone(),
            leg.registration,
            leg.leg,
        );
        let result = self.upstream.subscribe(leg.query.clone(), on_change).await;
        self.settle(&leg, result)
    }

    /// Apply the outcome of an upstream subscribe to its registration.
    fn settle(&self, leg: &Leg, result: BridgeResult<UpstreamHandle>) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let current = state.entries.get_mut(&leg.fingerprint).filter(|reg| {
            reg.id == leg.registration
                && reg.leg == leg.leg
                && matches!(reg.lifecycle, Lifecycle::Establishing { .. })
        });

        let Some(reg) = current else {
            drop(guard);
            // Torn down or superseded while the call was in flight.
            if let Ok(handle) = result {
                tracing::debug!(
                    fingerprint = %leg.fingerprint,
                    "registration gone before upstream resolved, releasing"
                );
                self.release(&leg.fingerprint, handle);
            }
            return false;
        };

        match result {
            Ok(handle) => {
                let waiters =
                    match std::mem::replace(&mut reg.lifecycle, Lifecycle::Active { handle }) {
                        Lifecycle::Establishing { waiters } => waiters,
                        _ => Vec::new(),
                    };
                drop(guard);

                tracing::debug!(fingerprint = %leg.fingerprint, "upstream subscription active");
                for waiter in waiters {
                    let _ = waiter.reply.send(Ok(()));
                }
                true
            }
            Err(err) => {
                let err = match err {
                    BridgeError::UpstreamSubscribeFailure(_) | BridgeError::Closed => err,
                    other => BridgeError::UpstreamSubscribeFailure(other.to_string()),
                };

                let waiters = match std::mem::replace(&mut reg.lifecycle, Lifecycle::Broken) {
                    Lifecycle::Establishing { waiters } => waiters,
                    _ => Vec::new(),
                };
                reg.callbacks
                    .retain(|(id, _)| !waiters.iter().any(|waiter| waiter.callback == *id));
                if reg.callbacks.is_empty() {
                    state.entries.remove(&leg.fingerprint);
                }
                drop(guard);

                tracing::warn!(
                    fingerprint = %leg.fingerprint,
                    error = %err,
                    "upstream subscribe failed"
                );
                for waiter in waiters {
                    let _ = waiter.reply.send(Err(err.clone()));
                }
                false
            }
        }
    }

    fn release(&self, fingerprint: &Fingerprint, handle: UpstreamHandle) {
        if !self.upstream.is_connected() {
            tracing::debug!(
                fingerprint = %fingerprint,
                "transport disconnected, dropping upstream handle without release"
            );
            return;
        }
        handle.release(fingerprint, &self.teardown);
    }
}

impl<U: Upstream> Detach for Shared<U> {
    fn detach(&self, fingerprint: &Fingerprint, registration: u64, callback: CallbackId) {
        let released = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(reg) = state.entries.get_mut(fingerprint) else {
                return;
            };
            if reg.id != registration {
                return;
            }

            let before = reg.callbacks.len();
            reg.callbacks.retain(|(id, _)| *id != callback);
            if reg.callbacks.len() == before {
                return;
            }
            if let Lifecycle::Establishing { waiters } = &mut reg.lifecycle {
                waiters.retain(|waiter| waiter.callback != callback);
            }
            if !reg.callbacks.is_empty() {
                return;
            }

            match state.entries.remove(fingerprint) {
                Some(Registration {
                    lifecycle: Lifecycle::Active { handle },
                    ..
                }) => Some(handle),
                _ => None,
            }
        };

        tracing::debug!(fingerprint = %fingerprint, "last subscriber detached");
        if let Some(handle) = released {
            self.release(fingerprint, handle);
        }
    }
}

/// Delivery closure for one upstream leg: snapshots the callbacks attached at
/// delivery time and invokes them in attach order.
fn fan_out<U: Upstream>(
    shared: Weak<Shared<U>>,
    fingerprint: Fingerprint,
    registration: u64,
    leg: u64,
) -> ChangeCallback {
    Arc::new(move |old: &Value, new: &Value| {
        let Some(shared) = shared.upgrade() else {
            return;
        };

        let targets: Vec<ChangeCallback> = {
            let state = shared.state.lock();
            match state.entries.get(&fingerprint) {
                Some(reg) if reg.id == registration && reg.leg == leg => {
                    reg.callbacks.iter().map(|(_, cb)| cb.clone()).collect()
                }
                _ => return,
            }
        };

        for callback in targets {
            callback(old, new);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Source {
        subscribes: AtomicUsize,
        releases: Arc<AtomicUsize>,
        fail: AtomicBool,
        listeners: PlMutex<Vec<ChangeCallback>>,
    }

    impl Upstream for Arc<Source> {
        fn subscribe(
            &self,
            _query: Query,
            on_change: ChangeCallback,
        ) -> BoxFuture<'static, BridgeResult<UpstreamHandle>> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail.load(Ordering::SeqCst);
            if !fail {
                self.listeners.lock().push(on_change);
            }
            let releases = self.releases.clone();
            Box::pin(async move {
                if fail {
                    return Err(BridgeError::Storage("boom".into()));
                }
                Ok(UpstreamHandle::new(move || {
                    releases.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                }))
            })
        }
    }

    impl Source {
        fn emit(&self, old: Value, new: Value) {
            let listeners: Vec<ChangeCallback> = self.listeners.lock().clone();
            for listener in listeners {
                listener(&old, &new);
            }
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Value, &Value) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        (hits, move |_: &Value, _: &Value| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_second_subscriber_shares_upstream() {
        let source = Arc::new(Source::default());
        let registry = SubscriptionRegistry::new(source.clone());
        let query = Query::table("users");

        let (first_hits, first) = counter();
        let (second_hits, second) = counter();
        let a = registry.subscribe(query.clone(), first).await.unwrap();
        let b = registry.subscribe(query.clone(), second).await.unwrap();

        assert_eq!(source.subscribes.load(Ordering::SeqCst), 1);
        assert_eq!(registry.callback_count(&query.fingerprint()), 2);
        assert_eq!(registry.state(&query.fingerprint()), Some(RegistrationState::Active));

        source.emit(json!(null), json!([1]));
        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);

        a.detach();
        assert_eq!(source.releases.load(Ordering::SeqCst), 0);
        b.detach();
        assert_eq!(source.releases.load(Ordering::SeqCst), 1);
        assert_eq!(registry.state(&query.fingerprint()), None);
    }

    #[tokio::test]
    async fn test_failed_establishment_discards_registration() {
        let source = Arc::new(Source::default());
        source.fail.store(true, Ordering::SeqCst);
        let registry = SubscriptionRegistry::new(source.clone());
        let query = Query::table("users");

        let (_, cb) = counter();
        let err = registry.subscribe(query.clone(), cb).await.unwrap_err();
        assert!(matches!(err, BridgeError::UpstreamSubscribeFailure(_)));
        assert!(registry.fingerprints().is_empty());

        source.fail.store(false, Ordering::SeqCst);
        let (_, cb) = counter();
        let _sub = registry.subscribe(query, cb).await.unwrap();
        assert_eq!(source.subscribes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_registry_rejects_subscribers() {
        let source = Arc::new(Source::default());
        let registry = SubscriptionRegistry::new(source.clone());

        let (_, cb) = counter();
        let sub = registry.subscribe(Query::table("users"), cb).await.unwrap();
        registry.close();
        assert_eq!(source.releases.load(Ordering::SeqCst), 1);
        assert!(!registry.is_open());

        // Detaching after close must not release a second time.
        drop(sub);
        assert_eq!(source.releases.load(Ordering::SeqCst), 1);

        let (_, cb) = counter();
        let err = registry.subscribe(Query::table("users"), cb).await.unwrap_err();
        assert_eq!(err, BridgeError::Closed);
    }
}
