#![allow(dead_code)]

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dx_webdb::{
    BridgeError, BridgeResult, ChangeCallback, Direction, Fingerprint, Item, Query, RetryPolicy,
    Storage, Upstream, UpstreamHandle,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;

pub fn reserve_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Teardown policy with millisecond delays
pub fn quick_teardown(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        max_delay: Duration::from_millis(20),
        attempt_timeout: Some(Duration::from_millis(200)),
    }
}

/// Collects every notification a callback receives
#[derive(Clone, Default)]
pub struct Inbox {
    seen: Arc<Mutex<Vec<(Value, Value)>>>,
}

impl Inbox {
    pub fn callback(&self) -> impl Fn(&Value, &Value) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |old: &Value, new: &Value| seen.lock().push((old.clone(), new.clone()))
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn last_new(&self) -> Option<Value> {
        self.seen.lock().last().map(|(_, new)| new.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    Subscribe(Query),
    Unsubscribe(Query),
}

/// In-memory storage engine that records its subscription traffic
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<HashMap<String, Vec<Item>>>,
    listeners: Arc<Mutex<HashMap<u64, (Query, ChangeCallback)>>>,
    events: Arc<Mutex<Vec<StorageEvent>>>,
    next_listener: AtomicU64,
    subscribe_delay_ms: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later `subscribe` take `delay` before it registers
    pub fn delay_subscribes(&self, delay: Duration) {
        self.subscribe_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<StorageEvent> {
        self.events.lock().clone()
    }

    pub fn subscribes(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, StorageEvent::Subscribe(_)))
            .count()
    }

    pub fn unsubscribes(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, StorageEvent::Unsubscribe(_)))
            .count()
    }

    pub fn live_listeners(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Apply `change` to `table` and notify every watcher whose result changed
    fn mutate(&self, table: &str, change: impl FnOnce(&mut Vec<Item>)) {
        let watchers: Vec<(Query, ChangeCallback)> = self
            .listeners
            .lock()
            .values()
            .filter(|(query, _)| query.table == table)
            .cloned()
            .collect();

        let diffs: Vec<(Vec<Item>, Vec<Item>)> = {
            let mut tables = self.tables.lock();
            let rows = tables.entry(table.to_string()).or_default();
            let before: Vec<Vec<Item>> = watchers.iter().map(|(q, _)| select(rows, q)).collect();
            change(rows);
            before
                .into_iter()
                .zip(watchers.iter().map(|(q, _)| select(rows, q)))
                .collect()
        };

        for ((_, on_change), (old, new)) in watchers.iter().zip(diffs) {
            if old != new {
                on_change(&Value::Array(old), &Value::Array(new));
            }
        }
    }

    fn rows(&self, query: &Query) -> Vec<Item> {
        let tables = self.tables.lock();
        tables
            .get(&query.table)
            .map(|rows| select(rows, query))
            .unwrap_or_default()
    }
}

impl Storage for MemoryStorage {
    fn count(&self, query: Query) -> BoxFuture<'_, BridgeResult<u64>> {
        Box::pin(async move { Ok(self.rows(&query).len() as u64) })
    }

    fn get(&self, query: Query) -> BoxFuture<'_, BridgeResult<Option<Item>>> {
        Box::pin(async move { Ok(self.rows(&query).into_iter().next()) })
    }

    fn create(&self, table: String, items: Vec<Item>) -> BoxFuture<'_, BridgeResult<()>> {
        Box::pin(async move {
            self.mutate(&table, |rows| rows.extend(items));
            Ok(())
        })
    }

    fn update(&self, table: String, items: Vec<Item>) -> BoxFuture<'_, BridgeResult<()>> {
        Box::pin(async move {
            self.mutate(&table, |rows| {
                for item in items {
                    match rows.iter_mut().find(|row| row.get("id") == item.get("id")) {
                        Some(row) => *row = item,
                        None => rows.push(item),
                    }
                }
            });
            Ok(())
        })
    }

    fn delete(&self, query: Query) -> BoxFuture<'_, BridgeResult<()>> {
        Box::pin(async move {
            let filter = query.filter.clone();
            self.mutate(&query.table, |rows| rows.retain(|row| !matches(row, &filter)));
            Ok(())
        })
    }

    fn find(&self, query: Query) -> BoxFuture<'_, BridgeResult<Vec<Item>>> {
        Box::pin(async move { Ok(self.rows(&query)) })
    }

    fn subscribe(
        &self,
        query: Query,
        on_change: ChangeCallback,
    ) -> BoxFuture<'_, BridgeResult<UpstreamHandle>> {
        Box::pin(async move {
            let delay = self.subscribe_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
            self.events.lock().push(StorageEvent::Subscribe(query.clone()));
            self.listeners.lock().insert(id, (query.clone(), on_change));

            let listeners = self.listeners.clone();
            let events = self.events.clone();
            Ok(UpstreamHandle::new(move || {
                if listeners.lock().remove(&id).is_some() {
                    events.lock().push(StorageEvent::Unsubscribe(query.clone()));
                }
                async { Ok(()) }
            }))
        })
    }
}

fn matches(row: &Item, filter: &Value) -> bool {
    match filter {
        Value::Object(fields) => fields.iter().all(|(key, value)| row.get(key) == Some(value)),
        _ => true,
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (a, b) => a.map(Value::to_string).cmp(&b.map(Value::to_string)),
    }
}

fn select(rows: &[Item], query: &Query) -> Vec<Item> {
    let mut selected: Vec<Item> = rows
        .iter()
        .filter(|row| matches(row, &query.filter))
        .cloned()
        .collect();

    selected.sort_by(|a, b| {
        for term in &query.order {
            let ordering = compare(a.get(&term.field), b.get(&term.field));
            let ordering = match term.direction {
                Direction::Asc => ordering,
                Direction::Desc => ordering.reverse(),
            };
            if ordering != CmpOrdering::Equal {
                return ordering;
            }
        }
        CmpOrdering::Equal
    });

    let offset = query.offset.unwrap_or(0) as usize;
    let limit = query.limit.map_or(usize::MAX, |limit| limit as usize);
    selected.into_iter().skip(offset).take(limit).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Subscribe(Fingerprint),
    Unsubscribe(Fingerprint),
}

struct Leg {
    fingerprint: Fingerprint,
    on_change: ChangeCallback,
    released: bool,
}

struct GateState {
    gated: AtomicBool,
    gate: Semaphore,
    connected: AtomicBool,
    fail_subscribes: AtomicUsize,
    fail_releases: AtomicUsize,
    release_attempts: AtomicUsize,
    events: Mutex<Vec<UpstreamEvent>>,
    legs: Mutex<Vec<Leg>>,
}

/// Upstream whose subscribe calls can be held open and made to fail
#[derive(Clone)]
pub struct GatedUpstream {
    state: Arc<GateState>,
}

impl GatedUpstream {
    pub fn new() -> Self {
        Self {
            state: Arc::new(GateState {
                gated: AtomicBool::new(false),
                gate: Semaphore::new(0),
                connected: AtomicBool::new(true),
                fail_subscribes: AtomicUsize::new(0),
                fail_releases: AtomicUsize::new(0),
                release_attempts: AtomicUsize::new(0),
                events: Mutex::new(Vec::new()),
                legs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Hold every subscribe call until [`GatedUpstream::open_gate`]
    pub fn gated() -> Self {
        let upstream = Self::new();
        upstream.state.gated.store(true, Ordering::SeqCst);
        upstream
    }

    pub fn open_gate(&self, calls: usize) {
        self.state.gate.add_permits(calls);
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_next_subscribes(&self, count: usize) {
        self.state.fail_subscribes.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_releases(&self, count: usize) {
        self.state.fail_releases.store(count, Ordering::SeqCst);
    }

    pub fn release_attempts(&self) -> usize {
        self.state.release_attempts.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<UpstreamEvent> {
        self.state.events.lock().clone()
    }

    pub fn subscribes(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, UpstreamEvent::Subscribe(_)))
            .count()
    }

    pub fn unsubscribes(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, UpstreamEvent::Unsubscribe(_)))
            .count()
    }

    /// Deliver a change through every unreleased leg for `fingerprint`
    pub fn emit(&self, fingerprint: &Fingerprint, old: Value, new: Value) {
        self.deliver(fingerprint, old, new, false);
    }

    /// Deliver through released legs too, as a late frame from an old connection would
    pub fn emit_including_stale(&self, fingerprint: &Fingerprint, old: Value, new: Value) {
        self.deliver(fingerprint, old, new, true);
    }

    fn deliver(&self, fingerprint: &Fingerprint, old: Value, new: Value, stale: bool) {
        let targets: Vec<ChangeCallback> = self
            .state
            .legs
            .lock()
            .iter()
            .filter(|leg| &leg.fingerprint == fingerprint && (stale || !leg.released))
            .map(|leg| leg.on_change.clone())
            .collect();
        for on_change in targets {
            on_change(&old, &new);
        }
    }
}

impl Upstream for GatedUpstream {
    fn subscribe(
        &self,
        query: Query,
        on_change: ChangeCallback,
    ) -> BoxFuture<'static, BridgeResult<UpstreamHandle>> {
        let state = self.state.clone();
        let fingerprint = query.fingerprint();
        state
            .events
            .lock()
            .push(UpstreamEvent::Subscribe(fingerprint.clone()));

        Box::pin(async move {
            if state.gated.load(Ordering::SeqCst) {
                let permit = state
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| BridgeError::Closed)?;
                permit.forget();
            }

            let failing = state
                .fail_subscribes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BridgeError::Storage("subscribe rejected".into()));
            }

            let index = {
                let mut legs = state.legs.lock();
                legs.push(Leg {
                    fingerprint: fingerprint.clone(),
                    on_change,
                    released: false,
                });
                legs.len() - 1
            };

            Ok(UpstreamHandle::new(move || {
                let state = state.clone();
                state.release_attempts.fetch_add(1, Ordering::SeqCst);
                let failing = state
                    .fail_releases
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if !failing {
                    state.legs.lock()[index].released = true;
                    state
                        .events
                        .lock()
                        .push(UpstreamEvent::Unsubscribe(fingerprint.clone()));
                }
                async move {
                    if failing {
                        Err(BridgeError::Transport("unsubscribe lost".into()))
                    } else {
                        Ok(())
                    }
                }
            }))
        })
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}
