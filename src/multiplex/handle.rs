//! Handles handed out by the registry and by upstream providers

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::error::{with_retry, BridgeResult, RetryPolicy};
use crate::query::Fingerprint;

/// Change listener: receives `(old, new)` for every upstream mutation.
pub type ChangeCallback = Arc<dyn Fn(&Value, &Value) + Send + Sync>;

/// Identifies one attached callback inside a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub(crate) u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

type ReleaseFn = Box<dyn FnMut() -> BoxFuture<'static, BridgeResult<()>> + Send>;

/// Capability to release one upstream subscription.
///
/// The closure passed to [`UpstreamHandle::new`] is invoked once per release
/// attempt. Work done in the closure body happens synchronously when the
/// attempt is issued; the returned future only waits for its acknowledgement.
/// Releasing consumes the handle, and dropping it without releasing abandons
/// the upstream leg (used when the channel that carried it is gone).
pub struct UpstreamHandle {
    release: ReleaseFn,
}

impl UpstreamHandle {
    pub fn new<F, Fut>(mut release: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = BridgeResult<()>> + Send + 'static,
    {
        Self {
            release: Box::new(move || release().boxed()),
        }
    }

    /// Handle whose release does nothing
    pub fn noop() -> Self {
        Self::new(|| async { Ok(()) })
    }

    /// Issue the first release attempt now and retry failures in the background.
    pub(crate) fn release(self, fingerprint: &Fingerprint, policy: &RetryPolicy) {
        let mut release = self.release;
        let mut first = Some(release());

        let policy = policy.clone();
        let fp = fingerprint.clone();
        let teardown = async move {
            let outcome = with_retry(&policy, || match first.take() {
                Some(attempt) => attempt,
                None => release(),
            })
            .await;

            match outcome {
                Ok(()) => tracing::debug!(fingerprint = %fp, "upstream subscription released"),
                Err(err) => tracing::warn!(
                    fingerprint = %fp,
                    error = %err,
                    "giving up on upstream teardown"
                ),
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(teardown);
            }
            Err(_) => tracing::warn!(
                fingerprint = %fingerprint,
                "no runtime to finish upstream teardown; acknowledgement dropped"
            ),
        }
    }
}

impl fmt::Debug for UpstreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamHandle").finish_non_exhaustive()
    }
}

pub(crate) trait Detach: Send + Sync {
    fn detach(&self, fingerprint: &Fingerprint, registration: u64, callback: CallbackId);
}

/// One caller's attachment to a shared live query.
///
/// Detaching (explicitly or by dropping the handle) stops delivery to this
/// callback immediately; other callbacks on the same fingerprint are not
/// affected.
#[must_use = "dropping a Subscription detaches its callback"]
pub struct Subscription {
    registry: Weak<dyn Detach>,
    fingerprint: Fingerprint,
    registration: u64,
    callback: CallbackId,
}

impl Subscription {
    pub(crate) fn new(
        registry: Weak<dyn Detach>,
        fingerprint: Fingerprint,
        registration: u64,
        callback: CallbackId,
    ) -> Self {
        Self {
            registry,
            fingerprint,
            registration,
            callback,
        }
    }

    pub fn id(&self) -> CallbackId {
        self.callback
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Detach this callback
    pub fn detach(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(&self.fingerprint, self.registration, self.callback);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("fingerprint", &self.fingerprint)
            .field("callback", &self.callback)
            .finish()
    }
}
