//! Bridge Error Handling and Retry Logic
//!
//! Provides the error kinds surfaced by the bridge, their wire mapping, and the
//! bounded retry used for best-effort upstream teardown.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::protocol::ErrorCode;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while bridging database operations
///
/// Errors are `Clone` so a single establishment failure can be handed to every
/// caller that was waiting on the same upstream subscription.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// An optional capability was not wired on the serving side
    #[error("Missing capability: {0}")]
    MissingCapability(String),

    /// Method name outside the fixed operation set
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Query (or other argument) payload absent or unparseable
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The upstream subscribe call failed
    #[error("Upstream subscribe failed: {0}")]
    UpstreamSubscribeFailure(String),

    /// The storage engine rejected an operation
    #[error("Storage error: {0}")]
    Storage(String),

    /// The channel failed to carry a message or its reply
    #[error("Transport error: {0}")]
    Transport(String),

    /// The channel is currently down
    #[error("Transport disconnected")]
    Disconnected,

    /// An attempt did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The registry or adapter has been closed
    #[error("Bridge closed")]
    Closed,
}

impl BridgeError {
    /// Check if retrying the failed call can help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Storage(_) | BridgeError::Transport(_) | BridgeError::Timeout(_)
        )
    }

    /// Machine-readable code used on the wire
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::MissingCapability(_) => ErrorCode::MissingCapability,
            BridgeError::UnknownOperation(_) => ErrorCode::UnknownOperation,
            BridgeError::InvalidQuery(_) => ErrorCode::InvalidQuery,
            BridgeError::UpstreamSubscribeFailure(_) => ErrorCode::UpstreamSubscribeFailure,
            BridgeError::Storage(_) => ErrorCode::Storage,
            BridgeError::Transport(_) => ErrorCode::Transport,
            BridgeError::Disconnected => ErrorCode::Disconnected,
            BridgeError::Timeout(_) => ErrorCode::Timeout,
            BridgeError::Closed => ErrorCode::Closed,
        }
    }

    /// Message carried next to the code on the wire
    pub fn detail(&self) -> String {
        match self {
            BridgeError::MissingCapability(msg)
            | BridgeError::UnknownOperation(msg)
            | BridgeError::InvalidQuery(msg)
            | BridgeError::UpstreamSubscribeFailure(msg)
            | BridgeError::Storage(msg)
            | BridgeError::Transport(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error received from the remote side
    pub fn from_wire(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::MissingCapability => BridgeError::MissingCapability(message),
            ErrorCode::UnknownOperation => BridgeError::UnknownOperation(message),
            ErrorCode::InvalidQuery => BridgeError::InvalidQuery(message),
            ErrorCode::UpstreamSubscribeFailure => BridgeError::UpstreamSubscribeFailure(message),
            ErrorCode::Storage => BridgeError::Storage(message),
            ErrorCode::Disconnected => BridgeError::Disconnected,
            ErrorCode::Closed => BridgeError::Closed,
            // A remote timeout has no local duration; report it as a channel failure.
            ErrorCode::Transport | ErrorCode::Timeout => BridgeError::Transport(message),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Upper bound for a single attempt
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Policy for releasing upstream subscriptions: a few quick attempts, then give up
    pub fn teardown() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            attempt_timeout: Some(Duration::from_secs(1)),
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Execute an async operation with retry logic
///
/// Non-retryable errors are returned immediately; otherwise the last error is
/// returned once `max_attempts` is exhausted.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> BridgeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BridgeResult<T>>,
{
    let mut attempts = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempts += 1;

        let outcome = match policy.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, operation())
                .await
                .unwrap_or(Err(BridgeError::Timeout(limit))),
            None => operation().await,
        };

        match outcome {
            Ok(result) => return Ok(result),
            Err(err) => {
                if attempts >= policy.max_attempts || !err.is_retryable() {
                    return Err(err);
                }

                tracing::warn!(
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "attempt failed, retrying in {:?}",
                    delay
                );

                sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}
