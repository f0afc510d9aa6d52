//! # DX WebDB - Remote Database Bridge
//!
//! Issue database operations against a database manager living in another
//! process, over nothing but an opaque message channel.
//!
//! ## Features
//!
//! - **Shared live queries**: any number of local subscribers of the same query
//!   share one upstream subscription, keyed by a SHA-256 fingerprint of the
//!   query's canonical JSON
//! - **Correct teardown**: the upstream subscription is released exactly when
//!   the last subscriber detaches, with bounded best-effort retries
//! - **Reconnect recovery**: live fingerprints are re-established on the new
//!   connection without duplicate delivery
//! - **Scoped serving**: the [`Dispatcher`] can rewrite every incoming query
//!   (e.g. to inject authorization constraints) before storage sees it
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dx_webdb::{BridgeConfig, Query, RemoteAdapter, WsTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::from_env()?;
//!     let transport = WsTransport::connect("ws://127.0.0.1:3000/ws", &config).await?;
//!     let db = RemoteAdapter::new(Arc::new(transport), &config);
//!     db.open();
//!
//!     let users = Query::table("users");
//!     let _live = db
//!         .subscribe(users.clone(), |_old, new| println!("users changed: {new}"))
//!         .await?;
//!
//!     println!("{} users", db.count(users).await?);
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod logging;
pub mod multiplex;
pub mod operation;
pub mod protocol;
pub mod query;
pub mod server;
pub mod storage;
pub mod transport;

// Re-export main types for library consumers
pub use adapter::RemoteAdapter;
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult, RetryPolicy};
pub use multiplex::{
    CallbackId, ChangeCallback, RecoveryReport, RegistrationState, Subscription,
    SubscriptionRegistry, Upstream, UpstreamHandle,
};
pub use operation::{Call, Method};
pub use query::{fingerprint, Direction, Fingerprint, Item, Order, Query};
pub use server::{Dispatcher, ScopeFn};
pub use storage::Storage;
pub use transport::{LocalTransport, Transport, WsTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
