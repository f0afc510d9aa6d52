//! Tracing subscriber setup for binaries and tests embedding the bridge

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a fmt subscriber filtered at `info` unless `RUST_LOG` says otherwise
pub fn init() {
    init_with_filter("dx_webdb=info");
}

/// Install a fmt subscriber with `default` as the fallback filter directive.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_with_filter(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
