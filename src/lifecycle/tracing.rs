//! # Logging
//!
//! [`setup_tracing`] installs a compact `tracing-subscriber` formatter whose
//! level is taken from `RUST_LOG` (`info` when unset). Module paths are
//! hidden; events carry structured fields instead.
//!
//! ```bash
//! RUST_LOG=info broker-proxy --unix-addr /tmp/proxy.sock
//! RUST_LOG=debug broker-proxy ...           # per-message producer/consumer events
//! RUST_LOG=broker_proxy::api=debug ...      # one module only
//! ```
//!
//! The supervising task runs in a `supervisor` span and API handlers in a
//! span named after the handler, so a shutdown reads like:
//!
//! ```text
//! INFO supervisor: Stop requested
//! INFO supervisor: HTTP API stopped network=unix addr="/tmp/proxy.sock"
//! WARN supervisor: Request failed while draining network=tcp error=...
//! INFO supervisor: Listener drained network=unix failed=0
//! INFO supervisor: Backend stopped backend="producer"
//! INFO supervisor: Service stopped
//! ```

use tracing_subscriber::EnvFilter;

pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
