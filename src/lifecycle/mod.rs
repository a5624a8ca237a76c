//! Process lifecycle: the [`Service`] orchestrator, its production wiring,
//! logging setup and termination signals.

pub mod proxy;
pub mod service;
pub mod signals;
pub mod tracing;

pub use proxy::Proxy;
pub use service::Service;
pub use signals::wait_for_shutdown_signal;
pub use self::tracing::setup_tracing;
