//! # Broker Proxy
//!
//! > **A stable HTTP API in front of a message broker cluster.**
//!
//! Clients produce and consume messages over a unix socket (and optionally
//! TCP) instead of speaking the broker protocol themselves. The proxy owns the
//! broker and coordination-service clients, so clients never see broker
//! failover, topology changes or consumer group rebalancing.
//!
//! ## 🏗️ Design Philosophy
//!
//! The hard part is not serving requests but starting and stopping the
//! process correctly:
//! - **Dependency order**: backends start before the listeners that use them,
//!   and a failed start leaves nothing running.
//! - **No abandoned requests**: listeners stop accepting first, in-flight
//!   requests drain, and backend clients are torn down last.
//! - **One authority**: a crashing listener is not restarted in isolation;
//!   the whole service shuts down in the same order as on a stop request.
//!
//! ## 🚀 Core Concepts
//!
//! ### Completion channels
//! Every listener owns an `mpsc` channel. Values are failed requests, and the
//! channel closing means "fully stopped". Closing happens when the last sender
//! clone is dropped, so it happens once and only after the last request. See
//! [`framework`].
//!
//! ### Actors
//! The producer and consumer are actors: a cloneable handle sends requests
//! over `mpsc` and awaits a `oneshot` reply, while one task owns all mutable
//! state. See [`producer`] and [`consumer`].
//!
//! ### Mocking
//! [`framework::mock`] provides journaled fakes of every lifecycle contract,
//! so the orchestrator is tested without sockets or a cluster.
//!
//! ## 🗺️ Module Tour
//!
//! ### 1. The Orchestrator ([`lifecycle`])
//! [`lifecycle::Service`] spawns, supervises and stops everything.
//! [`lifecycle::Proxy`] wires the real subsystems.
//!
//! ### 2. The Contracts ([`framework`])
//! `Backend`, `Listener`, `Subsystems`, the completion channel and
//! `StopHandle`.
//!
//! ### 3. The Subsystems
//! - [`producer`]: batching, partitioning and retrying writes.
//! - [`consumer`]: long-polling reads with committed group offsets.
//! - [`admin`]: group offset inspection and reset.
//! - [`api`]: the HTTP API listener.
//!
//! ### 4. The Foundation
//! - [`config`]: configuration model and client-config translation.
//! - [`identity`]: process-unique client id.
//! - [`cluster`]: broker and coordination-service client contracts.
//! - [`error`]: crate-wide error type.

pub mod admin;
pub mod api;
pub mod cluster;
pub mod config;
pub mod consumer;
pub mod error;
pub mod framework;
pub mod identity;
pub mod lifecycle;
pub mod producer;

pub use config::Config;
pub use error::{Error, Result};
pub use lifecycle::Service;
