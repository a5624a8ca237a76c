//! # Mock Subsystems
//!
//! In-memory fakes of every lifecycle contract, for exercising the
//! orchestrator without a cluster or sockets.
//!
//! Every fake writes what happens to it into a shared [`Journal`], so tests
//! can assert on ordering:
//!
//! ```text
//! spawned producer      Subsystems::spawn_producer succeeded
//! bound unix            Subsystems::new_listener succeeded
//! started unix          Listener::start
//! quiesce unix          Listener::async_stop
//! drain error 0 unix    a drain failure was delivered to the completion channel
//! drained unix          the listener is about to close its completion channel
//! stopped producer      Backend::stop finished
//! ```
//!
//! Use [`MockSubsystems`] to configure failures, drain errors and crashes.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::cluster::ClusterError;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::framework::{
    completion_channel, Backend, Backends, CompletionReceiver, CompletionSender, Listener,
    ListenerError, Network, Subsystems,
};

// =============================================================================
// JOURNAL
// =============================================================================

/// Ordered record of lifecycle events, shared by all fakes.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.lock().iter().position(|e| e == entry)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// =============================================================================
// BACKEND
// =============================================================================

/// Backend that journals its stop, optionally after a delay.
#[derive(Debug, Clone)]
pub struct MockBackend {
    name: &'static str,
    journal: Journal,
    stop_delay: Duration,
}

impl MockBackend {
    pub fn new(name: &'static str, journal: Journal) -> Self {
        Self {
            name,
            journal,
            stop_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn stop(&self) {
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.journal.record(format!("stopped {}", self.name));
    }
}

// =============================================================================
// LISTENER
// =============================================================================

/// How a listener misbehaves on its own after being started.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Reports [`ListenerError::Crashed`] after the delay.
    Crash(Duration),
    /// Closes its completion channel after the delay, as if it had stopped.
    Vanish(Duration),
}

/// Listener that follows the completion-channel protocol without any socket.
pub struct MockListener {
    network: Network,
    journal: Journal,
    drain_errors: usize,
    fault: Option<Fault>,
    sender: Option<CompletionSender>,
    completion: CompletionReceiver,
}

impl MockListener {
    pub fn new(network: Network, journal: Journal) -> Self {
        // A single slot makes every drain report wait for the supervisor.
        let (sender, completion) = completion_channel(1);
        Self {
            network,
            journal,
            drain_errors: 0,
            fault: None,
            sender: Some(sender),
            completion,
        }
    }

    /// Number of in-flight requests that fail while draining.
    pub fn with_drain_errors(mut self, count: usize) -> Self {
        self.drain_errors = count;
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }
}

impl Listener for MockListener {
    fn network(&self) -> Network {
        self.network
    }

    fn start(&mut self) {
        let network = self.network;
        self.journal.record(format!("started {network}"));
        match self.fault {
            Some(Fault::Crash(delay)) => {
                let Some(sender) = self.sender.clone() else { return };
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let reason = "accept loop failed".to_string();
                    let _ = sender.send(ListenerError::Crashed { network, reason }).await;
                });
            }
            Some(Fault::Vanish(delay)) => {
                let sender = self.sender.take();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    drop(sender);
                });
            }
            None => {}
        }
    }

    fn async_stop(&mut self) {
        let network = self.network;
        self.journal.record(format!("quiesce {network}"));
        let Some(sender) = self.sender.take() else {
            return;
        };
        let journal = self.journal.clone();
        let drain_errors = self.drain_errors;
        tokio::spawn(async move {
            for i in 0..drain_errors {
                let failure = ListenerError::Drain {
                    network,
                    request: format!("request-{i}"),
                    reason: "backend unavailable".to_string(),
                };
                if sender.send(failure).await.is_ok() {
                    journal.record(format!("drain error {i} {network}"));
                }
            }
            journal.record(format!("drained {network}"));
        });
    }

    fn completion(&mut self) -> &mut CompletionReceiver {
        &mut self.completion
    }
}

// =============================================================================
// SUBSYSTEMS
// =============================================================================

/// Construction stage, in the order the orchestrator runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Producer,
    Consumer,
    Admin,
    UnixListener,
    TcpListener,
}

/// Factory of journaled fakes with configurable misbehavior.
#[derive(Debug, Clone, Default)]
pub struct MockSubsystems {
    journal: Journal,
    fail_at: Option<Stage>,
    drain_errors: HashMap<Network, usize>,
    faults: HashMap<Network, Fault>,
    backend_stop_delay: Duration,
}

impl MockSubsystems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Makes construction fail at `stage`.
    pub fn fail_at(mut self, stage: Stage) -> Self {
        self.fail_at = Some(stage);
        self
    }

    pub fn drain_errors(mut self, network: Network, count: usize) -> Self {
        self.drain_errors.insert(network, count);
        self
    }

    pub fn fault(mut self, network: Network, fault: Fault) -> Self {
        self.faults.insert(network, fault);
        self
    }

    pub fn backend_stop_delay(mut self, delay: Duration) -> Self {
        self.backend_stop_delay = delay;
        self
    }

    fn backend(&self, stage: Stage, name: &'static str) -> Result<MockBackend> {
        if self.fail_at == Some(stage) {
            return Err(Error::Cluster(ClusterError::Unreachable(format!(
                "injected {name} failure"
            ))));
        }
        self.journal.record(format!("spawned {name}"));
        Ok(MockBackend {
            stop_delay: self.backend_stop_delay,
            ..MockBackend::new(name, self.journal.clone())
        })
    }
}

#[async_trait]
impl Subsystems for MockSubsystems {
    type Producer = MockBackend;
    type Consumer = MockBackend;
    type Admin = MockBackend;
    type Listener = MockListener;

    async fn spawn_producer(&self, _config: &Config) -> Result<MockBackend> {
        self.backend(Stage::Producer, "producer")
    }

    async fn spawn_consumer(&self, _config: &Config) -> Result<MockBackend> {
        self.backend(Stage::Consumer, "consumer")
    }

    async fn spawn_admin(&self, _config: &Config) -> Result<MockBackend> {
        self.backend(Stage::Admin, "admin")
    }

    async fn new_listener(
        &self,
        network: Network,
        addr: &str,
        _config: &Config,
        _backends: Backends<MockBackend, MockBackend, MockBackend>,
    ) -> Result<MockListener> {
        let stage = match network {
            Network::Unix => Stage::UnixListener,
            Network::Tcp => Stage::TcpListener,
        };
        if self.fail_at == Some(stage) {
            return Err(Error::Bind {
                network,
                addr: addr.to_string(),
                source: io::Error::new(io::ErrorKind::AddrInUse, "injected bind failure"),
            });
        }
        self.journal.record(format!("bound {network}"));
        let mut listener = MockListener::new(network, self.journal.clone())
            .with_drain_errors(self.drain_errors.get(&network).copied().unwrap_or(0));
        if let Some(fault) = self.faults.get(&network) {
            listener = listener.with_fault(*fault);
        }
        Ok(listener)
    }
}
