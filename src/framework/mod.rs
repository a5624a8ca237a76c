//! # Lifecycle contracts
//!
//! The orchestrator in [`crate::lifecycle`] never looks inside the subsystems
//! it runs. It only relies on the contracts defined here:
//!
//! - [`Backend`]: a running producer, consumer or admin. Stopping blocks until
//!   the subsystem is fully down and is safe to run next to the other
//!   backends' stops.
//! - [`Listener`]: an API server with an asynchronous stop protocol. Its
//!   [completion channel](completion_channel) reports failed requests and is
//!   closed once, after the last in-flight request finished.
//! - [`Subsystems`]: the factory that constructs all of the above, so the
//!   orchestrator can be driven by real subsystems or by [`mock`] ones.
//!
//! # Completion channel
//!
//! ```text
//!  listener serve task ──┐
//!  request task #1 ──────┼── CompletionSender clones ──► CompletionReceiver (supervisor)
//!  request task #N ──────┘
//!
//!  recv() == Some(err)  a request failed (or the listener crashed)
//!  recv() == None       every sender is gone: the listener is fully stopped
//! ```
//!
//! Closing is done by dropping senders rather than by an explicit call, which
//! makes a double close or a send after close unrepresentable.

pub mod mock;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::Config;
use crate::error::Result;

/// Transport an API listener serves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Unix,
    Tcp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Unix => f.write_str("unix"),
            Network::Tcp => f.write_str("tcp"),
        }
    }
}

/// Values carried by a listener's completion channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListenerError {
    /// The listener stopped serving on its own.
    #[error("{network} socket based HTTP API crashed: {reason}")]
    Crashed { network: Network, reason: String },

    /// An in-flight request failed while the listener was draining.
    #[error("{network} request {request} failed while draining: {reason}")]
    Drain {
        network: Network,
        request: String,
        reason: String,
    },
}

pub type CompletionSender = mpsc::Sender<ListenerError>;
pub type CompletionReceiver = mpsc::Receiver<ListenerError>;

/// Creates a listener completion channel.
pub fn completion_channel(buffer: usize) -> (CompletionSender, CompletionReceiver) {
    mpsc::channel(buffer.max(1))
}

/// A producer, consumer or admin subsystem.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Stops the subsystem and waits until it is fully stopped.
    async fn stop(&self);
}

/// An API server with an asynchronous stop protocol.
pub trait Listener: Send + 'static {
    fn network(&self) -> Network;

    /// Begins accepting requests.
    fn start(&mut self);

    /// Stops accepting requests and begins draining in-flight ones. Does not
    /// wait; completion is observed on [`Listener::completion`].
    fn async_stop(&mut self);

    /// Completion channel; see the [module docs](self).
    fn completion(&mut self) -> &mut CompletionReceiver;
}

/// Backend handles an API listener dispatches requests to.
#[derive(Clone)]
pub struct Backends<P, C, A> {
    pub producer: P,
    pub consumer: C,
    pub admin: A,
}

/// Constructs every subsystem the orchestrator runs.
///
/// Each constructor either returns a running subsystem or fails; partial
/// construction is never observable.
#[async_trait]
pub trait Subsystems: Send + Sync + 'static {
    type Producer: Backend + Clone;
    type Consumer: Backend + Clone;
    type Admin: Backend + Clone;
    type Listener: Listener;

    async fn spawn_producer(&self, config: &Config) -> Result<Self::Producer>;

    async fn spawn_consumer(&self, config: &Config) -> Result<Self::Consumer>;

    async fn spawn_admin(&self, config: &Config) -> Result<Self::Admin>;

    async fn new_listener(
        &self,
        network: Network,
        addr: &str,
        config: &Config,
        backends: Backends<Self::Producer, Self::Consumer, Self::Admin>,
    ) -> Result<Self::Listener>;
}

/// Stop request plus completion signal for a background task.
///
/// The task side holds a [`StopGuard`]; dropping it (normally or by panic)
/// marks the task as done, so [`StopHandle::stop`] never waits forever.
#[derive(Debug, Clone)]
pub struct StopHandle {
    requested: CancellationToken,
    done: CancellationToken,
}

/// Task side of a [`StopHandle`].
#[derive(Debug)]
pub struct StopGuard {
    requested: CancellationToken,
    _done: DropGuard,
}

impl StopHandle {
    pub fn new() -> (Self, StopGuard) {
        let requested = CancellationToken::new();
        let done = CancellationToken::new();
        let guard = StopGuard {
            requested: requested.clone(),
            _done: done.clone().drop_guard(),
        };
        (Self { requested, done }, guard)
    }

    /// Asks the task to stop without waiting.
    pub fn request(&self) {
        self.requested.cancel();
    }

    /// Asks the task to stop and waits until it is done. Repeated and
    /// concurrent calls all wait for the same completion.
    pub async fn stop(&self) {
        self.request();
        self.done.cancelled().await;
    }

    /// Waits until the task is done without asking it to stop.
    pub async fn stopped(&self) {
        self.done.cancelled().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.done.is_cancelled()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.is_cancelled()
    }
}

impl StopGuard {
    /// Token cancelled once a stop has been requested.
    pub fn requested(&self) -> &CancellationToken {
        &self.requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_handle_waits_for_guard() {
        let (handle, guard) = StopHandle::new();
        let task = tokio::spawn(async move {
            guard.requested().cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        assert!(!handle.is_stopped());
        handle.stop().await;
        assert!(handle.is_stopped());
        task.await.unwrap();
        // Later calls return immediately.
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_handle_completes_when_task_panics() {
        let (handle, guard) = StopHandle::new();
        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("task blew up");
        });
        assert!(task.await.is_err());
        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("stop must not hang after a panic");
    }

    #[tokio::test]
    async fn test_completion_channel_closes_after_last_sender() {
        let (tx, mut rx) = completion_channel(4);
        let request = tx.clone();
        drop(tx);
        request
            .send(ListenerError::Drain {
                network: Network::Tcp,
                request: "GET /topics/t/messages".into(),
                reason: "boom".into(),
            })
            .await
            .unwrap();
        drop(request);
        assert!(matches!(rx.recv().await, Some(ListenerError::Drain { .. })));
        assert!(rx.recv().await.is_none());
    }
}
