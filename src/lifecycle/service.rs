use std::future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::cluster::Cluster;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::framework::{Backend, Backends, Listener, ListenerError, Network, StopGuard, StopHandle, Subsystems};
use crate::lifecycle::proxy::Proxy;

/// The running proxy: three backends, one or two API listeners, and the task
/// supervising them.
///
/// `Service` is responsible for:
/// - **Construction order**: producer, consumer, admin, unix listener, then
///   the tcp listener when one is configured. A failed stage rolls back every
///   stage before it.
/// - **Supervision**: a crash of either listener shuts the whole service down.
/// - **Shutdown order**: listeners stop accepting, in-flight requests drain,
///   and only then are the backends stopped.
///
/// # Shutdown sequence
///
/// ```text
/// stop() or listener crash
///   │
///   ├─► async_stop(unix), async_stop(tcp)          quiesce
///   ├─► recv unix completion until closed  ┐
///   │   recv tcp completion until closed   ┘       drain (concurrently)
///   ├─► stop producer | consumer | admin           concurrently, one task each
///   └─► stop() returns
/// ```
///
/// # Example
///
/// ```ignore
/// let cluster = Cluster::new(Arc::new(MemoryBroker::new()), Arc::new(MemoryCoordinator::new()));
/// let service = Service::spawn(config, cluster).await?;
/// tokio::select! {
///     _ = wait_for_shutdown_signal() => {}
///     _ = service.stopped() => {}
/// }
/// service.stop().await;
/// ```
pub struct Service {
    lifecycle: StopHandle,
}

impl Service {
    /// Spawns the service with the production subsystems.
    pub async fn spawn(config: Config, cluster: Cluster) -> Result<Self> {
        Self::spawn_with(config, Proxy::new(cluster)).await
    }

    /// Spawns the service with subsystems built by `subsystems`.
    ///
    /// When this returns `Ok`, every subsystem is running. When it returns
    /// `Err`, everything started along the way has been stopped again.
    pub async fn spawn_with<S: Subsystems>(config: Config, subsystems: S) -> Result<Self> {
        config.validate()?;
        info!(client_id = %config.client_id, "Spawning service");

        let mut started: Vec<Arc<dyn Backend>> = Vec::with_capacity(3);

        let producer = match subsystems.spawn_producer(&config).await {
            Ok(producer) => producer,
            Err(err) => return Err(rollback::<S::Listener>("producer", err, Vec::new(), started).await),
        };
        started.push(Arc::new(producer.clone()));

        let consumer = match subsystems.spawn_consumer(&config).await {
            Ok(consumer) => consumer,
            Err(err) => return Err(rollback::<S::Listener>("consumer", err, Vec::new(), started).await),
        };
        started.push(Arc::new(consumer.clone()));

        let admin = match subsystems.spawn_admin(&config).await {
            Ok(admin) => admin,
            Err(err) => return Err(rollback::<S::Listener>("admin", err, Vec::new(), started).await),
        };
        started.push(Arc::new(admin.clone()));

        let backends = Backends {
            producer,
            consumer,
            admin,
        };

        let unix = match subsystems
            .new_listener(Network::Unix, &config.unix_addr, &config, backends.clone())
            .await
        {
            Ok(listener) => listener,
            Err(err) => return Err(rollback::<S::Listener>("unix listener", err, Vec::new(), started).await),
        };

        let tcp = match &config.tcp_addr {
            Some(addr) => match subsystems
                .new_listener(Network::Tcp, addr, &config, backends)
                .await
            {
                Ok(listener) => Some(listener),
                Err(err) => return Err(rollback("tcp listener", err, vec![unix], started).await),
            },
            None => None,
        };

        let (lifecycle, guard) = StopHandle::new();
        let supervisor = supervise(unix, tcp, started, guard).instrument(info_span!("supervisor"));
        tokio::spawn(supervisor);
        Ok(Self { lifecycle })
    }

    /// Shuts the service down and waits until every subsystem is stopped.
    ///
    /// Calling it again, or from several tasks at once, is harmless: every
    /// call waits for the same shutdown.
    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }

    /// Waits until the service has stopped, without asking it to.
    pub async fn stopped(&self) {
        self.lifecycle.stopped().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.lifecycle.is_stopped()
    }
}

/// Undoes a partial construction and wraps the cause.
async fn rollback<L: Listener>(
    stage: &'static str,
    err: Error,
    mut listeners: Vec<L>,
    backends: Vec<Arc<dyn Backend>>,
) -> Error {
    error!(subsystem = stage, error = %err, "Spawn failed, rolling back");
    for listener in &mut listeners {
        listener.async_stop();
    }
    for listener in &mut listeners {
        drain(listener).await;
    }
    stop_backends(backends).await;
    Error::spawn(stage, err)
}

async fn supervise<L: Listener>(
    mut unix: L,
    mut tcp: Option<L>,
    backends: Vec<Arc<dyn Backend>>,
    guard: StopGuard,
) {
    unix.start();
    if let Some(tcp) = &mut tcp {
        tcp.start();
    }
    info!(tcp = tcp.is_some(), "Service started");

    tokio::select! {
        _ = guard.requested().cancelled() => info!("Stop requested"),
        event = unix.completion().recv() => listener_failed(Network::Unix, event),
        event = next_event(tcp.as_mut()) => listener_failed(Network::Tcp, event),
    }

    unix.async_stop();
    if let Some(tcp) = &mut tcp {
        tcp.async_stop();
    }
    tokio::join!(drain(&mut unix), async {
        if let Some(tcp) = &mut tcp {
            drain(tcp).await;
        }
    });

    stop_backends(backends).await;
    info!("Service stopped");
    drop(guard);
}

/// Next completion event of an optional listener; never resolves without one.
async fn next_event<L: Listener>(listener: Option<&mut L>) -> Option<ListenerError> {
    match listener {
        Some(listener) => listener.completion().recv().await,
        None => future::pending().await,
    }
}

fn listener_failed(network: Network, event: Option<ListenerError>) {
    match event {
        Some(err) => error!(%network, error = %err, "Listener crashed, shutting down"),
        None => error!(%network, "Listener stopped unexpectedly, shutting down"),
    }
}

/// Receives from a listener's completion channel until it closes.
async fn drain<L: Listener>(listener: &mut L) {
    let network = listener.network();
    let mut failed = 0usize;
    while let Some(err) = listener.completion().recv().await {
        failed += 1;
        warn!(%network, error = %err, "Request failed while draining");
    }
    info!(%network, failed, "Listener drained");
}

async fn stop_backends(backends: Vec<Arc<dyn Backend>>) {
    let mut tasks = JoinSet::new();
    for backend in backends {
        tasks.spawn(
            async move {
                backend.stop().await;
                backend.name()
            }
            .in_current_span(),
        );
    }
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(name) => info!(backend = name, "Backend stopped"),
            Err(err) => error!(error = %err, "Backend stop task failed"),
        }
    }
}
