//! # broker-proxy
//!
//! Runs the proxy until a termination signal arrives or a listener crashes.
//! The broker and coordination clusters are in-process (see
//! [`broker_proxy::cluster::memory`]).

use std::sync::Arc;
use std::time::Duration;

use broker_proxy::cluster::{Cluster, MemoryBroker, MemoryCoordinator};
use broker_proxy::config::{DEFAULT_BROKER_PEER, DEFAULT_COORDINATOR_PEER, DEFAULT_UNIX_ADDR};
use broker_proxy::lifecycle::{setup_tracing, wait_for_shutdown_signal};
use broker_proxy::{Config, Service};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "broker-proxy", version, about = "HTTP proxy in front of a message broker cluster")]
struct Args {
    /// Unix domain socket the API is served on.
    #[arg(long, env = "PROXY_UNIX_ADDR", default_value = DEFAULT_UNIX_ADDR)]
    unix_addr: String,

    /// Optional TCP address the API is also served on.
    #[arg(long, env = "PROXY_TCP_ADDR")]
    tcp_addr: Option<String>,

    /// Client id reported to the clusters. Generated when omitted.
    #[arg(long, env = "PROXY_CLIENT_ID")]
    client_id: Option<String>,

    #[arg(long, env = "PROXY_BROKER_PEERS", value_delimiter = ',', default_value = DEFAULT_BROKER_PEER)]
    broker_peers: Vec<String>,

    #[arg(long, env = "PROXY_COORDINATOR_PEERS", value_delimiter = ',', default_value = DEFAULT_COORDINATOR_PEER)]
    coordinator_peers: Vec<String>,

    #[arg(long, env = "PROXY_COORDINATOR_ROOT", default_value = "")]
    coordinator_root: String,

    #[arg(long, env = "PROXY_PRODUCER_SHUTDOWN_TIMEOUT_MS")]
    producer_shutdown_timeout_ms: Option<u64>,

    #[arg(long, env = "PROXY_LONG_POLLING_TIMEOUT_MS")]
    long_polling_timeout_ms: Option<u64>,

    #[arg(long, env = "PROXY_REGISTRATION_TIMEOUT_MS")]
    registration_timeout_ms: Option<u64>,

    #[arg(long, env = "PROXY_BACK_OFF_TIMEOUT_MS")]
    back_off_timeout_ms: Option<u64>,

    #[arg(long, env = "PROXY_REBALANCE_DELAY_MS")]
    rebalance_delay_ms: Option<u64>,

    #[arg(long, env = "PROXY_CHANNEL_BUFFER_SIZE")]
    channel_buffer_size: Option<usize>,

    /// Topics to create in the in-process broker, as `name:partitions`.
    #[arg(long, env = "PROXY_TOPICS", value_delimiter = ',', value_parser = parse_topic)]
    topics: Vec<(String, usize)>,
}

fn parse_topic(raw: &str) -> Result<(String, usize), String> {
    let (name, partitions) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("{raw:?} is not in name:partitions form"))?;
    let partitions: usize = partitions
        .parse()
        .map_err(|e| format!("bad partition count in {raw:?}: {e}"))?;
    if name.is_empty() || partitions == 0 {
        return Err(format!("{raw:?} needs a name and at least one partition"));
    }
    Ok((name.to_string(), partitions))
}

impl Args {
    fn into_config(self) -> broker_proxy::Result<Config> {
        let mut builder = Config::builder()
            .unix_addr(self.unix_addr)
            .broker_peers(self.broker_peers)
            .coordinator_peers(self.coordinator_peers)
            .coordinator_root(self.coordinator_root);
        if let Some(addr) = self.tcp_addr {
            builder = builder.tcp_addr(addr);
        }
        if let Some(client_id) = self.client_id {
            builder = builder.client_id(client_id);
        }
        if let Some(ms) = self.producer_shutdown_timeout_ms {
            builder = builder.producer_shutdown_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.long_polling_timeout_ms {
            builder = builder.long_polling_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.registration_timeout_ms {
            builder = builder.registration_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.back_off_timeout_ms {
            builder = builder.back_off_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.rebalance_delay_ms {
            builder = builder.rebalance_delay(Duration::from_millis(ms));
        }
        if let Some(size) = self.channel_buffer_size {
            builder = builder.channel_buffer_size(size);
        }
        builder.build()
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    setup_tracing();

    let mut args = Args::parse();
    let broker = Arc::new(MemoryBroker::new());
    for (topic, partitions) in std::mem::take(&mut args.topics) {
        broker.create_topic(&topic, partitions);
        info!(%topic, partitions, "Created topic");
    }
    let cluster = Cluster::new(broker, Arc::new(MemoryCoordinator::new()));

    let config = args.into_config().map_err(|e| e.to_string())?;
    info!(client_id = %config.client_id, unix_addr = %config.unix_addr, tcp_addr = ?config.tcp_addr, "Starting broker proxy");

    let service = Service::spawn(config, cluster)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start");
            e.to_string()
        })?;

    tokio::select! {
        signal = wait_for_shutdown_signal() => {
            if let Err(e) = signal {
                error!(error = %e, "Cannot listen for termination signals");
            }
        }
        _ = service.stopped() => {
            error!("Service stopped on its own");
        }
    }

    service.stop().await;
    info!("Broker proxy exited");
    Ok(())
}
