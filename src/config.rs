//! # Configuration
//!
//! [`Config`] aggregates everything the proxy needs: listener addresses, the
//! seed peers of the broker and coordination clusters, and per-subsystem
//! tunables. It is built once at process start, either from
//! [`Config::default`] or through [`ConfigBuilder`] (defaults first, then
//! overrides, then validation), and handed read-only to every subsystem.
//!
//! Subsystems never read client-library settings off `Config` directly; they
//! ask for a translated view instead:
//!
//! - [`Config::broker_client_config`] for the broker client
//! - [`Config::coordinator_client_config`] for the coordination client
//!
//! The translated views carry fixed policy defaults (acks, compression,
//! retries, flush thresholds, session timeout) that are not part of the public
//! configuration surface.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::cluster::{ClusterError, Message};
use crate::error::{Error, Result};
use crate::identity;

pub const DEFAULT_UNIX_ADDR: &str = "/var/run/broker-proxy.sock";
pub const DEFAULT_BROKER_PEER: &str = "localhost:9092";
pub const DEFAULT_COORDINATOR_PEER: &str = "localhost:2181";
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 256;

/// Coordination service default `tickTime`.
pub const DEFAULT_COORDINATOR_TICK: Duration = Duration::from_secs(2);

/// Top-level proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unix domain socket path the mandatory API listener binds.
    pub unix_addr: String,
    /// TCP address of the optional API listener. `None` disables it.
    pub tcp_addr: Option<String>,
    /// Identifies this instance to the broker and the coordination service.
    pub client_id: String,
    pub broker: BrokerConfig,
    pub coordinator: CoordinatorConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    /// Capacity of every buffered channel the subsystems create.
    pub channel_buffer_size: usize,
    pub(crate) testing: Testing,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// `host:port` peers used to discover the broker cluster.
    pub seed_peers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// `host:port` peers used to discover the coordination ensemble.
    pub seed_peers: Vec<String>,
    /// Namespace prefix for every path the proxy touches.
    pub root_path: String,
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// How long the producer may keep flushing buffered messages once it has
    /// been asked to stop. Must be long enough to ride out a leader election.
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Longest a consume request waits for a message to become available.
    pub long_polling_timeout: Duration,
    /// How long a group/topic registration survives without requests.
    pub registration_timeout: Duration,
    /// Pause between retries of a failed or empty fetch.
    pub back_off_timeout: Duration,
    /// Settle time after a membership change before fetching starts.
    pub rebalance_delay: Duration,
}

/// Hooks used by unit tests only. Not settable through any public API.
#[derive(Debug, Clone, Default)]
pub(crate) struct Testing {
    /// Receives `(group, topic)` when a registration fetches its first message.
    pub(crate) first_message_fetched: Option<mpsc::UnboundedSender<(String, String)>>,
    /// Receives messages the producer gave up on.
    pub(crate) dead_messages: Option<mpsc::UnboundedSender<Message>>,
}

impl Default for Config {
    /// Defaults:
    ///
    /// - `channel_buffer_size = 256`
    /// - `producer.shutdown_timeout = 30s`
    /// - `consumer.long_polling_timeout = 3s`
    /// - `consumer.registration_timeout = 20s`
    /// - `consumer.back_off_timeout = 500ms`
    /// - `consumer.rebalance_delay = 250ms`
    fn default() -> Self {
        Self {
            unix_addr: DEFAULT_UNIX_ADDR.to_string(),
            tcp_addr: None,
            client_id: identity::new_client_id(),
            broker: BrokerConfig {
                seed_peers: vec![DEFAULT_BROKER_PEER.to_string()],
            },
            coordinator: CoordinatorConfig {
                seed_peers: vec![DEFAULT_COORDINATOR_PEER.to_string()],
                root_path: String::new(),
            },
            producer: ProducerConfig {
                shutdown_timeout: Duration::from_secs(30),
            },
            consumer: ConsumerConfig {
                long_polling_timeout: Duration::from_secs(3),
                registration_timeout: Duration::from_secs(20),
                back_off_timeout: Duration::from_millis(500),
                rebalance_delay: Duration::from_millis(250),
            },
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            testing: Testing::default(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Checks the invariants every subsystem relies on.
    pub fn validate(&self) -> Result<()> {
        if self.unix_addr.trim().is_empty() {
            return Err(Error::Config("unix socket address must be set".into()));
        }
        if let Some(tcp_addr) = &self.tcp_addr {
            if tcp_addr.trim().is_empty() {
                return Err(Error::Config("tcp address must not be blank".into()));
            }
        }
        validate_peers("broker", &self.broker.seed_peers)?;
        validate_peers("coordinator", &self.coordinator.seed_peers)?;
        if self.channel_buffer_size == 0 {
            return Err(Error::Config("channel buffer size must be positive".into()));
        }
        if self.client_id.is_empty() {
            return Err(Error::Config("client id must not be empty".into()));
        }
        Ok(())
    }

    /// Broker client settings derived from this configuration.
    pub fn broker_client_config(&self) -> BrokerClientConfig {
        BrokerClientConfig {
            client_id: self.client_id.clone(),
            channel_buffer_size: self.channel_buffer_size,
            producer: ProducerClientConfig {
                required_acks: RequiredAcks::WaitForAll,
                return_successes: true,
                return_errors: true,
                compression: Compression::Snappy,
                retry_max: 5,
                retry_backoff: Duration::from_secs(4),
                flush_frequency: Duration::from_millis(500),
                flush_bytes: 1024 * 1024,
            },
            consumer: ConsumerClientConfig {
                offsets_commit_interval: Duration::from_millis(50),
                retry_backoff: self.consumer.back_off_timeout,
            },
        }
    }

    /// Coordination client settings derived from this configuration.
    pub fn coordinator_client_config(&self) -> CoordinatorClientConfig {
        CoordinatorClientConfig {
            root_path: self.coordinator.root_path.clone(),
            // The service requires 2x..20x its tickTime; 15s sits inside that
            // window for the default 2s tick.
            session_timeout: Duration::from_secs(15),
        }
    }
}

fn validate_peers(cluster: &str, peers: &[String]) -> Result<()> {
    if peers.is_empty() {
        return Err(Error::Config(format!("{cluster} seed peers must not be empty")));
    }
    for peer in peers {
        let valid = peer
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid {
            return Err(Error::Config(format!(
                "{cluster} seed peer {peer:?} is not in host:port form"
            )));
        }
    }
    Ok(())
}

/// Applies defaults, then overrides, then validates.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn unix_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.unix_addr = addr.into();
        self
    }

    pub fn tcp_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.tcp_addr = Some(addr.into());
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn broker_peers<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.broker.seed_peers = peers.into_iter().map(Into::into).collect();
        self
    }

    pub fn coordinator_peers<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.coordinator.seed_peers = peers.into_iter().map(Into::into).collect();
        self
    }

    pub fn coordinator_root(mut self, root_path: impl Into<String>) -> Self {
        self.config.coordinator.root_path = root_path.into();
        self
    }

    pub fn producer_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.producer.shutdown_timeout = timeout;
        self
    }

    pub fn long_polling_timeout(mut self, timeout: Duration) -> Self {
        self.config.consumer.long_polling_timeout = timeout;
        self
    }

    pub fn registration_timeout(mut self, timeout: Duration) -> Self {
        self.config.consumer.registration_timeout = timeout;
        self
    }

    pub fn back_off_timeout(mut self, timeout: Duration) -> Self {
        self.config.consumer.back_off_timeout = timeout;
        self
    }

    pub fn rebalance_delay(mut self, delay: Duration) -> Self {
        self.config.consumer.rebalance_delay = delay;
        self
    }

    pub fn channel_buffer_size(mut self, size: usize) -> Self {
        self.config.channel_buffer_size = size;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// How many replicas must acknowledge a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAcks {
    NoResponse,
    WaitForLocal,
    WaitForAll,
}

/// Codec applied to produced batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    Lz4,
}

/// Broker client view of [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerClientConfig {
    pub client_id: String,
    pub channel_buffer_size: usize,
    pub producer: ProducerClientConfig,
    pub consumer: ConsumerClientConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerClientConfig {
    pub required_acks: RequiredAcks,
    /// Report successful deliveries back to the caller.
    pub return_successes: bool,
    /// Report failed deliveries back to the caller.
    pub return_errors: bool,
    pub compression: Compression,
    /// Retries after the first failed attempt.
    pub retry_max: usize,
    pub retry_backoff: Duration,
    /// Buffered messages are flushed at least this often...
    pub flush_frequency: Duration,
    /// ...or as soon as this many bytes are buffered.
    pub flush_bytes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerClientConfig {
    pub offsets_commit_interval: Duration,
    pub retry_backoff: Duration,
}

/// Coordination client view of [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorClientConfig {
    pub root_path: String,
    pub session_timeout: Duration,
}

impl CoordinatorClientConfig {
    /// The coordination service accepts session timeouts between 2 and 20
    /// times its tick.
    pub fn validate_session_timeout(&self, tick: Duration) -> std::result::Result<(), ClusterError> {
        let (min, max) = (tick * 2, tick * 20);
        if self.session_timeout < min || self.session_timeout > max {
            return Err(ClusterError::InvalidSessionTimeout(format!(
                "session timeout {:?} outside [{:?}, {:?}]",
                self.session_timeout, min, max
            )));
        }
        Ok(())
    }

    /// Absolute path of `relative` inside the configured root.
    pub fn path(&self, relative: &str) -> String {
        let root = self.root_path.trim_end_matches('/');
        let relative = relative.trim_start_matches('/');
        format!("{root}/{relative}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.channel_buffer_size, 256);
        assert_eq!(config.producer.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.consumer.long_polling_timeout, Duration::from_secs(3));
        assert_eq!(config.consumer.registration_timeout, Duration::from_secs(20));
        assert_eq!(config.consumer.back_off_timeout, Duration::from_millis(500));
        assert_eq!(config.consumer.rebalance_delay, Duration::from_millis(250));
        assert!(config.tcp_addr.is_none());
        assert!(config.client_id.starts_with("proxy_"));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn test_builder_overrides_defaults() {
        let config = Config::builder()
            .unix_addr("/tmp/proxy.sock")
            .tcp_addr("127.0.0.1:19092")
            .client_id("test-client")
            .broker_peers(["b1:9092", "b2:9092"])
            .coordinator_peers(["z1:2181"])
            .coordinator_root("/kafka")
            .long_polling_timeout(Duration::from_millis(100))
            .build()
            .expect("valid config");
        assert_eq!(config.unix_addr, "/tmp/proxy.sock");
        assert_eq!(config.tcp_addr.as_deref(), Some("127.0.0.1:19092"));
        assert_eq!(config.broker.seed_peers, vec!["b1:9092", "b2:9092"]);
        assert_eq!(config.coordinator.root_path, "/kafka");
        assert_eq!(config.consumer.long_polling_timeout, Duration::from_millis(100));
        // Untouched tunables keep their defaults.
        assert_eq!(config.consumer.registration_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_builder_rejects_invalid_values() {
        assert!(matches!(
            Config::builder().unix_addr("").build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::builder().broker_peers(Vec::<String>::new()).build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::builder().coordinator_peers(["no-port"]).build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::builder().channel_buffer_size(0).build(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_broker_client_translation() {
        let config = Config::builder()
            .client_id("proxy-7")
            .channel_buffer_size(64)
            .back_off_timeout(Duration::from_millis(750))
            .build()
            .unwrap();
        let client = config.broker_client_config();
        assert_eq!(client.client_id, "proxy-7");
        assert_eq!(client.channel_buffer_size, 64);
        assert_eq!(client.producer.required_acks, RequiredAcks::WaitForAll);
        assert!(client.producer.return_successes);
        assert!(client.producer.return_errors);
        assert_eq!(client.producer.compression, Compression::Snappy);
        assert_eq!(client.producer.retry_max, 5);
        assert_eq!(client.producer.retry_backoff, Duration::from_secs(4));
        assert_eq!(client.producer.flush_frequency, Duration::from_millis(500));
        assert_eq!(client.producer.flush_bytes, 1024 * 1024);
        assert_eq!(client.consumer.offsets_commit_interval, Duration::from_millis(50));
        assert_eq!(client.consumer.retry_backoff, Duration::from_millis(750));
    }

    #[test]
    fn test_coordinator_client_translation() {
        let config = Config::builder().coordinator_root("/chroot/").build().unwrap();
        let client = config.coordinator_client_config();
        assert_eq!(client.root_path, "/chroot/");
        assert_eq!(client.session_timeout, Duration::from_secs(15));
        client
            .validate_session_timeout(DEFAULT_COORDINATOR_TICK)
            .expect("15s fits the default tick window");
        assert!(matches!(
            client.validate_session_timeout(Duration::from_secs(10)),
            Err(ClusterError::InvalidSessionTimeout(_))
        ));
        assert_eq!(client.path("consumers/g"), "/chroot/consumers/g");
    }
}
