//! Broker and coordination-service client contracts.
//!
//! The proxy talks to two external clusters: the message broker (topics,
//! partitions, offsets) and the coordination service (consumer group state,
//! committed offsets). The backend subsystems only see them through the
//! [`Broker`] and [`Coordinator`] traits; wire protocols live behind them.
//!
//! [`memory`] provides in-process implementations used by tests and by the
//! standalone binary.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{BrokerClientConfig, CoordinatorClientConfig};

pub use memory::{MemoryBroker, MemoryCoordinator};

pub type Partition = i32;
pub type Offset = i64;

/// A message as submitted by a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, key: Option<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key,
            value: value.into(),
        }
    }

    /// Bytes this message occupies in a produce batch.
    pub fn size(&self) -> usize {
        self.key.as_ref().map_or(0, Vec::len) + self.value.len()
    }
}

/// A message as stored by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub offset: Offset,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

/// Offsets available in a partition: `oldest` is the first retained message,
/// `newest` is the offset the next message will get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OffsetRange {
    pub oldest: Offset,
    pub newest: Offset,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("no seed peers configured")]
    NoSeedPeers,
    #[error("cluster unreachable: {0}")]
    Unreachable(String),
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("unknown partition: topic={topic}, partition={partition}")]
    UnknownPartition { topic: String, partition: Partition },
    #[error("invalid session timeout: {0}")]
    InvalidSessionTimeout(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Client side of the message broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Establishes the client. Called once per subsystem at spawn time.
    async fn connect(&self, seeds: &[String], config: &BrokerClientConfig) -> Result<(), ClusterError>;

    async fn partitions(&self, topic: &str) -> Result<Vec<Partition>, ClusterError>;

    /// Appends a batch to one partition, returning the offset of its first message.
    async fn append(
        &self,
        topic: &str,
        partition: Partition,
        messages: Vec<Message>,
    ) -> Result<Offset, ClusterError>;

    async fn fetch(
        &self,
        topic: &str,
        partition: Partition,
        offset: Offset,
        max: usize,
    ) -> Result<Vec<StoredMessage>, ClusterError>;

    async fn offset_range(&self, topic: &str, partition: Partition) -> Result<OffsetRange, ClusterError>;
}

/// Client side of the coordination service, reduced to a path/value store.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    async fn connect(&self, seeds: &[String], config: &CoordinatorClientConfig) -> Result<(), ClusterError>;

    async fn get(&self, path: &str) -> Result<Option<String>, ClusterError>;

    async fn set(&self, path: &str, value: String) -> Result<(), ClusterError>;
}

/// Path under which a group's committed offset for one partition is stored.
pub fn offset_path(
    config: &CoordinatorClientConfig,
    group: &str,
    topic: &str,
    partition: Partition,
) -> String {
    config.path(&format!("consumers/{group}/offsets/{topic}/{partition}"))
}

/// Reads a committed offset, `None` when the group never committed one.
pub async fn committed_offset(
    coordinator: &dyn Coordinator,
    config: &CoordinatorClientConfig,
    group: &str,
    topic: &str,
    partition: Partition,
) -> Result<Option<Offset>, ClusterError> {
    let path = offset_path(config, group, topic, partition);
    let Some(raw) = coordinator.get(&path).await? else {
        return Ok(None);
    };
    raw.parse()
        .map(Some)
        .map_err(|_| ClusterError::Unavailable(format!("corrupt offset at {path}: {raw:?}")))
}

/// The pair of cluster clients shared by every backend subsystem.
#[derive(Clone)]
pub struct Cluster {
    pub broker: Arc<dyn Broker>,
    pub coordinator: Arc<dyn Coordinator>,
}

impl Cluster {
    pub fn new(broker: Arc<dyn Broker>, coordinator: Arc<dyn Coordinator>) -> Self {
        Self { broker, coordinator }
    }
}
