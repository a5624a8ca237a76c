//! In-process broker and coordinator.
//!
//! Both keep their state behind a `std::sync::Mutex` that is never held across
//! an await point. Fault injection knobs let tests make spawning or delivery
//! fail on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Broker, ClusterError, Coordinator, Message, Offset, OffsetRange, Partition, StoredMessage};
use crate::config::{BrokerClientConfig, CoordinatorClientConfig, DEFAULT_COORDINATOR_TICK};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // State stays consistent even if a holder panicked mid-test.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Broker keeping every partition log in memory. Offsets start at 0.
#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Vec<Vec<StoredMessage>>>>,
    unreachable: AtomicBool,
    failing_appends: AtomicUsize,
    connections: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `topic` with `partitions` empty partitions. Existing topics are kept.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        lock(&self.topics)
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions]);
    }

    /// Makes subsequent `connect` calls fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Makes the next `count` appends fail with [`ClusterError::Unavailable`].
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Number of successful `connect` calls so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every message stored in one partition.
    pub fn messages(&self, topic: &str, partition: Partition) -> Vec<StoredMessage> {
        lock(&self.topics)
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    fn take_append_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn partition_log<'a>(
    topics: &'a mut HashMap<String, Vec<Vec<StoredMessage>>>,
    topic: &str,
    partition: Partition,
) -> Result<&'a mut Vec<StoredMessage>, ClusterError> {
    let partitions = topics
        .get_mut(topic)
        .ok_or_else(|| ClusterError::UnknownTopic(topic.to_string()))?;
    usize::try_from(partition)
        .ok()
        .and_then(|index| partitions.get_mut(index))
        .ok_or_else(|| ClusterError::UnknownPartition {
            topic: topic.to_string(),
            partition,
        })
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, seeds: &[String], config: &BrokerClientConfig) -> Result<(), ClusterError> {
        if seeds.is_empty() {
            return Err(ClusterError::NoSeedPeers);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ClusterError::Unreachable(seeds.join(",")));
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        debug!(client_id = %config.client_id, ?seeds, "Broker client connected");
        Ok(())
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<Partition>, ClusterError> {
        let topics = lock(&self.topics);
        let partitions = topics
            .get(topic)
            .ok_or_else(|| ClusterError::UnknownTopic(topic.to_string()))?;
        Ok((0..partitions.len() as Partition).collect())
    }

    async fn append(
        &self,
        topic: &str,
        partition: Partition,
        messages: Vec<Message>,
    ) -> Result<Offset, ClusterError> {
        if self.take_append_failure() {
            return Err(ClusterError::Unavailable(format!(
                "leader not available: topic={topic}, partition={partition}"
            )));
        }
        let mut topics = lock(&self.topics);
        let log = partition_log(&mut topics, topic, partition)?;
        let base = log.len() as Offset;
        log.extend(messages.into_iter().enumerate().map(|(i, message)| StoredMessage {
            offset: base + i as Offset,
            key: message.key,
            value: message.value,
        }));
        Ok(base)
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: Partition,
        offset: Offset,
        max: usize,
    ) -> Result<Vec<StoredMessage>, ClusterError> {
        let mut topics = lock(&self.topics);
        let log = partition_log(&mut topics, topic, partition)?;
        let start = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        Ok(log.iter().skip(start).take(max).cloned().collect())
    }

    async fn offset_range(&self, topic: &str, partition: Partition) -> Result<OffsetRange, ClusterError> {
        let mut topics = lock(&self.topics);
        let log = partition_log(&mut topics, topic, partition)?;
        Ok(OffsetRange {
            oldest: 0,
            newest: log.len() as Offset,
        })
    }
}

/// Coordination service keeping paths in a flat map.
pub struct MemoryCoordinator {
    nodes: Mutex<HashMap<String, String>>,
    tick: Duration,
    unreachable: AtomicBool,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            tick: DEFAULT_COORDINATOR_TICK,
            unreachable: AtomicBool::new(false),
        }
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinator whose server tick differs from the default.
    pub fn with_tick(tick: Duration) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn connect(&self, seeds: &[String], config: &CoordinatorClientConfig) -> Result<(), ClusterError> {
        if seeds.is_empty() {
            return Err(ClusterError::NoSeedPeers);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ClusterError::Unreachable(seeds.join(",")));
        }
        config.validate_session_timeout(self.tick)?;
        debug!(root = %config.root_path, ?seeds, "Coordinator client connected");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<String>, ClusterError> {
        Ok(lock(&self.nodes).get(path).cloned())
    }

    async fn set(&self, path: &str, value: String) -> Result<(), ClusterError> {
        lock(&self.nodes).insert(path.to_string(), value);
        Ok(())
    }
}
