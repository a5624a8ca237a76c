//! Admin backend: inspects and rewrites consumer group offsets.
//!
//! Unlike the producer and consumer, admin has no background task. Its
//! requests go straight to the cluster clients, so stopping only closes the
//! handle to new requests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::{self, Broker, ClusterError, Coordinator, Offset, Partition};
use crate::config::{Config, CoordinatorClientConfig};
use crate::error::{Error, Result};
use crate::framework::Backend;

const NAME: &str = "admin";

/// Committed position of a group in one partition, next to the partition's
/// available range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionOffset {
    pub partition: Partition,
    pub begin: Offset,
    pub end: Offset,
    /// `-1` when the group never committed an offset.
    pub offset: Offset,
    pub lag: Offset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetUpdate {
    pub partition: Partition,
    pub offset: Offset,
}

/// Handle to the admin backend.
#[derive(Clone)]
pub struct Admin {
    inner: Arc<Inner>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    coordinator: Arc<dyn Coordinator>,
    coordinator_client: CoordinatorClientConfig,
    closed: CancellationToken,
}

impl Admin {
    pub async fn spawn(
        config: &Config,
        broker: Arc<dyn Broker>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Result<Self> {
        broker
            .connect(&config.broker.seed_peers, &config.broker_client_config())
            .await?;
        let coordinator_client = config.coordinator_client_config();
        coordinator
            .connect(&config.coordinator.seed_peers, &coordinator_client)
            .await?;
        info!("Admin started");
        Ok(Self {
            inner: Arc::new(Inner {
                broker,
                coordinator,
                coordinator_client,
                closed: CancellationToken::new(),
            }),
        })
    }

    pub async fn get_group_offsets(&self, group: &str, topic: &str) -> Result<Vec<PartitionOffset>> {
        self.ensure_open()?;
        let inner = &self.inner;
        let partitions = inner.broker.partitions(topic).await?;
        let mut offsets = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let range = inner.broker.offset_range(topic, partition).await?;
            let committed = cluster::committed_offset(
                inner.coordinator.as_ref(),
                &inner.coordinator_client,
                group,
                topic,
                partition,
            )
            .await?;
            let (offset, lag) = match committed {
                // An offset set past the newest message has no lag.
                Some(offset) => (offset, (range.newest - offset).max(0)),
                None => (-1, range.newest - range.oldest),
            };
            offsets.push(PartitionOffset {
                partition,
                begin: range.oldest,
                end: range.newest,
                offset,
                lag,
            });
        }
        Ok(offsets)
    }

    /// Overwrites committed offsets. Nothing is written unless every update
    /// names an existing partition.
    pub async fn set_group_offsets(&self, group: &str, topic: &str, updates: &[OffsetUpdate]) -> Result<()> {
        self.ensure_open()?;
        let inner = &self.inner;
        let partitions = inner.broker.partitions(topic).await?;
        if let Some(unknown) = updates.iter().find(|u| !partitions.contains(&u.partition)) {
            return Err(ClusterError::UnknownPartition {
                topic: topic.to_string(),
                partition: unknown.partition,
            }
            .into());
        }
        for update in updates {
            let path = cluster::offset_path(&inner.coordinator_client, group, topic, update.partition);
            inner.coordinator.set(&path, update.offset.to_string()).await?;
        }
        info!(%group, %topic, count = updates.len(), "Group offsets set");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            return Err(Error::Stopped(NAME));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for Admin {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn stop(&self) {
        if !self.inner.closed.is_cancelled() {
            self.inner.closed.cancel();
            info!("Admin stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryBroker, MemoryCoordinator, Message};

    async fn setup() -> (Admin, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("events", 2);
        let batch = (0..5).map(|i| Message::new("events", None, format!("m{i}"))).collect();
        broker.append("events", 0, batch).await.unwrap();
        let admin = Admin::spawn(&Config::default(), broker.clone(), Arc::new(MemoryCoordinator::new()))
            .await
            .unwrap();
        (admin, broker)
    }

    #[tokio::test]
    async fn test_offsets_of_a_group_that_never_committed() {
        let (admin, _broker) = setup().await;
        let offsets = admin.get_group_offsets("g1", "events").await.unwrap();
        assert_eq!(
            offsets,
            vec![
                PartitionOffset { partition: 0, begin: 0, end: 5, offset: -1, lag: 5 },
                PartitionOffset { partition: 1, begin: 0, end: 0, offset: -1, lag: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn test_set_then_get_group_offsets() {
        let (admin, _broker) = setup().await;
        admin
            .set_group_offsets("g1", "events", &[OffsetUpdate { partition: 0, offset: 3 }])
            .await
            .unwrap();
        let offsets = admin.get_group_offsets("g1", "events").await.unwrap();
        assert_eq!((offsets[0].offset, offsets[0].lag), (3, 2));
        assert_eq!(offsets[1].offset, -1);
    }

    #[tokio::test]
    async fn test_offset_past_newest_reports_zero_lag() {
        let (admin, _broker) = setup().await;
        admin
            .set_group_offsets("g1", "events", &[OffsetUpdate { partition: 0, offset: 9 }])
            .await
            .unwrap();
        let offsets = admin.get_group_offsets("g1", "events").await.unwrap();
        assert_eq!((offsets[0].offset, offsets[0].lag), (9, 0));
    }

    #[tokio::test]
    async fn test_unknown_partition_is_rejected_atomically() {
        let (admin, _broker) = setup().await;
        let updates = [
            OffsetUpdate { partition: 0, offset: 1 },
            OffsetUpdate { partition: 7, offset: 1 },
        ];
        let err = admin.set_group_offsets("g1", "events", &updates).await.unwrap_err();
        assert!(matches!(err, Error::Cluster(ClusterError::UnknownPartition { partition: 7, .. })));
        let offsets = admin.get_group_offsets("g1", "events").await.unwrap();
        assert_eq!(offsets[0].offset, -1);
    }

    #[tokio::test]
    async fn test_requests_after_stop_fail() {
        let (admin, _broker) = setup().await;
        admin.stop().await;
        admin.stop().await;
        assert!(matches!(
            admin.get_group_offsets("g1", "events").await,
            Err(Error::Stopped("admin"))
        ));
    }
}
