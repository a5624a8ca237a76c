//! # Consumer
//!
//! Long-polling consumer actor. Every `(group, topic)` pair a client asks for
//! gets a registration that tracks the group's position in each partition.
//!
//! - A new registration starts from the group's committed offsets, or from
//!   the oldest retained message when the group never committed any. It
//!   waits `rebalance_delay` before its first fetch.
//! - A request nobody can serve yet is parked and retried every
//!   `back_off_timeout` until `long_polling_timeout` expires.
//! - Positions are committed to the coordination service every
//!   `offsets_commit_interval`, when a registration expires after
//!   `registration_timeout` without requests, and on stop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cluster::{self, Broker, Coordinator, Offset, Partition};
use crate::config::{Config, ConsumerConfig, CoordinatorClientConfig};
use crate::error::{Error, Result};
use crate::framework::{Backend, StopGuard, StopHandle};

const NAME: &str = "consumer";

/// A message handed out to a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: Partition,
    pub offset: Offset,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

type Reply = oneshot::Sender<Result<ConsumedMessage>>;

struct ConsumeRequest {
    group: String,
    topic: String,
    respond_to: Reply,
}

/// Handle to the consumer actor.
#[derive(Clone)]
pub struct Consumer {
    sender: mpsc::Sender<ConsumeRequest>,
    lifecycle: StopHandle,
}

impl Consumer {
    /// Connects to the broker and the coordination service and starts the
    /// consumer actor.
    pub async fn spawn(
        config: &Config,
        broker: Arc<dyn Broker>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Result<Self> {
        let client = config.broker_client_config();
        broker.connect(&config.broker.seed_peers, &client).await?;
        let coordinator_client = config.coordinator_client_config();
        coordinator
            .connect(&config.coordinator.seed_peers, &coordinator_client)
            .await?;

        let (sender, receiver) = mpsc::channel(config.channel_buffer_size);
        let (lifecycle, guard) = StopHandle::new();
        let actor = ConsumerActor {
            receiver,
            broker,
            coordinator,
            coordinator_client,
            settings: config.consumer.clone(),
            commit_interval: client.consumer.offsets_commit_interval,
            registrations: HashMap::new(),
            waiters: VecDeque::new(),
            first_message_fetched: config.testing.first_message_fetched.clone(),
        };
        tokio::spawn(actor.run(guard));
        Ok(Self { sender, lifecycle })
    }

    /// Returns the next message of `topic` for `group`, waiting up to the
    /// long polling timeout for one to arrive.
    pub async fn consume(&self, group: impl Into<String>, topic: impl Into<String>) -> Result<ConsumedMessage> {
        if self.lifecycle.is_requested() {
            return Err(Error::Stopped(NAME));
        }
        let (respond_to, response) = oneshot::channel();
        let request = ConsumeRequest {
            group: group.into(),
            topic: topic.into(),
            respond_to,
        };
        self.sender
            .send(request)
            .await
            .map_err(|_| Error::Stopped(NAME))?;
        response.await.map_err(|_| Error::Stopped(NAME))?
    }
}

#[async_trait]
impl Backend for Consumer {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

type RegistrationKey = (String, String);

struct Registration {
    partitions: Vec<Partition>,
    /// Next offset to hand out, per partition.
    positions: HashMap<Partition, Offset>,
    dirty: bool,
    settle_until: Instant,
    last_used: Instant,
    next_partition: usize,
    fetched_any: bool,
}

struct Waiter {
    key: RegistrationKey,
    deadline: Instant,
    respond_to: Reply,
}

struct ConsumerActor {
    receiver: mpsc::Receiver<ConsumeRequest>,
    broker: Arc<dyn Broker>,
    coordinator: Arc<dyn Coordinator>,
    coordinator_client: CoordinatorClientConfig,
    settings: ConsumerConfig,
    commit_interval: Duration,
    registrations: HashMap<RegistrationKey, Registration>,
    waiters: VecDeque<Waiter>,
    first_message_fetched: Option<mpsc::UnboundedSender<(String, String)>>,
}

impl ConsumerActor {
    async fn run(mut self, guard: StopGuard) {
        info!(
            long_polling_timeout = ?self.settings.long_polling_timeout,
            registration_timeout = ?self.settings.registration_timeout,
            "Consumer started"
        );
        let mut retry = tokio::time::interval(self.settings.back_off_timeout.max(Duration::from_millis(1)));
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commit = tokio::time::interval(self.commit_interval);
        commit.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = guard.requested().cancelled() => break,
                request = self.receiver.recv() => {
                    let Some(request) = request else { break };
                    self.handle(request).await;
                }
                _ = retry.tick() => {
                    self.serve_waiters().await;
                    self.expire_registrations().await;
                }
                _ = commit.tick() => self.commit_offsets().await,
            }
        }

        self.receiver.close();
        while let Some(request) = self.receiver.recv().await {
            let _ = request.respond_to.send(Err(Error::Stopped(NAME)));
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.respond_to.send(Err(Error::Stopped(NAME)));
        }
        self.commit_offsets().await;
        info!(registrations = self.registrations.len(), "Consumer stopped");
    }

    async fn handle(&mut self, request: ConsumeRequest) {
        let ConsumeRequest {
            group,
            topic,
            respond_to,
        } = request;
        let key = (group, topic);
        if !self.registrations.contains_key(&key) {
            match self.register(&key).await {
                Ok(registration) => {
                    self.registrations.insert(key.clone(), registration);
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                    return;
                }
            }
        }

        match self.try_fetch(&key).await {
            Ok(Some(message)) => {
                let _ = respond_to.send(Ok(message));
            }
            Ok(None) => {
                debug!(group = %key.0, topic = %key.1, "Parking consume request");
                self.waiters.push_back(Waiter {
                    key,
                    deadline: Instant::now() + self.settings.long_polling_timeout,
                    respond_to,
                });
            }
            Err(err) => {
                let _ = respond_to.send(Err(err));
            }
        }
    }

    async fn register(&self, key: &RegistrationKey) -> Result<Registration> {
        let (group, topic) = key;
        let partitions = self.broker.partitions(topic).await?;
        let mut positions = HashMap::with_capacity(partitions.len());
        for &partition in &partitions {
            let committed = cluster::committed_offset(
                self.coordinator.as_ref(),
                &self.coordinator_client,
                group,
                topic,
                partition,
            )
            .await?;
            let position = match committed {
                Some(offset) => offset,
                None => self.broker.offset_range(topic, partition).await?.oldest,
            };
            positions.insert(partition, position);
        }
        info!(%group, %topic, partitions = partitions.len(), "Registered");
        let now = Instant::now();
        Ok(Registration {
            partitions,
            positions,
            dirty: false,
            settle_until: now + self.settings.rebalance_delay,
            last_used: now,
            next_partition: 0,
            fetched_any: false,
        })
    }

    /// Fetches one message, visiting partitions round-robin.
    async fn try_fetch(&mut self, key: &RegistrationKey) -> Result<Option<ConsumedMessage>> {
        let broker = Arc::clone(&self.broker);
        let Some(registration) = self.registrations.get_mut(key) else {
            return Ok(None);
        };
        let now = Instant::now();
        registration.last_used = now;
        if now < registration.settle_until || registration.partitions.is_empty() {
            return Ok(None);
        }

        let count = registration.partitions.len();
        for step in 0..count {
            let index = (registration.next_partition + step) % count;
            let partition = registration.partitions[index];
            let position = registration.positions.get(&partition).copied().unwrap_or(0);
            let Some(stored) = broker.fetch(&key.1, partition, position, 1).await?.into_iter().next() else {
                continue;
            };
            registration.positions.insert(partition, stored.offset + 1);
            registration.dirty = true;
            registration.next_partition = (index + 1) % count;
            if !registration.fetched_any {
                registration.fetched_any = true;
                if let Some(hook) = &self.first_message_fetched {
                    let _ = hook.send(key.clone());
                }
            }
            return Ok(Some(ConsumedMessage {
                topic: key.1.clone(),
                partition,
                offset: stored.offset,
                key: stored.key,
                value: stored.value,
            }));
        }
        Ok(None)
    }

    async fn serve_waiters(&mut self) {
        for waiter in std::mem::take(&mut self.waiters) {
            if waiter.respond_to.is_closed() {
                continue;
            }
            match self.try_fetch(&waiter.key).await {
                Ok(Some(message)) => {
                    let _ = waiter.respond_to.send(Ok(message));
                }
                Ok(None) if Instant::now() >= waiter.deadline => {
                    let (group, topic) = waiter.key;
                    let _ = waiter.respond_to.send(Err(Error::LongPollTimeout { group, topic }));
                }
                Ok(None) => self.waiters.push_back(waiter),
                Err(err) => {
                    let _ = waiter.respond_to.send(Err(err));
                }
            }
        }
    }

    async fn expire_registrations(&mut self) {
        let now = Instant::now();
        let expired: Vec<RegistrationKey> = self
            .registrations
            .iter()
            .filter(|(key, registration)| {
                now.duration_since(registration.last_used) >= self.settings.registration_timeout
                    && !self.waiters.iter().any(|waiter| &waiter.key == *key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(mut registration) = self.registrations.remove(&key) {
                self.commit(&key, &mut registration).await;
                info!(group = %key.0, topic = %key.1, "Registration expired");
            }
        }
    }

    async fn commit_offsets(&mut self) {
        let mut registrations = std::mem::take(&mut self.registrations);
        for (key, registration) in registrations.iter_mut() {
            self.commit(key, registration).await;
        }
        self.registrations = registrations;
    }

    async fn commit(&self, key: &RegistrationKey, registration: &mut Registration) {
        if !registration.dirty {
            return;
        }
        let (group, topic) = key;
        for (&partition, &offset) in &registration.positions {
            let path = cluster::offset_path(&self.coordinator_client, group, topic, partition);
            if let Err(err) = self.coordinator.set(&path, offset.to_string()).await {
                warn!(%group, %topic, partition, error = %err, "Offset commit failed");
                return;
            }
        }
        registration.dirty = false;
        debug!(%group, %topic, "Offsets committed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterError, MemoryBroker, MemoryCoordinator, Message};

    struct Fixture {
        config: Config,
        broker: Arc<MemoryBroker>,
        coordinator: Arc<MemoryCoordinator>,
    }

    impl Fixture {
        fn new(partitions: usize) -> Self {
            let broker = Arc::new(MemoryBroker::new());
            broker.create_topic("events", partitions);
            let mut config = Config::default();
            config.consumer.back_off_timeout = Duration::from_millis(10);
            config.consumer.rebalance_delay = Duration::ZERO;
            config.consumer.long_polling_timeout = Duration::from_millis(200);
            Self {
                config,
                broker,
                coordinator: Arc::new(MemoryCoordinator::new()),
            }
        }

        async fn spawn(&self) -> Consumer {
            Consumer::spawn(&self.config, self.broker.clone(), self.coordinator.clone())
                .await
                .unwrap()
        }

        async fn append(&self, partition: Partition, values: &[&str]) {
            let messages = values
                .iter()
                .map(|value| Message::new("events", None, *value))
                .collect();
            self.broker.append("events", partition, messages).await.unwrap();
        }

        async fn committed(&self, group: &str, partition: Partition) -> Option<Offset> {
            let client = self.config.coordinator_client_config();
            cluster::committed_offset(self.coordinator.as_ref(), &client, group, "events", partition)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_consumes_in_order() {
        let fixture = Fixture::new(1);
        fixture.append(0, &["a", "b"]).await;
        let consumer = fixture.spawn().await;

        let first = consumer.consume("g1", "events").await.unwrap();
        let second = consumer.consume("g1", "events").await.unwrap();
        assert_eq!((first.offset, first.value), (0, b"a".to_vec()));
        assert_eq!((second.offset, second.value), (1, b"b".to_vec()));
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_groups_track_positions_independently() {
        let fixture = Fixture::new(1);
        fixture.append(0, &["a"]).await;
        let consumer = fixture.spawn().await;

        assert_eq!(consumer.consume("g1", "events").await.unwrap().offset, 0);
        assert_eq!(consumer.consume("g2", "events").await.unwrap().offset, 0);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_long_poll_times_out_on_empty_topic() {
        let fixture = Fixture::new(2);
        let consumer = fixture.spawn().await;

        let err = consumer.consume("g1", "events").await.unwrap_err();
        assert!(
            matches!(&err, Error::LongPollTimeout { group, topic } if group == "g1" && topic == "events"),
            "{err:?}"
        );
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_parked_request_gets_late_message() {
        let fixture = Fixture::new(1);
        let consumer = fixture.spawn().await;

        let pending = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.consume("g1", "events").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        fixture.append(0, &["late"]).await;

        let message = pending.await.unwrap().unwrap();
        assert_eq!(message.value, b"late".to_vec());
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_commits_positions_and_restart_resumes() {
        let fixture = Fixture::new(1);
        fixture.append(0, &["a", "b", "c"]).await;

        let consumer = fixture.spawn().await;
        consumer.consume("g1", "events").await.unwrap();
        consumer.consume("g1", "events").await.unwrap();
        consumer.stop().await;
        assert_eq!(fixture.committed("g1", 0).await, Some(2));

        let consumer = fixture.spawn().await;
        let resumed = consumer.consume("g1", "events").await.unwrap();
        assert_eq!(resumed.value, b"c".to_vec());
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_first_message_fetched_fires_once_per_registration() {
        let mut fixture = Fixture::new(1);
        let (hook_tx, mut hook_rx) = mpsc::unbounded_channel();
        fixture.config.testing.first_message_fetched = Some(hook_tx);
        fixture.append(0, &["a", "b"]).await;
        let consumer = fixture.spawn().await;

        consumer.consume("g1", "events").await.unwrap();
        consumer.consume("g1", "events").await.unwrap();
        consumer.stop().await;

        assert_eq!(hook_rx.recv().await, Some(("g1".to_string(), "events".to_string())));
        assert!(hook_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_topic_is_reported() {
        let fixture = Fixture::new(1);
        let consumer = fixture.spawn().await;
        let err = consumer.consume("g1", "missing").await.unwrap_err();
        assert!(matches!(err, Error::Cluster(ClusterError::UnknownTopic(_))));
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_fails_parked_requests() {
        let mut fixture = Fixture::new(1);
        fixture.config.consumer.long_polling_timeout = Duration::from_secs(30);
        let consumer = fixture.spawn().await;

        let pending = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.consume("g1", "events").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        consumer.stop().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Stopped("consumer")));
        assert!(matches!(
            consumer.consume("g1", "events").await,
            Err(Error::Stopped("consumer"))
        ));
    }

    #[tokio::test]
    async fn test_spawn_fails_when_coordinator_unreachable() {
        let fixture = Fixture::new(1);
        fixture.coordinator.set_unreachable(true);
        let result = Consumer::spawn(&fixture.config, fixture.broker.clone(), fixture.coordinator.clone()).await;
        assert!(matches!(result, Err(Error::Cluster(ClusterError::Unreachable(_)))));
    }
}
