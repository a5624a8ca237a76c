//! # Producer
//!
//! The producer is an actor: [`Producer`] handles are cheap to clone and only
//! hold the sending half of a request channel, while a single background task
//! owns the buffer of messages waiting to be written to the broker.
//!
//! ```text
//! Producer::produce ──┐                          ┌── flush every flush_frequency
//! Producer::produce ──┼─► mpsc ─► ProducerActor ─┤
//! async_produce ──────┘            (buffer)      └── flush when flush_bytes buffered
//!                                                         │
//!                                                         ▼
//!                                           Broker::append (retry_max retries,
//!                                                           retry_backoff apart)
//! ```
//!
//! On stop the actor stops taking requests and abandons any retry in
//! progress, then keeps flushing for at most `producer.shutdown_timeout`. Whatever is still buffered after that fails
//! its caller and is reported as a dead message.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{Broker, ClusterError, Message, Offset, Partition};
use crate::config::{Config, ProducerClientConfig};
use crate::error::{Error, Result};
use crate::framework::{Backend, StopGuard, StopHandle};

const NAME: &str = "producer";

/// Where a message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub partition: Partition,
    pub offset: Offset,
}

type Reply = oneshot::Sender<Result<Delivery>>;

#[derive(Debug)]
struct ProduceRequest {
    message: Message,
    respond_to: Option<Reply>,
}

/// Handle to the producer actor.
#[derive(Clone)]
pub struct Producer {
    sender: mpsc::Sender<ProduceRequest>,
    lifecycle: StopHandle,
}

impl Producer {
    /// Connects to the broker and starts the producer actor.
    pub async fn spawn(config: &Config, broker: Arc<dyn Broker>) -> Result<Self> {
        let client = config.broker_client_config();
        broker.connect(&config.broker.seed_peers, &client).await?;

        let (sender, receiver) = mpsc::channel(config.channel_buffer_size);
        let (lifecycle, guard) = StopHandle::new();
        let actor = ProducerActor {
            receiver,
            broker,
            settings: client.producer,
            shutdown_timeout: config.producer.shutdown_timeout,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            round_robin: HashMap::new(),
            dead_messages: config.testing.dead_messages.clone(),
        };
        tokio::spawn(actor.run(guard));
        Ok(Self { sender, lifecycle })
    }

    /// Produces a message and waits until the broker acknowledged it.
    pub async fn produce(
        &self,
        topic: impl Into<String>,
        key: Option<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<Delivery> {
        let (respond_to, response) = oneshot::channel();
        self.submit(Message::new(topic, key, value), Some(respond_to))
            .await?;
        response.await.map_err(|_| Error::Stopped(NAME))?
    }

    /// Queues a message for delivery without waiting for the broker.
    pub async fn async_produce(
        &self,
        topic: impl Into<String>,
        key: Option<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.submit(Message::new(topic, key, value), None).await
    }

    async fn submit(&self, message: Message, respond_to: Option<Reply>) -> Result<()> {
        if self.lifecycle.is_requested() {
            return Err(Error::Stopped(NAME));
        }
        self.sender
            .send(ProduceRequest {
                message,
                respond_to,
            })
            .await
            .map_err(|_| Error::Stopped(NAME))
    }
}

#[async_trait]
impl Backend for Producer {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

struct Pending {
    message: Message,
    respond_to: Option<Reply>,
}

struct ProducerActor {
    receiver: mpsc::Receiver<ProduceRequest>,
    broker: Arc<dyn Broker>,
    settings: ProducerClientConfig,
    shutdown_timeout: Duration,
    /// Buffered messages per (topic, partition), in arrival order.
    pending: BTreeMap<(String, Partition), Vec<Pending>>,
    pending_bytes: usize,
    round_robin: HashMap<String, usize>,
    dead_messages: Option<mpsc::UnboundedSender<Message>>,
}

impl ProducerActor {
    async fn run(mut self, guard: StopGuard) {
        info!(
            flush_frequency = ?self.settings.flush_frequency,
            flush_bytes = self.settings.flush_bytes,
            "Producer started"
        );
        let mut ticker = tokio::time::interval(self.settings.flush_frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = guard.requested().cancelled() => break,
                request = self.receiver.recv() => {
                    let Some(request) = request else { break };
                    self.enqueue(request).await;
                    if self.pending_bytes >= self.settings.flush_bytes {
                        self.flush(Some(guard.requested())).await;
                    }
                }
                _ = ticker.tick() => self.flush(Some(guard.requested())).await,
            }
        }

        // Take in whatever was submitted before the stop, then flush it all.
        self.receiver.close();
        while let Some(request) = self.receiver.recv().await {
            self.enqueue(request).await;
        }
        let buffered = self.pending.values().map(Vec::len).sum::<usize>();
        info!(buffered, timeout = ?self.shutdown_timeout, "Producer flushing before stop");
        if tokio::time::timeout(self.shutdown_timeout, self.flush(None))
            .await
            .is_err()
        {
            warn!(timeout = ?self.shutdown_timeout, "Producer shutdown timeout expired");
        }
        self.discard_pending();
        info!("Producer stopped");
    }

    async fn enqueue(&mut self, request: ProduceRequest) {
        let ProduceRequest {
            message,
            respond_to,
        } = request;
        let partitions = match self.broker.partitions(&message.topic).await {
            Ok(partitions) if !partitions.is_empty() => partitions,
            Ok(_) => {
                let err = ClusterError::UnknownTopic(message.topic.clone());
                self.fail(Pending { message, respond_to }, Error::Cluster(err));
                return;
            }
            Err(err) => {
                self.fail(Pending { message, respond_to }, Error::Cluster(err));
                return;
            }
        };
        let partition = self.choose_partition(&message, &partitions);
        debug!(topic = %message.topic, partition, size = message.size(), "Buffered");
        self.pending_bytes += message.size();
        self.pending
            .entry((message.topic.clone(), partition))
            .or_default()
            .push(Pending {
                message,
                respond_to,
            });
    }

    /// Keyed messages always land on the same partition, the rest rotate.
    fn choose_partition(&mut self, message: &Message, partitions: &[Partition]) -> Partition {
        let index = match &message.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % partitions.len() as u64) as usize
            }
            None => {
                let next = self.round_robin.entry(message.topic.clone()).or_insert(0);
                let index = *next % partitions.len();
                *next = next.wrapping_add(1);
                index
            }
        };
        partitions[index]
    }

    /// Writes every buffered batch. A cancelled `stop` leaves the current
    /// batch and everything after it buffered.
    async fn flush(&mut self, stop: Option<&CancellationToken>) {
        while let Some(key) = self.pending.keys().next().cloned() {
            let (topic, partition) = &key;
            let messages: Vec<Message> = self.pending[&key]
                .iter()
                .map(|pending| pending.message.clone())
                .collect();
            let count = messages.len();
            let result = match self.append_with_retries(topic, *partition, messages, stop).await {
                Attempt::Appended(base) => Ok(base),
                Attempt::Failed(attempts, source) => Err((attempts, source)),
                Attempt::Interrupted => {
                    debug!(%topic, partition, count, "Flush interrupted by stop");
                    return;
                }
            };

            let batch = self.pending.remove(&key).unwrap_or_default();
            let bytes: usize = batch.iter().map(|pending| pending.message.size()).sum();
            self.pending_bytes = self.pending_bytes.saturating_sub(bytes);
            match result {
                Ok(base) => {
                    debug!(%topic, partition, base, count, "Flushed");
                    for (i, pending) in batch.into_iter().enumerate() {
                        if let Some(respond_to) = pending.respond_to {
                            let _ = respond_to.send(Ok(Delivery {
                                partition: *partition,
                                offset: base + i as Offset,
                            }));
                        }
                    }
                }
                Err((attempts, source)) => {
                    for pending in batch {
                        let err = Error::Delivery {
                            attempts,
                            source: source.clone(),
                        };
                        self.fail(pending, err);
                    }
                }
            }
        }
    }

    async fn append_with_retries(
        &self,
        topic: &str,
        partition: Partition,
        messages: Vec<Message>,
        stop: Option<&CancellationToken>,
    ) -> Attempt {
        let max_attempts = self.settings.retry_max + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = stopped(stop) => return Attempt::Interrupted,
                result = self.broker.append(topic, partition, messages.clone()) => result,
            };
            match result {
                Ok(base) => return Attempt::Appended(base),
                Err(err) if attempt < max_attempts && is_retriable(&err) => {
                    warn!(%topic, partition, attempt, error = %err, "Produce failed, retrying");
                    tokio::select! {
                        _ = stopped(stop) => return Attempt::Interrupted,
                        _ = tokio::time::sleep(self.settings.retry_backoff) => {}
                    }
                }
                Err(err) => return Attempt::Failed(attempt, err),
            }
        }
    }

    fn fail(&self, pending: Pending, err: Error) {
        warn!(topic = %pending.message.topic, error = %err, "Message not delivered");
        if let Some(dead_messages) = &self.dead_messages {
            let _ = dead_messages.send(pending.message);
        }
        if let Some(respond_to) = pending.respond_to {
            let _ = respond_to.send(Err(err));
        }
    }

    fn discard_pending(&mut self) {
        for pending in std::mem::take(&mut self.pending).into_values().flatten() {
            self.fail(pending, Error::Stopped(NAME));
        }
        self.pending_bytes = 0;
    }
}

enum Attempt {
    Appended(Offset),
    Failed(usize, ClusterError),
    Interrupted,
}

/// Resolves once `stop` is cancelled. Never resolves without a token.
async fn stopped(stop: Option<&CancellationToken>) {
    match stop {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn is_retriable(err: &ClusterError) -> bool {
    matches!(err, ClusterError::Unavailable(_) | ClusterError::Unreachable(_))
}
