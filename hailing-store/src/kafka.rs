use async_trait::async_trait;
use hailing_core::messaging::{Acknowledger, Delivery, MessageBus, Subscription};
use hailing_core::{CoreResult, DispatchError, Event};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::app_config::BusConfig;
use crate::offsets::OffsetTracker;

const ATTEMPT_HEADER: &str = "attempt";

/// Every event topic URI travels on one Kafka topic; the URI is part of
/// the serialized event.
#[derive(Clone)]
pub struct KafkaBus {
    producer: FutureProducer,
    topic: String,
}

impl KafkaBus {
    pub fn new(config: &BusConfig) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self { producer, topic: config.topic.clone() })
    }

    async fn send(&self, event: &Event, attempt: u32) -> CoreResult<()> {
        let payload = serde_json::to_string(event)?;
        let key = event.id.to_string();
        let attempt = attempt.to_string();
        let headers = OwnedHeaders::new().insert(Header { key: ATTEMPT_HEADER, value: Some(attempt.as_str()) });
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload).headers(headers);

        match self.producer.send(record, Timeout::After(Duration::from_secs(5))).await {
            Ok(delivery) => {
                info!(
                    "Sent {} ({}) to {}: partition {} offset {}",
                    event.id, event.topic, self.topic, delivery.partition, delivery.offset
                );
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to send {} to {}: {}", event.id, self.topic, e);
                Err(DispatchError::external(e))
            }
        }
    }
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn publish(&self, event: &Event) -> CoreResult<()> {
        self.send(event, 1).await
    }
}

/// Manual-commit consumer. Delays are not enforced here: process events
/// wait for their desired time inside the handler. Deliveries settle in any
/// order; a partition's offset only advances past messages that all settled.
pub struct KafkaSubscription {
    consumer: Arc<StreamConsumer>,
    bus: KafkaBus,
    offsets: Arc<Mutex<OffsetTracker>>,
}

impl KafkaSubscription {
    pub fn new(config: &BusConfig, bus: KafkaBus) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()?;

        consumer.subscribe(&[config.topic.as_str()])?;
        info!("Subscribed to {} as group {}", config.topic, config.group_id);

        Ok(Self {
            consumer: Arc::new(consumer),
            bus,
            offsets: Arc::new(Mutex::new(OffsetTracker::default())),
        })
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn receive(&mut self) -> CoreResult<Option<Delivery>> {
        loop {
            let (position, attempt, decoded) = {
                let message = self.consumer.recv().await.map_err(DispatchError::external)?;
                let position = CommitPosition {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                };

                let attempt = message
                    .headers()
                    .and_then(|headers| {
                        headers
                            .iter()
                            .find(|h| h.key == ATTEMPT_HEADER)
                            .and_then(|h| h.value)
                            .and_then(|v| std::str::from_utf8(v).ok())
                            .and_then(|v| v.parse::<u32>().ok())
                    })
                    .unwrap_or(1);

                let decoded = message
                    .payload()
                    .ok_or_else(|| "message has no payload".to_string())
                    .and_then(|p| serde_json::from_slice::<Event>(p).map_err(|e| e.to_string()));
                (position, attempt, decoded)
            };
            self.offsets
                .lock()
                .await
                .track(&position.topic, position.partition, position.offset);

            match decoded {
                Ok(event) => {
                    let acker = KafkaAcker {
                        consumer: self.consumer.clone(),
                        bus: self.bus.clone(),
                        offsets: self.offsets.clone(),
                        position,
                        event: event.clone(),
                        attempt,
                    };
                    return Ok(Some(Delivery::new(event, attempt, Box::new(acker))));
                }
                Err(reason) => {
                    // undecodable messages can never be handled
                    warn!(
                        "Skipping undecodable message at {}/{}@{}: {}",
                        position.topic, position.partition, position.offset, reason
                    );
                    position.finish(&self.consumer, &self.offsets).await?;
                }
            }
        }
    }
}

struct CommitPosition {
    topic: String,
    partition: i32,
    offset: i64,
}

impl CommitPosition {
    /// Settles this offset and commits whatever contiguous prefix it completes
    async fn finish(&self, consumer: &StreamConsumer, offsets: &Mutex<OffsetTracker>) -> CoreResult<()> {
        let next = offsets.lock().await.finish(&self.topic, self.partition, self.offset);
        let Some(next) = next else {
            return Ok(());
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, Offset::Offset(next))
            .map_err(DispatchError::external)?;
        consumer.commit(&tpl, CommitMode::Async).map_err(DispatchError::external)
    }
}

struct KafkaAcker {
    consumer: Arc<StreamConsumer>,
    bus: KafkaBus,
    offsets: Arc<Mutex<OffsetTracker>>,
    position: CommitPosition,
    event: Event,
    attempt: u32,
}

#[async_trait]
impl Acknowledger for KafkaAcker {
    async fn ack(self: Box<Self>) -> CoreResult<()> {
        self.position.finish(&self.consumer, &self.offsets).await
    }

    /// Re-publishes with the next attempt number, then settles the original
    async fn nack(self: Box<Self>) -> CoreResult<()> {
        self.bus.send(&self.event, self.attempt + 1).await?;
        self.position.finish(&self.consumer, &self.offsets).await
    }
}
