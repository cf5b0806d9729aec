use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use tracing::{debug, info};

use super::transport::{Delivery, DeliveryTag, EventTransport, TopicBinding};
use crate::config::KafkaConfig;
use crate::error::TransportError;

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka transport with manual offset commits
///
/// `ack` commits past the message. `nack` with requeue seeks the partition
/// back to the message so it is fetched again.
pub struct KafkaTransport {
    config: KafkaConfig,
    consumer: RwLock<Option<Arc<StreamConsumer>>>,
}

impl KafkaTransport {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            consumer: RwLock::new(None),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("group.id", &self.config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", "300000")
            // Pick up newly created topics matching a prefix subscription
            .set("topic.metadata.refresh.interval.ms", "30000");
        client
    }

    fn current(&self) -> Result<Arc<StreamConsumer>, TransportError> {
        self.consumer
            .read()
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

/// Regex subscription for every topic starting with `prefix`
pub fn subscription_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 4);
    pattern.push('^');
    for c in prefix.chars() {
        if "\\.+*?()[]{}|^$".contains(c) {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str(".*");
    pattern
}

fn commit_position(tag: &DeliveryTag, offset: i64) -> Result<TopicPartitionList, TransportError> {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition_offset(&tag.topic, tag.partition, Offset::Offset(offset))
        .map_err(|e| TransportError::Ack(e.to_string()))?;
    Ok(tpl)
}

#[async_trait]
impl EventTransport for KafkaTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let client = self.client_config();

        // librdkafka connects lazily; probe the cluster so an unreachable
        // broker fails the attempt instead of the first receive
        let probe_config = client.clone();
        tokio::task::spawn_blocking(move || {
            let probe: BaseConsumer = probe_config.create()?;
            probe.fetch_metadata(None, METADATA_TIMEOUT).map(|_| ())
        })
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?
        .map_err(|e| TransportError::Connection(e.to_string()))?;

        let consumer: StreamConsumer = client
            .create()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        *self.consumer.write() = Some(Arc::new(consumer));

        info!(
            brokers = %self.config.bootstrap_servers,
            group_id = %self.config.group_id,
            "Connected to Kafka"
        );
        Ok(())
    }

    async fn bind(&self, bindings: &[TopicBinding]) -> Result<(), TransportError> {
        let consumer = self.current()?;
        let patterns: Vec<String> = bindings
            .iter()
            .map(|b| subscription_pattern(&b.prefix))
            .collect();
        let topics: Vec<&str> = patterns.iter().map(String::as_str).collect();

        consumer
            .subscribe(&topics)
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        info!(patterns = ?patterns, "Subscribed to Kafka topics");
        Ok(())
    }

    async fn next_delivery(&self) -> Result<Option<Delivery>, TransportError> {
        let consumer = self.current()?;
        let message = consumer
            .recv()
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;

        let topic = message.topic().to_string();
        let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
        if payload.is_empty() {
            debug!(topic = %topic, offset = message.offset(), "Received message with empty payload");
        }

        Ok(Some(Delivery {
            tag: DeliveryTag {
                topic: topic.clone(),
                partition: message.partition(),
                offset: message.offset(),
            },
            topic,
            payload,
            redelivered: false,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let consumer = self.current()?;
        let tpl = commit_position(&delivery.tag, delivery.tag.offset + 1)?;
        consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| TransportError::Ack(e.to_string()))
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        if !requeue {
            return self.ack(delivery).await;
        }
        let consumer = self.current()?;
        let tag = &delivery.tag;
        // Zero timeout makes the seek asynchronous
        consumer
            .seek(&tag.topic, tag.partition, Offset::Offset(tag.offset), Duration::ZERO)
            .map_err(|e| TransportError::Ack(e.to_string()))
    }

    fn disconnect(&self) {
        if let Some(consumer) = self.consumer.write().take() {
            consumer.unsubscribe();
            info!("Disconnected from Kafka");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_pattern_escapes_prefix() {
        assert_eq!(subscription_pattern("job."), "^job\\..*");
        assert_eq!(subscription_pattern("profile."), "^profile\\..*");
        assert_eq!(subscription_pattern("a+b"), "^a\\+b.*");
    }

    #[test]
    fn test_commit_position_targets_partition() {
        let tag = DeliveryTag {
            topic: "job.created".into(),
            partition: 3,
            offset: 41,
        };
        let tpl = commit_position(&tag, 42).unwrap();
        let elem = tpl.find_partition("job.created", 3).unwrap();
        assert_eq!(elem.offset(), Offset::Offset(42));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let transport = KafkaTransport::new(KafkaConfig {
            bootstrap_servers: "localhost:9092".into(),
            group_id: "test".into(),
            job_topic_prefix: "job.".into(),
            profile_topic_prefix: "profile.".into(),
            session_timeout_ms: 6000,
            max_redeliveries: 0,
        });
        assert!(matches!(
            transport.next_delivery().await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.bind(&[TopicBinding::prefix("job.")]).await,
            Err(TransportError::NotConnected)
        ));
    }
}
