use super::connection_string::EventHubConnection;
use super::publisher::{Message, Publisher};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, info};

const QUEUE_TIMEOUT: Duration = Duration::from_secs(30);

/// Publishes batches to an event hub through the namespace's Kafka endpoint.
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(connection: &EventHubConnection) -> Result<Self> {
        info!(
            bootstrap_servers = %connection.bootstrap_servers(),
            topic = %connection.entity_path(),
            "Creating Event Hubs producer"
        );

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", connection.bootstrap_servers())
            .set("security.protocol", "SASL_SSL")
            .set("sasl.mechanism", "PLAIN")
            .set("sasl.username", "$ConnectionString")
            .set("sasl.password", connection.connection_string())
            .set("acks", "all")
            .set("message.timeout.ms", "60000")
            .create()
            .map_err(Error::Kafka)?;

        Ok(Self {
            producer,
            topic: connection.entity_path().to_string(),
        })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, batch: Vec<Message>) -> Result<()> {
        let sends = batch.iter().map(|message| {
            let mut record =
                FutureRecord::<str, [u8]>::to(&self.topic).payload(message.payload.as_ref());
            if let Some(key) = &message.key {
                record = record.key(key.as_str());
            }
            self.producer.send(record, Timeout::After(QUEUE_TIMEOUT))
        });

        let mut delivered = 0usize;
        for result in join_all(sends).await {
            result.map_err(|(e, _)| {
                Error::Publish(format!(
                    "event hub rejected message {} of {}: {}",
                    delivered + 1,
                    batch.len(),
                    e
                ))
            })?;
            delivered += 1;
        }

        debug!("Delivered {} messages to '{}'", delivered, self.topic);
        Ok(())
    }
}
