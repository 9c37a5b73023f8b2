use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::Message as KafkaPayload;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domains::message::Message;
use crate::error::{ForemanBotError, Result};
use crate::interfaces::transport::Transport;
use crate::services::registry::CommandRegistry;

pub fn command_topic(server_key: &str) -> String {
    format!("cmd.{server_key}")
}

pub const COMMAND_ID_HEADER: &str = "command_id";
pub const SERVER_KEY_HEADER: &str = "server_key";

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Partitioned-topic adapter. Commands go to one topic per server, keyed by
/// the server key so partition assignment stays stable; the correlation id
/// travels as a record header. Responses arrive on a shared topic read by a
/// consumer group that commits offsets on an interval, so records can be
/// redelivered after a crash and resolution stays idempotent.
pub struct KafkaTransport {
    producer: FutureProducer,
    shutdown: watch::Sender<bool>,
}

pub struct KafkaSettings {
    pub brokers: String,
    pub response_topic: String,
    pub group_id: String,
    pub compression: String,
    pub commit_interval_ms: u64,
}

impl KafkaTransport {
    pub fn connect(settings: &KafkaSettings, registry: Arc<CommandRegistry>) -> Result<Self> {
        // queue.buffering.max.ms=0 sends commands immediately instead of
        // batching; command latency matters more than throughput here.
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("message.timeout.ms", "5000")
            .set("queue.buffering.max.ms", "0")
            .set("compression.type", &settings.compression)
            .create()
            .map_err(|e| ForemanBotError::Config(e.to_string()))?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("group.id", &settings.group_id)
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "10000")
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                settings.commit_interval_ms.to_string(),
            )
            .create()
            .map_err(|e| ForemanBotError::Config(e.to_string()))?;
        consumer
            .subscribe(&[settings.response_topic.as_str()])
            .map_err(|e| ForemanBotError::Config(e.to_string()))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_receive_loop(consumer, registry, shutdown_rx));

        Ok(Self { producer, shutdown })
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn publish(&self, server_key: &str, message: &Message, _timeout: Duration) -> Result<()> {
        let payload = message.encode()?;
        let topic = command_topic(server_key);
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: COMMAND_ID_HEADER,
                value: Some(message.id.as_str()),
            })
            .insert(Header {
                key: SERVER_KEY_HEADER,
                value: Some(server_key),
            });
        let record = FutureRecord::to(&topic)
            .key(server_key)
            .payload(&payload)
            .headers(headers);
        let _delivery = self
            .producer
            .send(record, DELIVERY_TIMEOUT)
            .await
            .map_err(|(err, _)| ForemanBotError::PublishFailure(err.to_string()))?;
        debug!(command_id = %message.id, %topic, "command published to topic");
        Ok(())
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
        let _ = self.producer.flush(DELIVERY_TIMEOUT);
    }
}

async fn run_receive_loop(
    consumer: StreamConsumer,
    registry: Arc<CommandRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            r = consumer.recv() => r,
        };
        match received {
            Ok(record) => handle_record(&registry, &record),
            Err(err) => {
                warn!(error = %err, "response topic read failed");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
    debug!("topic receive loop stopped");
}

fn handle_record(registry: &CommandRegistry, record: &rdkafka::message::BorrowedMessage<'_>) {
    let command_id = record.headers().and_then(|headers| {
        headers
            .iter()
            .find(|h| h.key == COMMAND_ID_HEADER)
            .and_then(|h| h.value)
            .map(|v| String::from_utf8_lossy(v).to_string())
    });
    let Some(command_id) = command_id else {
        debug!("response record without command_id header, dropped");
        return;
    };
    let Some(raw) = record.payload() else {
        debug!(%command_id, "response record without payload, dropped");
        return;
    };
    match Message::decode(raw) {
        Ok(reply) => {
            if !registry.resolve(&command_id, reply) {
                debug!(%command_id, "response record had no waiter, dropped");
            }
        }
        Err(err) => warn!(%command_id, error = %err, "undecodable response record, dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_derive_from_key() {
        assert_eq!(command_topic("k1"), "cmd.k1");
    }
}
