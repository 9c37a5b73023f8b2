use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domains::message::Message;
use crate::error::{ForemanBotError, Result};
use crate::interfaces::transport::Transport;
use crate::services::registry::CommandRegistry;

pub fn command_channel(server_key: &str) -> String {
    format!("cmd:{server_key}")
}

/// The response channel is derived from the command id, so the channel name
/// itself is the correlation carrier and replies need no in-band field.
pub fn response_channel(server_key: &str, command_id: &str) -> String {
    format!("resp:{server_key}:{command_id}")
}

/// Redis Pub/Sub adapter. Each call subscribes to its per-command response
/// channel before the command is published; a spawned task waits for the
/// single reply, resolves the registry, and unsubscribes. Delivery is
/// at-most-once and unordered relative to other commands.
pub struct PubSubTransport {
    client: redis::Client,
    conn: ConnectionManager,
    registry: Arc<CommandRegistry>,
    shutdown: watch::Sender<bool>,
}

impl PubSubTransport {
    pub async fn connect(url: &str, registry: Arc<CommandRegistry>) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| ForemanBotError::Config(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| ForemanBotError::Config(e.to_string()))?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client,
            conn,
            registry,
            shutdown,
        })
    }
}

#[async_trait]
impl Transport for PubSubTransport {
    fn name(&self) -> &'static str {
        "pubsub"
    }

    async fn publish(&self, server_key: &str, message: &Message, timeout: Duration) -> Result<()> {
        let payload = message.encode()?;

        // Subscribe before publishing so the reply cannot slip past us.
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ForemanBotError::TransportUnavailable(e.to_string()))?;
        let channel = response_channel(server_key, &message.id);
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| ForemanBotError::TransportUnavailable(e.to_string()))?;

        let registry = self.registry.clone();
        let command_id = message.id.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let received = {
                let mut stream = pubsub.on_message();
                tokio::select! {
                    _ = shutdown.changed() => None,
                    _ = tokio::time::sleep(timeout) => None,
                    msg = stream.next() => msg,
                }
            };
            if let Some(msg) = received {
                let decoded = msg
                    .get_payload::<Vec<u8>>()
                    .map_err(|e| ForemanBotError::Decode(e.to_string()))
                    .and_then(|raw| Message::decode(&raw));
                match decoded {
                    Ok(reply) => {
                        if !registry.resolve(&command_id, reply) {
                            debug!(%command_id, "pub/sub reply had no waiter, dropped");
                        }
                    }
                    Err(err) => {
                        warn!(%command_id, error = %err, "undecodable pub/sub reply, dropped")
                    }
                }
            }
            let _ = pubsub.unsubscribe(&channel).await;
        });

        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(command_channel(server_key), payload)
            .await
            .map_err(|e| ForemanBotError::PublishFailure(e.to_string()))?;
        debug!(
            command_id = %message.id,
            channel = %command_channel(server_key),
            receivers,
            "command published over pub/sub"
        );
        Ok(())
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_derive_from_key_and_id() {
        assert_eq!(command_channel("k1"), "cmd:k1");
        assert_eq!(response_channel("k1", "abc"), "resp:k1:abc");
    }
}
