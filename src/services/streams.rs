use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

use crate::domains::message::Message;
use crate::error::{ForemanBotError, Result};
use crate::interfaces::transport::Transport;
use crate::services::registry::CommandRegistry;

pub fn command_stream(server_key: &str) -> String {
    format!("stream:cmd:{server_key}")
}

pub fn response_stream(server_key: &str) -> String {
    format!("stream:resp:{server_key}")
}

const IDLE_POLL: Duration = Duration::from_millis(250);
const READ_BLOCK_MS: usize = 1000;
const READ_COUNT: usize = 32;

/// Redis Streams adapter: one command log and one response log per server.
/// Commands are appended with approximate MAXLEN trimming; a consumer group
/// tails the response logs, extracts the `command_id` field from each entry
/// and acknowledges it after the hand-off attempt. Redelivery of an id that
/// was already resolved is a no-op at the registry.
pub struct LogStreamTransport {
    conn: ConnectionManager,
    group: String,
    max_len: usize,
    watched: Arc<RwLock<HashSet<String>>>,
    shutdown: watch::Sender<bool>,
}

impl LogStreamTransport {
    pub async fn connect(
        url: &str,
        group: &str,
        consumer: &str,
        max_len: usize,
        registry: Arc<CommandRegistry>,
    ) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| ForemanBotError::Config(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| ForemanBotError::Config(e.to_string()))?;
        let watched = Arc::new(RwLock::new(HashSet::new()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_receive_loop(
            conn.clone(),
            registry,
            watched.clone(),
            group.to_string(),
            consumer.to_string(),
            shutdown_rx,
        ));

        Ok(Self {
            conn,
            group: group.to_string(),
            max_len,
            watched,
            shutdown,
        })
    }

    /// Creates the response-stream consumer group the first time a server is
    /// addressed and adds the key to the receive loop's watch set.
    async fn ensure_watched(&self, server_key: &str) -> Result<()> {
        {
            let watched = self.watched.read().await;
            if watched.contains(server_key) {
                return Ok(());
            }
        }
        let stream = response_stream(server_key);
        let mut conn = self.conn.clone();
        let created: std::result::Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(&stream, &self.group, "$")
            .await;
        if let Err(err) = created {
            if err.code() != Some("BUSYGROUP") {
                return Err(ForemanBotError::TransportUnavailable(err.to_string()));
            }
        }
        self.watched.write().await.insert(server_key.to_string());
        Ok(())
    }
}

#[async_trait]
impl Transport for LogStreamTransport {
    fn name(&self) -> &'static str {
        "streams"
    }

    async fn publish(&self, server_key: &str, message: &Message, _timeout: Duration) -> Result<()> {
        let payload = message.encode()?;
        self.ensure_watched(server_key).await?;

        let fields: [(&str, Vec<u8>); 2] = [
            ("command_id", message.id.as_bytes().to_vec()),
            ("payload", payload),
        ];
        let mut conn = self.conn.clone();
        let entry_id: String = conn
            .xadd_maxlen(
                command_stream(server_key),
                StreamMaxlen::Approx(self.max_len),
                "*",
                &fields,
            )
            .await
            .map_err(|e| ForemanBotError::PublishFailure(e.to_string()))?;
        debug!(
            command_id = %message.id,
            stream = %command_stream(server_key),
            %entry_id,
            "command appended to stream"
        );
        Ok(())
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run_receive_loop(
    mut conn: ConnectionManager,
    registry: Arc<CommandRegistry>,
    watched: Arc<RwLock<HashSet<String>>>,
    group: String,
    consumer: String,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let keys: Vec<String> = {
            let watched = watched.read().await;
            watched.iter().map(|k| response_stream(k)).collect()
        };
        if keys.is_empty() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
            continue;
        }

        let ids: Vec<&str> = keys.iter().map(|_| ">").collect();
        let opts = StreamReadOptions::default()
            .group(&group, &consumer)
            .block(READ_BLOCK_MS)
            .count(READ_COUNT);
        let read = conn.xread_options::<_, _, StreamReadReply>(&keys, &ids, &opts);
        let reply = tokio::select! {
            _ = shutdown.changed() => break,
            r = read => r,
        };
        match reply {
            Ok(batch) => {
                for stream_key in batch.keys {
                    for entry in &stream_key.ids {
                        // one bad entry must not take the loop down
                        if let Err(err) =
                            handle_entry(&mut conn, &registry, &group, &stream_key.key, entry).await
                        {
                            warn!(
                                stream = %stream_key.key,
                                entry = %entry.id,
                                error = %err,
                                "failed to handle response entry"
                            );
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "stream read failed");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
    debug!("stream receive loop stopped");
}

/// Resolves the waiter for one response entry, then acknowledges it. Entries
/// that cannot be attributed to a command are logged and acknowledged so they
/// do not sit in the pending list forever; a crash between read and ack
/// leaves the entry pending for redelivery, which the registry tolerates.
async fn handle_entry(
    conn: &mut ConnectionManager,
    registry: &CommandRegistry,
    group: &str,
    stream_key: &str,
    entry: &StreamId,
) -> Result<()> {
    let command_id: Option<String> = entry.get("command_id");
    let raw: Option<Vec<u8>> = entry.get("payload");
    match (command_id, raw) {
        (Some(command_id), Some(raw)) => match Message::decode(&raw) {
            Ok(message) => {
                if !registry.resolve(&command_id, message) {
                    debug!(%command_id, "response entry had no waiter, dropped");
                }
            }
            Err(err) => warn!(%command_id, error = %err, "undecodable response entry, dropped"),
        },
        _ => debug!(entry = %entry.id, "response entry without command_id/payload, dropped"),
    }

    let _acked: i64 = conn
        .xack(stream_key, group, &[entry.id.as_str()])
        .await
        .map_err(|e| ForemanBotError::Runtime(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_names_derive_from_key() {
        assert_eq!(command_stream("k1"), "stream:cmd:k1");
        assert_eq!(response_stream("k1"), "stream:resp:k1");
    }
}
