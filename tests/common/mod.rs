#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use foreman_bot::domains::message::{Message, MessageType};
use foreman_bot::error::{ForemanBotError, Result};
use foreman_bot::interfaces::transport::Transport;
use foreman_bot::services::registry::CommandRegistry;

pub enum MockBehavior {
    /// Accepts the publish and never produces a reply.
    Accept,
    /// Client never initialized.
    Unavailable,
    /// Initialized client, write error.
    FailPublish,
    /// Accepts the publish and resolves the registry with a reply of the
    /// given kind after a short delay, like a real receive loop would.
    Reply {
        registry: Arc<CommandRegistry>,
        kind: MessageType,
        payload: Value,
    },
}

pub struct MockTransport {
    label: &'static str,
    behavior: MockBehavior,
    publishes: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new(label: &'static str, behavior: MockBehavior) -> Self {
        Self {
            label,
            behavior,
            publishes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn publishes(&self) -> Arc<AtomicUsize> {
        self.publishes.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn publish(&self, _server_key: &str, message: &Message, _timeout: Duration) -> Result<()> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            MockBehavior::Accept => Ok(()),
            MockBehavior::Unavailable => Err(ForemanBotError::TransportUnavailable(
                "client not initialized".to_string(),
            )),
            MockBehavior::FailPublish => {
                Err(ForemanBotError::PublishFailure("write failed".to_string()))
            }
            MockBehavior::Reply {
                registry,
                kind,
                payload,
            } => {
                let reply = Message::response_to(message, *kind, payload.clone());
                let registry = registry.clone();
                let command_id = message.id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    registry.resolve(&command_id, reply);
                });
                Ok(())
            }
        }
    }

    async fn close(&self) {}
}

pub fn count_of(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}
