use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::domains::message::{Message, MessageType};
use crate::error::{ForemanBotError, Result};
use crate::interfaces::transport::Transport;
use crate::services::registry::CommandRegistry;

/// The single entry point for issuing commands. Registers a waiter, walks the
/// configured transport chain until one accepts the publish, then blocks the
/// caller until the waiter resolves or the deadline elapses. Fallback order
/// is configuration, not code.
pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    transports: Vec<Arc<dyn Transport>>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CommandRegistry>,
        transports: Vec<Arc<dyn Transport>>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transports,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn send(
        &self,
        server_key: &str,
        message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let expected = message.kind.response_for().ok_or_else(|| {
            ForemanBotError::Validation(format!("{} is not a command type", message.kind))
        })?;

        // register happens-before publish so a fast reply cannot be lost
        let rx = self.registry.register(&message.id)?;
        let command_id = message.id.clone();

        let mut failures: Vec<String> = Vec::new();
        let mut published = false;
        for transport in &self.transports {
            match transport.publish(server_key, &message, timeout).await {
                Ok(()) => {
                    debug!(transport = transport.name(), %command_id, "command accepted");
                    published = true;
                    break;
                }
                Err(err) if err.is_fallback() => {
                    debug!(
                        transport = transport.name(),
                        %command_id,
                        error = %err,
                        "transport failed, trying next"
                    );
                    failures.push(format!("{}: {}", transport.name(), err));
                }
                Err(err) => {
                    self.registry.cancel(&command_id);
                    return Err(err);
                }
            }
        }
        if !published {
            self.registry.cancel(&command_id);
            if failures.is_empty() {
                return Err(ForemanBotError::TransportUnavailable(
                    "no transports configured".to_string(),
                ));
            }
            return Err(ForemanBotError::AllTransportsFailed(failures.join("; ")));
        }

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                self.registry.cancel(&command_id);
                return Err(ForemanBotError::Runtime(
                    "waiter dropped before delivery".to_string(),
                ));
            }
            Err(_) => {
                self.registry.cancel(&command_id);
                return Err(ForemanBotError::Timeout);
            }
        };

        if reply.kind == MessageType::ErrorResponse {
            return Err(ForemanBotError::Agent(reply.error_text()));
        }
        if reply.kind != expected {
            return Err(ForemanBotError::ProtocolMismatch {
                expected: expected.to_string(),
                got: reply.kind.to_string(),
            });
        }
        Ok(reply)
    }

    /// Sends a freshly minted command and decodes the reply payload into the
    /// caller's expected shape.
    pub async fn request<T: DeserializeOwned>(
        &self,
        server_key: &str,
        kind: MessageType,
        payload: Value,
        timeout: Duration,
    ) -> Result<T> {
        let message = Message::new(kind, server_key, payload);
        let reply = self.send(server_key, message, timeout).await?;
        reply.payload_as()
    }

    pub async fn close(&self) {
        for transport in &self.transports {
            transport.close().await;
        }
    }
}
