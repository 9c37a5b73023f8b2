use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domains::message::{Message, MessageType};
use crate::error::{ForemanBotError, Result};
use crate::interfaces::transport::Transport;
use crate::services::registry::CommandRegistry;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateCommandRequest {
    pub server_key: String,
    pub command: MessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Caller-side correlation id; the backend reuses it so replies line up
    /// with the waiter registered before publish.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingCommandResponse {
    pub id: String,
    pub status: String,
}

/// Fallback path for processes with no broker client of their own: the
/// command is forwarded to a backend daemon over HTTP. In blocking mode the
/// backend performs the whole broker round-trip and returns the reply inline;
/// otherwise a spawned task polls the response endpoint on a fixed interval
/// until the reply appears or the deadline elapses. Correlation is handled
/// entirely by the backend, keyed on the command id.
pub struct BridgeTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
    block: bool,
    poll_interval: Duration,
    registry: Arc<CommandRegistry>,
    shutdown: watch::Sender<bool>,
}

impl BridgeTransport {
    pub fn new(
        base_url: &str,
        token: &str,
        block: bool,
        poll_interval: Duration,
        registry: Arc<CommandRegistry>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()
            .map_err(|e| ForemanBotError::Config(e.to_string()))?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            block,
            poll_interval,
            registry,
            shutdown,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.trim().is_empty() {
            request
        } else {
            request.header(AUTHORIZATION, format!("Bearer {}", self.token))
        }
    }

    fn spawn_poller(&self, command_id: String, deadline: Instant) {
        let client = self.client.clone();
        let url = self.endpoint(&format!("commands/response/{command_id}"));
        let token = self.token.clone();
        let interval = self.poll_interval;
        let registry = self.registry.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            while Instant::now() < deadline {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let mut request = client.get(&url);
                if !token.trim().is_empty() {
                    request = request.header(AUTHORIZATION, format!("Bearer {token}"));
                }
                match request.timeout(Duration::from_secs(10)).send().await {
                    Ok(response) if response.status() == StatusCode::OK => {
                        match response.json::<Message>().await {
                            Ok(reply) => {
                                if !registry.resolve(&command_id, reply) {
                                    debug!(%command_id, "bridge reply had no waiter, dropped");
                                }
                            }
                            Err(err) => {
                                warn!(%command_id, error = %err, "undecodable bridge reply, dropped")
                            }
                        }
                        return;
                    }
                    Ok(response) if response.status() == StatusCode::NOT_FOUND => {}
                    Ok(response) => {
                        warn!(%command_id, status = %response.status(), "bridge poll failed")
                    }
                    Err(err) => warn!(%command_id, error = %err, "bridge poll failed"),
                }
            }
            debug!(%command_id, "bridge poll deadline elapsed");
        });
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    fn name(&self) -> &'static str {
        "bridge"
    }

    async fn publish(&self, server_key: &str, message: &Message, timeout: Duration) -> Result<()> {
        let body = CreateCommandRequest {
            server_key: server_key.to_string(),
            command: message.kind,
            payload: message.payload.clone(),
            id: Some(message.id.clone()),
            block: Some(self.block),
            timeout_ms: Some(timeout.as_millis() as u64),
        };
        let request = self
            .authorized(self.client.post(self.endpoint("commands/create")))
            .timeout(timeout + Duration::from_secs(5))
            .json(&body);
        let response = request
            .send()
            .await
            .map_err(|e| ForemanBotError::TransportUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ForemanBotError::PublishFailure(format!(
                "bridge returned {}",
                response.status()
            )));
        }

        if self.block {
            // the backend already did the broker round-trip; the reply comes
            // back inline and is fed straight to the waiter
            let reply = response
                .json::<Message>()
                .await
                .map_err(|e| ForemanBotError::PublishFailure(e.to_string()))?;
            let command_id = message.id.clone();
            if !self.registry.resolve(&command_id, reply) {
                debug!(%command_id, "inline bridge reply had no waiter, dropped");
            }
        } else {
            let deadline = Instant::now() + timeout;
            self.spawn_poller(message.id.clone(), deadline);
        }
        Ok(())
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}
