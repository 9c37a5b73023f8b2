use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::config::{default_transport_order, Config};
use crate::domains::message::{
    AgentUpdateResult, ContainerActionResult, ContainerInfo, ContainerSpec, CpuTemp, DiskEntry,
    MemoryInfo, Message, MessageType, NetworkInfo, ProcessEntry, UptimeInfo,
};
use crate::error::{ForemanBotError, Result};
use crate::interfaces::transport::Transport;
use crate::services::bridge::BridgeTransport;
use crate::services::dispatcher::Dispatcher;
use crate::services::kafka::{KafkaSettings, KafkaTransport};
use crate::services::metrics_cache::{MetricsCache, MetricsCacheConsumer};
use crate::services::pubsub::PubSubTransport;
use crate::services::registry::CommandRegistry;
use crate::services::streams::LogStreamTransport;

/// Application context built once at startup: the registry, the transport
/// chain, the dispatcher and the optional metrics cache all live here and
/// are passed by reference, never reached through globals.
pub struct ForemanBot {
    dispatcher: Dispatcher,
    cache: Option<Arc<MetricsCache>>,
    cache_consumer: Option<MetricsCacheConsumer>,
    protected_containers: Vec<String>,
}

impl ForemanBot {
    pub async fn from_config(config: Config) -> Result<Self> {
        let registry = Arc::new(CommandRegistry::new());
        let order = config
            .transports
            .clone()
            .unwrap_or_else(default_transport_order);

        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        for name in &order {
            match name.as_str() {
                "pubsub" => {
                    if let Some(redis) = &config.redis {
                        transports
                            .push(Arc::new(PubSubTransport::connect(&redis.url, registry.clone()).await?));
                    }
                }
                "streams" => {
                    if let Some(redis) = &config.redis {
                        let group = redis.consumer_group.as_deref().unwrap_or("foreman-bot");
                        let consumer = redis.consumer_name.as_deref().unwrap_or("dispatcher-1");
                        let max_len = redis.stream_max_len.unwrap_or(1000);
                        transports.push(Arc::new(
                            LogStreamTransport::connect(
                                &redis.url,
                                group,
                                consumer,
                                max_len,
                                registry.clone(),
                            )
                            .await?,
                        ));
                    }
                }
                "kafka" => {
                    if let Some(kafka) = &config.kafka {
                        let settings = KafkaSettings {
                            brokers: kafka.brokers.clone(),
                            response_topic: kafka
                                .response_topic
                                .clone()
                                .unwrap_or_else(|| "agent.responses".to_string()),
                            group_id: kafka
                                .group_id
                                .clone()
                                .unwrap_or_else(|| "foreman-bot-dispatch".to_string()),
                            compression: kafka
                                .compression
                                .clone()
                                .unwrap_or_else(|| "none".to_string()),
                            commit_interval_ms: kafka.commit_interval_ms.unwrap_or(5000),
                        };
                        transports.push(Arc::new(KafkaTransport::connect(&settings, registry.clone())?));
                    }
                }
                "bridge" => {
                    if let Some(bridge) = &config.bridge {
                        transports.push(Arc::new(BridgeTransport::new(
                            &bridge.base_url,
                            bridge.token.as_deref().unwrap_or(""),
                            bridge.block.unwrap_or(true),
                            Duration::from_millis(bridge.poll_interval_ms.unwrap_or(500)),
                            registry.clone(),
                        )?));
                    }
                }
                other => {
                    return Err(ForemanBotError::Config(format!(
                        "unknown transport '{other}'"
                    )))
                }
            }
        }
        if transports.is_empty() {
            return Err(ForemanBotError::Config(
                "no transports configured".to_string(),
            ));
        }

        let timeout = Duration::from_millis(config.command_timeout_ms.unwrap_or(10_000));
        let dispatcher = Dispatcher::new(registry, transports, timeout);

        let (cache, cache_consumer) = match (&config.metrics_cache, &config.kafka) {
            (Some(cache_config), Some(kafka)) if cache_config.enabled.unwrap_or(false) => {
                let cache = Arc::new(MetricsCache::new(
                    cache_config.capacity.unwrap_or(1024),
                    Duration::from_secs(cache_config.freshness_secs.unwrap_or(120)),
                    cache_config.history_limit.unwrap_or(32),
                ));
                let consumer = MetricsCacheConsumer::start(
                    &kafka.brokers,
                    cache_config
                        .telemetry_topic
                        .as_deref()
                        .unwrap_or("agent.telemetry"),
                    cache_config
                        .group_id
                        .as_deref()
                        .unwrap_or("foreman-bot-metrics"),
                    cache.clone(),
                )?;
                (Some(cache), Some(consumer))
            }
            _ => (None, None),
        };

        Ok(Self {
            dispatcher,
            cache,
            cache_consumer,
            protected_containers: config.protected_containers.unwrap_or_default(),
        })
    }

    pub async fn from_config_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::from_file(path)?;
        Self::from_config(config).await
    }

    /// Assembles a bot around an existing dispatcher; lets callers wire in
    /// their own transports and cache.
    pub fn from_parts(
        dispatcher: Dispatcher,
        cache: Option<Arc<MetricsCache>>,
        protected_containers: Vec<String>,
    ) -> Self {
        Self {
            dispatcher,
            cache,
            cache_consumer: None,
            protected_containers,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Validation runs before any transport publish; a protected container
    /// never even reaches a broker.
    pub fn validate_command(&self, kind: MessageType, payload: &Value) -> Result<()> {
        if matches!(
            kind,
            MessageType::StopContainer
                | MessageType::RestartContainer
                | MessageType::RemoveContainer
        ) {
            let name = payload.get("name").and_then(|v| v.as_str()).unwrap_or("");
            if self
                .protected_containers
                .iter()
                .any(|protected| protected == name)
            {
                return Err(ForemanBotError::Validation(format!(
                    "container '{name}' is protected"
                )));
            }
        }
        Ok(())
    }

    pub async fn dispatch(
        &self,
        server_key: &str,
        message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        self.validate_command(message.kind, &message.payload)?;
        self.dispatcher.send(server_key, message, timeout).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        server_key: &str,
        kind: MessageType,
        payload: Value,
    ) -> Result<T> {
        let message = Message::new(kind, server_key, payload);
        let reply = self
            .dispatch(server_key, message, self.dispatcher.default_timeout())
            .await?;
        reply.payload_as()
    }

    /// Cache shortcut for read-only metrics; a hit younger than the freshness
    /// threshold skips the broker round-trip entirely.
    fn cached<T: DeserializeOwned>(&self, server_key: &str, metric: &str) -> Option<T> {
        let cache = self.cache.as_ref()?;
        let value = cache.get_fresh(server_key, metric)?;
        serde_json::from_value(value).ok()
    }

    pub async fn cpu_temp(&self, server_key: &str) -> Result<CpuTemp> {
        if let Some(hit) = self.cached(server_key, "cpu_temp") {
            return Ok(hit);
        }
        self.request(server_key, MessageType::GetCpuTemp, Value::Null)
            .await
    }

    pub async fn memory_info(&self, server_key: &str) -> Result<MemoryInfo> {
        if let Some(hit) = self.cached(server_key, "memory_info") {
            return Ok(hit);
        }
        self.request(server_key, MessageType::GetMemoryInfo, Value::Null)
            .await
    }

    pub async fn disk_info(&self, server_key: &str) -> Result<Vec<DiskEntry>> {
        if let Some(hit) = self.cached(server_key, "disk_info") {
            return Ok(hit);
        }
        self.request(server_key, MessageType::GetDiskInfo, Value::Null)
            .await
    }

    pub async fn uptime(&self, server_key: &str) -> Result<UptimeInfo> {
        if let Some(hit) = self.cached(server_key, "uptime") {
            return Ok(hit);
        }
        self.request(server_key, MessageType::GetUptime, Value::Null)
            .await
    }

    pub async fn processes(&self, server_key: &str) -> Result<Vec<ProcessEntry>> {
        if let Some(hit) = self.cached(server_key, "processes") {
            return Ok(hit);
        }
        self.request(server_key, MessageType::GetProcesses, Value::Null)
            .await
    }

    pub async fn network_info(&self, server_key: &str) -> Result<NetworkInfo> {
        if let Some(hit) = self.cached(server_key, "network_info") {
            return Ok(hit);
        }
        self.request(server_key, MessageType::GetNetworkInfo, Value::Null)
            .await
    }

    pub async fn containers(&self, server_key: &str) -> Result<Vec<ContainerInfo>> {
        self.request(server_key, MessageType::ListContainers, Value::Null)
            .await
    }

    pub async fn start_container(
        &self,
        server_key: &str,
        name: &str,
    ) -> Result<ContainerActionResult> {
        self.request(server_key, MessageType::StartContainer, json!({ "name": name }))
            .await
    }

    pub async fn stop_container(
        &self,
        server_key: &str,
        name: &str,
    ) -> Result<ContainerActionResult> {
        self.request(server_key, MessageType::StopContainer, json!({ "name": name }))
            .await
    }

    pub async fn restart_container(
        &self,
        server_key: &str,
        name: &str,
    ) -> Result<ContainerActionResult> {
        self.request(
            server_key,
            MessageType::RestartContainer,
            json!({ "name": name }),
        )
        .await
    }

    pub async fn remove_container(
        &self,
        server_key: &str,
        name: &str,
    ) -> Result<ContainerActionResult> {
        self.request(
            server_key,
            MessageType::RemoveContainer,
            json!({ "name": name }),
        )
        .await
    }

    pub async fn create_container(
        &self,
        server_key: &str,
        spec: &ContainerSpec,
    ) -> Result<ContainerActionResult> {
        let payload =
            serde_json::to_value(spec).map_err(|e| ForemanBotError::Decode(e.to_string()))?;
        self.request(server_key, MessageType::CreateContainer, payload)
            .await
    }

    pub async fn update_agent(&self, server_key: &str) -> Result<AgentUpdateResult> {
        self.request(server_key, MessageType::UpdateAgent, Value::Null)
            .await
    }

    /// Stops receive loops; outstanding waiters resolve through their own
    /// timeouts rather than being force-failed.
    pub async fn shutdown(&self) {
        self.dispatcher.close().await;
        if let Some(consumer) = &self.cache_consumer {
            consumer.stop();
        }
    }
}
