use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{ForemanBotError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    pub url: String,
    pub consumer_group: Option<String>,
    pub consumer_name: Option<String>,
    pub stream_max_len: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: String,
    pub response_topic: Option<String>,
    pub group_id: Option<String>,
    pub compression: Option<String>,
    pub commit_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub block: Option<bool>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsCacheConfig {
    pub enabled: Option<bool>,
    pub telemetry_topic: Option<String>,
    pub group_id: Option<String>,
    pub freshness_secs: Option<u64>,
    pub capacity: Option<usize>,
    pub history_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Transport priority order; only names with matching broker sections
    /// are constructed. Defaults to pubsub, streams, kafka, bridge.
    pub transports: Option<Vec<String>>,
    pub redis: Option<RedisConfig>,
    pub kafka: Option<KafkaConfig>,
    pub bridge: Option<BridgeConfig>,
    pub metrics_cache: Option<MetricsCacheConfig>,
    pub protected_containers: Option<Vec<String>>,
    pub command_timeout_ms: Option<u64>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ForemanBotError::Config(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ForemanBotError::Config(e.to_string()))?;
        Ok(config)
    }
}

pub fn default_transport_order() -> Vec<String> {
    vec![
        "pubsub".to_string(),
        "streams".to_string(),
        "kafka".to_string(),
        "bridge".to_string(),
    ]
}
