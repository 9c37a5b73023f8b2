use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message as KafkaPayload;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domains::message::Message;
use crate::error::{ForemanBotError, Result};

/// Best-effort read-side mirror of broker telemetry. Values younger than the
/// freshness threshold are served without a broker round-trip; everything
/// else falls through to the dispatcher. Bounded in both directions: an LRU
/// over latest values and a capped recent-history deque per key.
pub struct MetricsCache {
    entries: Mutex<LruCache<String, CachedMetric>>,
    history: Mutex<HashMap<String, VecDeque<CachedMetric>>>,
    freshness: Duration,
    history_limit: usize,
}

#[derive(Debug, Clone)]
pub struct CachedMetric {
    pub value: Value,
    pub timestamp: i64,
    stored_at: Instant,
}

impl MetricsCache {
    pub fn new(capacity: usize, freshness: Duration, history_limit: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            history: Mutex::new(HashMap::new()),
            freshness,
            history_limit,
        }
    }

    pub fn insert(&self, server_key: &str, metric: &str, timestamp: i64, value: Value) {
        let key = cache_key(server_key, metric);
        let cached = CachedMetric {
            value,
            timestamp,
            stored_at: Instant::now(),
        };
        self.lock_entries().put(key.clone(), cached.clone());

        let mut history = self.lock_history();
        let entries = history.entry(key).or_default();
        entries.push_back(cached);
        while entries.len() > self.history_limit {
            entries.pop_front();
        }
    }

    /// Latest value iff it is younger than the freshness threshold.
    pub fn get_fresh(&self, server_key: &str, metric: &str) -> Option<Value> {
        let key = cache_key(server_key, metric);
        let mut entries = self.lock_entries();
        let cached = entries.get(&key)?;
        if cached.stored_at.elapsed() > self.freshness {
            return None;
        }
        Some(cached.value.clone())
    }

    /// Recent values, oldest first.
    pub fn history(&self, server_key: &str, metric: &str) -> Vec<CachedMetric> {
        let key = cache_key(server_key, metric);
        self.lock_history()
            .get(&key)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock_entries(&self) -> MutexGuard<'_, LruCache<String, CachedMetric>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_history(&self) -> MutexGuard<'_, HashMap<String, VecDeque<CachedMetric>>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn cache_key(server_key: &str, metric: &str) -> String {
    format!("{server_key}:{metric}")
}

/// Consumer-group reader over the telemetry topic, structurally the same
/// loop as the response-topic reader but writing observed values into the
/// cache instead of resolving waiters. Malformed records are logged and
/// skipped; the loop never dies over one bad message.
pub struct MetricsCacheConsumer {
    shutdown: watch::Sender<bool>,
}

impl MetricsCacheConsumer {
    pub fn start(
        brokers: &str,
        telemetry_topic: &str,
        group_id: &str,
        cache: Arc<MetricsCache>,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "10000")
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| ForemanBotError::Config(e.to_string()))?;
        consumer
            .subscribe(&[telemetry_topic])
            .map_err(|e| ForemanBotError::Config(e.to_string()))?;

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    r = consumer.recv() => r,
                };
                match received {
                    Ok(record) => {
                        let Some(raw) = record.payload() else {
                            continue;
                        };
                        match Message::decode(raw) {
                            Ok(envelope) => match envelope.kind.metric_name() {
                                Some(metric) => {
                                    cache.insert(
                                        &envelope.server_key,
                                        metric,
                                        envelope.timestamp,
                                        envelope.payload,
                                    );
                                }
                                None => {
                                    debug!(kind = %envelope.kind, "non-metric telemetry, skipped")
                                }
                            },
                            Err(err) => warn!(error = %err, "undecodable telemetry record, skipped"),
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "telemetry topic read failed");
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
            debug!("telemetry receive loop stopped");
        });

        Ok(Self { shutdown })
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fresh_hit_and_expiry() {
        let cache = MetricsCache::new(8, Duration::from_millis(50), 4);
        cache.insert("key-1", "cpu_temp", 1, json!({"temperature": 45.5, "unit": "C"}));
        let hit = cache.get_fresh("key-1", "cpu_temp").unwrap();
        assert_eq!(hit["temperature"], 45.5);
        assert!(cache.get_fresh("key-1", "memory_info").is_none());
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get_fresh("key-1", "cpu_temp").is_none());
    }

    #[test]
    fn history_is_bounded_and_ordered() {
        let cache = MetricsCache::new(8, Duration::from_secs(60), 3);
        for i in 0..5 {
            cache.insert("key-1", "memory_info", i, json!({"used": i}));
        }
        let history = cache.history("key-1", "memory_info");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].timestamp, 2);
        assert_eq!(history[2].timestamp, 4);
    }

    #[test]
    fn latest_values_are_bounded_by_capacity() {
        let cache = MetricsCache::new(2, Duration::from_secs(60), 4);
        cache.insert("a", "cpu_temp", 1, json!(1));
        cache.insert("b", "cpu_temp", 2, json!(2));
        cache.insert("c", "cpu_temp", 3, json!(3));
        assert!(cache.get_fresh("a", "cpu_temp").is_none());
        assert!(cache.get_fresh("c", "cpu_temp").is_some());
    }
}
