mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{count_of, MockBehavior, MockTransport};
use foreman_bot::client::ForemanBot;
use foreman_bot::domains::message::MessageType;
use foreman_bot::error::ForemanBotError;
use foreman_bot::services::dispatcher::Dispatcher;
use foreman_bot::services::metrics_cache::MetricsCache;
use foreman_bot::services::registry::CommandRegistry;

fn bot_with(
    registry: Arc<CommandRegistry>,
    transport: MockTransport,
    cache: Option<Arc<MetricsCache>>,
    protected: Vec<String>,
) -> ForemanBot {
    let dispatcher = Dispatcher::new(
        registry,
        vec![Arc::new(transport)],
        Duration::from_millis(500),
    );
    ForemanBot::from_parts(dispatcher, cache, protected)
}

#[tokio::test]
async fn protected_container_fails_before_any_publish() {
    let registry = Arc::new(CommandRegistry::new());
    let transport = MockTransport::new(
        "pubsub",
        MockBehavior::Reply {
            registry: registry.clone(),
            kind: MessageType::StopContainerResponse,
            payload: json!({"success": true, "message": "stopped", "state": "exited"}),
        },
    );
    let count = transport.publishes();
    let bot = bot_with(
        registry,
        transport,
        None,
        vec!["db".to_string(), "vault".to_string()],
    );

    let err = bot.stop_container("key-1", "db").await.unwrap_err();
    assert!(matches!(err, ForemanBotError::Validation(_)));
    let err = bot.restart_container("key-1", "vault").await.unwrap_err();
    assert!(matches!(err, ForemanBotError::Validation(_)));
    let err = bot.remove_container("key-1", "db").await.unwrap_err();
    assert!(matches!(err, ForemanBotError::Validation(_)));
    assert_eq!(count_of(&count), 0, "a protected action reached a transport");
}

#[tokio::test]
async fn unprotected_container_actions_go_through() {
    let registry = Arc::new(CommandRegistry::new());
    let transport = MockTransport::new(
        "pubsub",
        MockBehavior::Reply {
            registry: registry.clone(),
            kind: MessageType::StopContainerResponse,
            payload: json!({"success": true, "message": "stopped", "state": "exited"}),
        },
    );
    let count = transport.publishes();
    let bot = bot_with(registry, transport, None, vec!["db".to_string()]);

    let result = bot.stop_container("key-1", "web").await.unwrap();
    assert!(result.success);
    assert_eq!(result.state, "exited");
    assert_eq!(count_of(&count), 1);
}

#[tokio::test]
async fn starting_a_protected_container_is_allowed() {
    let registry = Arc::new(CommandRegistry::new());
    let transport = MockTransport::new(
        "pubsub",
        MockBehavior::Reply {
            registry: registry.clone(),
            kind: MessageType::StartContainerResponse,
            payload: json!({"success": true, "message": "started", "state": "running"}),
        },
    );
    let count = transport.publishes();
    let bot = bot_with(registry, transport, None, vec!["db".to_string()]);

    let result = bot.start_container("key-1", "db").await.unwrap();
    assert!(result.success);
    assert_eq!(count_of(&count), 1);
}

#[tokio::test]
async fn fresh_cache_hit_skips_the_broker() {
    let cache = Arc::new(MetricsCache::new(16, Duration::from_secs(60), 8));
    cache.insert(
        "key-1",
        "memory_info",
        1,
        json!({
            "total": 16, "used": 8, "available": 8, "free": 4,
            "buffers": 1, "cached": 3, "used_percent": 50.0
        }),
    );
    let registry = Arc::new(CommandRegistry::new());
    let transport = MockTransport::new("pubsub", MockBehavior::Unavailable);
    let count = transport.publishes();
    let bot = bot_with(registry, transport, Some(cache), Vec::new());

    let info = bot.memory_info("key-1").await.unwrap();
    assert_eq!(info.used_percent, 50.0);
    assert_eq!(count_of(&count), 0, "cache hit still hit a transport");
}

#[tokio::test]
async fn stale_cache_falls_through_to_dispatch() {
    let cache = Arc::new(MetricsCache::new(16, Duration::from_millis(10), 8));
    cache.insert("key-1", "cpu_temp", 1, json!({"temperature": 40.0, "unit": "C"}));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let registry = Arc::new(CommandRegistry::new());
    let transport = MockTransport::new(
        "pubsub",
        MockBehavior::Reply {
            registry: registry.clone(),
            kind: MessageType::CpuTempResponse,
            payload: json!({"temperature": 45.5, "unit": "C"}),
        },
    );
    let count = transport.publishes();
    let bot = bot_with(registry, transport, Some(cache), Vec::new());

    let temp = bot.cpu_temp("key-1").await.unwrap();
    assert_eq!(temp.temperature, 45.5);
    assert_eq!(count_of(&count), 1);
}

#[tokio::test]
async fn cache_miss_for_other_server_dispatches() {
    let cache = Arc::new(MetricsCache::new(16, Duration::from_secs(60), 8));
    cache.insert("key-1", "uptime", 1, json!({"seconds": 1, "formatted": "1s", "boot_time": 0}));

    let registry = Arc::new(CommandRegistry::new());
    let transport = MockTransport::new(
        "pubsub",
        MockBehavior::Reply {
            registry: registry.clone(),
            kind: MessageType::UptimeResponse,
            payload: json!({"seconds": 7200, "formatted": "2h", "boot_time": 100}),
        },
    );
    let bot = bot_with(registry, transport, Some(cache), Vec::new());

    let uptime = bot.uptime("key-2").await.unwrap();
    assert_eq!(uptime.seconds, 7200);
}
