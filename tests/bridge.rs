mod common;

use std::sync::Arc;
use std::time::Duration;

use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use serde_json::{json, Value};

use foreman_bot::domains::message::{CpuTemp, Message, MessageType};
use foreman_bot::error::ForemanBotError;
use foreman_bot::interfaces::transport::Transport;
use foreman_bot::services::bridge::BridgeTransport;
use foreman_bot::services::dispatcher::Dispatcher;
use foreman_bot::services::registry::CommandRegistry;

fn reply_envelope(id: &str, kind: &str, payload: Value) -> Value {
    json!({
        "id": id,
        "type": kind,
        "timestamp": 1700000000000i64,
        "server_key": "key-1",
        "version": "1.2",
        "payload": payload
    })
}

fn bridge_dispatcher(
    registry: Arc<CommandRegistry>,
    base_url: &str,
    block: bool,
) -> Dispatcher {
    let transport = BridgeTransport::new(
        base_url,
        "token",
        block,
        Duration::from_millis(50),
        registry.clone(),
    )
    .unwrap();
    Dispatcher::new(registry, vec![Arc::new(transport)], Duration::from_secs(5))
}

#[tokio::test]
async fn blocking_create_returns_inline_reply() {
    let server = MockServer::start_async().await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/commands/create")
                .header("authorization", "Bearer token");
            then.status(200).json_body(reply_envelope(
                "abc",
                "cpu_temp_response",
                json!({"temperature": 45.5, "unit": "C"}),
            ));
        })
        .await;

    let registry = Arc::new(CommandRegistry::new());
    let dispatcher = bridge_dispatcher(registry.clone(), &server.base_url(), true);

    let mut message = Message::new(MessageType::GetCpuTemp, "key-1", Value::Null);
    message.id = "abc".to_string();
    let reply = dispatcher
        .send("key-1", message, Duration::from_secs(2))
        .await
        .unwrap();
    let payload: CpuTemp = reply.payload_as().unwrap();
    assert_eq!(payload.temperature, 45.5);
    create.assert_async().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn nonblocking_create_polls_until_reply_appears() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/commands/create");
            then.status(202)
                .json_body(json!({"id": "abc", "status": "pending"}));
        })
        .await;
    let poll = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/commands/response/abc")
                .header("authorization", "Bearer token");
            then.status(200).json_body(reply_envelope(
                "abc",
                "uptime_response",
                json!({"seconds": 7200, "formatted": "2h", "boot_time": 100}),
            ));
        })
        .await;

    let registry = Arc::new(CommandRegistry::new());
    let dispatcher = bridge_dispatcher(registry.clone(), &server.base_url(), false);

    let mut message = Message::new(MessageType::GetUptime, "key-1", Value::Null);
    message.id = "abc".to_string();
    let reply = dispatcher
        .send("key-1", message, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.kind, MessageType::UptimeResponse);
    poll.assert_async().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn backend_error_status_is_a_publish_failure() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/commands/create");
            then.status(500).json_body(json!({"error": "broker down"}));
        })
        .await;

    let registry = Arc::new(CommandRegistry::new());
    let dispatcher = bridge_dispatcher(registry.clone(), &server.base_url(), true);

    let message = Message::new(MessageType::GetCpuTemp, "key-1", Value::Null);
    let err = dispatcher
        .send("key-1", message, Duration::from_secs(2))
        .await
        .unwrap_err();
    match err {
        ForemanBotError::AllTransportsFailed(detail) => {
            assert!(detail.contains("bridge"), "missing transport name: {detail}")
        }
        other => panic!("expected AllTransportsFailed, got {other}"),
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn unreachable_backend_is_transport_unavailable() {
    let registry = Arc::new(CommandRegistry::new());
    let transport = BridgeTransport::new(
        "http://127.0.0.1:9",
        "",
        true,
        Duration::from_millis(50),
        registry.clone(),
    )
    .unwrap();

    let message = Message::new(MessageType::GetCpuTemp, "key-1", Value::Null);
    let err = transport
        .publish("key-1", &message, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ForemanBotError::TransportUnavailable(_)));
}
