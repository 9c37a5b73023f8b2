use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::{
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::client::ForemanBot;
use crate::config::Config;
use crate::domains::message::Message;
use crate::error::{ForemanBotError, Result};
use crate::services::bridge::{CreateCommandRequest, PendingCommandResponse};

const RESPONSE_TTL: Duration = Duration::from_secs(600);

/// Backend surface for the sync-bridge transport: command create/poll on top
/// of the local dispatcher, plus low-level broker proxy endpoints that let a
/// client with no Redis driver participate over HTTP.
#[derive(Clone)]
pub struct AppState {
    pub bot: Arc<ForemanBot>,
    pub responses: Arc<ResponseStore>,
    pub broker: Option<BrokerProxy>,
    pub token: String,
}

/// Parks the outcome of non-blocking commands until the caller polls for it.
/// Entries are pruned after a bounded retention window.
pub struct ResponseStore {
    entries: Mutex<HashMap<String, StoredOutcome>>,
    ttl: Duration,
}

struct StoredOutcome {
    outcome: std::result::Result<Message, String>,
    stored_at: Instant,
}

impl ResponseStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn insert(&self, id: &str, outcome: std::result::Result<Message, String>) {
        let mut entries = self.lock();
        let ttl = self.ttl;
        entries.retain(|_, stored| stored.stored_at.elapsed() < ttl);
        entries.insert(
            id.to_string(),
            StoredOutcome {
                outcome,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn take(&self, id: &str) -> Option<std::result::Result<Message, String>> {
        let mut entries = self.lock();
        let fresh = entries
            .get(id)
            .map(|stored| stored.stored_at.elapsed() < self.ttl)?;
        if !fresh {
            entries.remove(id);
            return None;
        }
        entries.remove(id).map(|stored| stored.outcome)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredOutcome>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ResponseStore {
    fn default() -> Self {
        Self::new(RESPONSE_TTL)
    }
}

#[derive(Clone)]
pub struct BrokerProxy {
    client: redis::Client,
    conn: ConnectionManager,
}

impl BrokerProxy {
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| ForemanBotError::Config(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| ForemanBotError::Config(e.to_string()))?;
        Ok(Self { client, conn })
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct PublishRequest {
    channel: String,
    payload: Value,
}

#[derive(Deserialize)]
struct SubscribeRequest {
    channel: String,
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
struct XaddRequest {
    stream: String,
    fields: HashMap<String, String>,
}

#[derive(Deserialize)]
struct XreadRequest {
    streams: Vec<String>,
    ids: Vec<String>,
    block_ms: Option<usize>,
    count: Option<usize>,
}

#[derive(Deserialize)]
struct XreadGroupRequest {
    group: String,
    consumer: String,
    streams: Vec<String>,
    ids: Vec<String>,
    block_ms: Option<usize>,
    count: Option<usize>,
}

#[derive(Deserialize)]
struct XackRequest {
    stream: String,
    group: String,
    ids: Vec<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/commands/create", post(create_command))
        .route("/commands/response/:id", get(command_response))
        .route("/broker/publish", post(broker_publish))
        .route("/broker/subscribe", post(broker_subscribe))
        .route("/broker/xadd", post(broker_xadd))
        .route("/broker/xread", post(broker_xread))
        .route("/broker/xreadgroup", post(broker_xreadgroup))
        .route("/broker/xack", post(broker_xack))
        .with_state(state)
}

async fn health() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn create_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateCommandRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    let timeout = request
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.bot.dispatcher().default_timeout());
    let mut message = Message::new(request.command, &request.server_key, request.payload);
    if let Some(id) = request.id {
        message.id = id;
    }

    if request.block.unwrap_or(true) {
        match state
            .bot
            .dispatch(&request.server_key, message.clone(), timeout)
            .await
        {
            Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
            // surface remote agent errors as the wire-level error envelope so
            // bridge clients classify them exactly like direct-broker callers
            Err(ForemanBotError::Agent(text)) => {
                (StatusCode::OK, Json(Message::error_response(&message, &text))).into_response()
            }
            Err(err) => error_response(err),
        }
    } else {
        if let Err(err) = state.bot.validate_command(message.kind, &message.payload) {
            return error_response(err);
        }
        let id = message.id.clone();
        let bot = state.bot.clone();
        let responses = state.responses.clone();
        let server_key = request.server_key.clone();
        tokio::spawn(async move {
            let command_id = message.id.clone();
            let outcome = bot
                .dispatch(&server_key, message, timeout)
                .await
                .map_err(|e| e.to_string());
            responses.insert(&command_id, outcome);
        });
        (
            StatusCode::ACCEPTED,
            Json(PendingCommandResponse {
                id,
                status: "pending".to_string(),
            }),
        )
            .into_response()
    }
}

async fn command_response(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }
    match state.responses.take(&id) {
        Some(Ok(reply)) => (StatusCode::OK, Json(reply)).into_response(),
        Some(Err(error)) => (StatusCode::BAD_GATEWAY, Json(ErrorBody { error })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("no response for command {id}"),
            }),
        )
            .into_response(),
    }
}

async fn broker_publish(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }
    let Some(broker) = &state.broker else {
        return no_broker();
    };
    let payload = match serde_json::to_string(&request.payload) {
        Ok(payload) => payload,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
    };
    let mut conn = broker.conn.clone();
    match conn.publish::<_, _, i64>(&request.channel, payload).await {
        Ok(receivers) => (StatusCode::OK, Json(json!({ "receivers": receivers }))).into_response(),
        Err(err) => broker_error(err),
    }
}

async fn broker_subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubscribeRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }
    let Some(broker) = &state.broker else {
        return no_broker();
    };
    let mut pubsub = match broker.client.get_async_pubsub().await {
        Ok(pubsub) => pubsub,
        Err(err) => return broker_error(err),
    };
    if let Err(err) = pubsub.subscribe(&request.channel).await {
        return broker_error(err);
    }

    let wait = Duration::from_millis(request.timeout_ms.unwrap_or(5000));
    let received = {
        let mut stream = pubsub.on_message();
        tokio::time::timeout(wait, stream.next()).await
    };
    let _ = pubsub.unsubscribe(&request.channel).await;
    match received {
        Ok(Some(msg)) => {
            let payload: String = msg.get_payload().unwrap_or_default();
            let message =
                serde_json::from_str::<Value>(&payload).unwrap_or(Value::String(payload));
            (
                StatusCode::OK,
                Json(json!({ "channel": request.channel, "message": message })),
            )
                .into_response()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "no message within timeout".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn broker_xadd(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<XaddRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }
    let Some(broker) = &state.broker else {
        return no_broker();
    };
    let fields: Vec<(String, String)> = request.fields.into_iter().collect();
    let mut conn = broker.conn.clone();
    match conn
        .xadd::<_, _, _, _, String>(&request.stream, "*", &fields)
        .await
    {
        Ok(id) => (StatusCode::OK, Json(json!({ "id": id }))).into_response(),
        Err(err) => broker_error(err),
    }
}

async fn broker_xread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<XreadRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }
    let Some(broker) = &state.broker else {
        return no_broker();
    };
    let mut opts = StreamReadOptions::default();
    if let Some(block_ms) = request.block_ms {
        opts = opts.block(block_ms);
    }
    if let Some(count) = request.count {
        opts = opts.count(count);
    }
    let mut conn = broker.conn.clone();
    match conn
        .xread_options::<_, _, StreamReadReply>(&request.streams, &request.ids, &opts)
        .await
    {
        Ok(reply) => (StatusCode::OK, Json(stream_reply_to_json(reply))).into_response(),
        Err(err) => broker_error(err),
    }
}

async fn broker_xreadgroup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<XreadGroupRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }
    let Some(broker) = &state.broker else {
        return no_broker();
    };
    let mut opts = StreamReadOptions::default().group(&request.group, &request.consumer);
    if let Some(block_ms) = request.block_ms {
        opts = opts.block(block_ms);
    }
    if let Some(count) = request.count {
        opts = opts.count(count);
    }
    let mut conn = broker.conn.clone();
    match conn
        .xread_options::<_, _, StreamReadReply>(&request.streams, &request.ids, &opts)
        .await
    {
        Ok(reply) => (StatusCode::OK, Json(stream_reply_to_json(reply))).into_response(),
        Err(err) => broker_error(err),
    }
}

async fn broker_xack(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<XackRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }
    let Some(broker) = &state.broker else {
        return no_broker();
    };
    let mut conn = broker.conn.clone();
    match conn
        .xack::<_, _, _, i64>(&request.stream, &request.group, &request.ids)
        .await
    {
        Ok(acknowledged) => {
            (StatusCode::OK, Json(json!({ "acknowledged": acknowledged }))).into_response()
        }
        Err(err) => broker_error(err),
    }
}

fn stream_reply_to_json(reply: StreamReadReply) -> Value {
    let streams: Vec<Value> = reply
        .keys
        .iter()
        .map(|key| {
            let entries: Vec<Value> = key
                .ids
                .iter()
                .map(|entry| {
                    let fields: serde_json::Map<String, Value> = entry
                        .map
                        .iter()
                        .map(|(field, value)| (field.clone(), redis_value_to_json(value)))
                        .collect();
                    json!({ "id": entry.id, "fields": fields })
                })
                .collect();
            json!({ "stream": key.key, "entries": entries })
        })
        .collect();
    Value::Array(streams)
}

fn redis_value_to_json(value: &redis::Value) -> Value {
    match redis::from_redis_value::<String>(value) {
        Ok(text) => Value::String(text),
        Err(_) => Value::Null,
    }
}

fn error_response(err: ForemanBotError) -> Response {
    let status = match &err {
        ForemanBotError::Validation(_) => StatusCode::BAD_REQUEST,
        ForemanBotError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ForemanBotError::Agent(_) => StatusCode::BAD_GATEWAY,
        ForemanBotError::TransportUnavailable(_) | ForemanBotError::AllTransportsFailed(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn no_broker() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorBody {
            error: "no broker configured".to_string(),
        }),
    )
        .into_response()
}

fn broker_error(err: redis::RedisError) -> Response {
    warn!(error = %err, "broker proxy call failed");
    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn authorize(
    headers: &HeaderMap,
    token: &str,
) -> std::result::Result<(), (StatusCode, Json<ErrorBody>)> {
    let header = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let bearer = header.strip_prefix("Bearer ").unwrap_or("");

    if bearer == token || api_key == token {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "Unauthorized".to_string(),
            }),
        ))
    }
}

pub async fn run(host: &str, port: u16, config_path: &str, token: &str) -> Result<()> {
    run_with_shutdown(host, port, config_path, token, futures::future::pending::<()>()).await
}

pub async fn run_with_shutdown<F>(
    host: &str,
    port: u16,
    config_path: &str,
    token: &str,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let config = Config::from_file(config_path)?;
    let broker = match &config.redis {
        Some(redis) => Some(BrokerProxy::connect(&redis.url).await?),
        None => None,
    };
    let bot = Arc::new(ForemanBot::from_config(config).await?);
    let state = AppState {
        bot,
        responses: Arc::new(ResponseStore::default()),
        broker,
        token: token.to_string(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(|e| ForemanBotError::Runtime(e.to_string()))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ForemanBotError::Runtime(e.to_string()))?;
    Ok(())
}
