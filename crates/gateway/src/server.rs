use std::{net::SocketAddr, sync::Arc};

use {
    anyhow::Context,
    axum::{
        Router,
        extract::{
            Query, State, WebSocketUpgrade,
            ws::rejection::WebSocketUpgradeRejection,
        },
        http::{HeaderValue, Method},
        response::{IntoResponse, Json, Response},
        routing::{get, post},
    },
    beacon_config::BeaconConfig,
    beacon_protocol::{Message, NEW_MESSAGE_TOPIC, UserId},
    beacon_store::{DurableStore, RedisStore},
    chrono::Utc,
    serde::Deserialize,
    serde_json::{Value, json},
    tower_http::cors::{AllowHeaders, CorsLayer},
    tracing::{info, warn},
};

use crate::{error::ApiError, state::GatewayState, ws::run_connection};

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade_handler))
        .route("/health", get(health_handler))
        .route("/api/pending", get(pending_handler))
        .route("/api/online", get(online_handler))
        .route("/api/test/send", post(test_send_handler))
        .route("/api/test/store", get(test_store_handler))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            },
        })
        .collect();

    // Credentials rule out wildcard headers, so mirror what the browser asks for.
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

#[cfg(feature = "prometheus")]
fn metrics_router(handle: beacon_metrics::PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Start the gateway HTTP + WebSocket server and run until ctrl-c.
pub async fn start_gateway(config: BeaconConfig) -> anyhow::Result<()> {
    let problems = config.gateway.validate();
    if !problems.is_empty() {
        anyhow::bail!("invalid gateway config: {}", problems.join("; "));
    }

    let store = RedisStore::connect(&config.store.url)
        .await
        .with_context(|| format!("connecting to store at {}", config.store.url))?;
    let pong = store.ping().await.context("store ping")?;
    info!(reply = %pong, "store reachable");
    let store: Arc<dyn DurableStore> = Arc::new(store);

    let state = GatewayState::new(store, config.gateway.clone());
    let tasks = state
        .spawn_background_tasks()
        .await
        .context("subscribing to message topic")?;

    let app = build_gateway_app(Arc::clone(&state), &config.server.allowed_origins);
    #[cfg(feature = "prometheus")]
    let app = match beacon_metrics::install_prometheus() {
        Ok(handle) => app.merge(metrics_router(handle)),
        Err(e) => {
            warn!(error = %e, "prometheus recorder unavailable, /metrics disabled");
            app
        },
    };

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("parsing listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    // Startup banner.
    let lines = [
        format!("beacon gateway v{}", state.version),
        format!("listening on {addr}"),
        format!("store: {}", config.store.url),
        format!("cors: {}", config.server.allowed_origins.join(", ")),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested, closing sessions");
            shutdown_state.close_all().await;
        })
        .await?;

    for task in tasks {
        task.abort();
    }
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: Option<String>,
}

fn parse_user_id(raw: Option<&str>) -> Result<UserId, ApiError> {
    let raw = raw
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("user_id required"))?;
    raw.parse()
        .map_err(|_| ApiError::bad_request("invalid user_id"))
}

async fn ws_upgrade_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<UserQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let user_id = parse_user_id(query.user_id.as_deref())?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(ws
        .on_upgrade(move |socket| run_connection(socket, state, user_id))
        .into_response())
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "total_connections": state.registry.session_count().await,
        "unique_users": state.registry.user_count().await,
        "timestamp": Utc::now(),
    }))
}

async fn pending_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>, ApiError> {
    let user_id = parse_user_id(query.user_id.as_deref())?;
    let messages: Vec<Value> = state
        .pending
        .list(user_id)
        .await?
        .into_iter()
        .map(|entry| serde_json::from_str(&entry).unwrap_or(Value::String(entry)))
        .collect();
    Ok(Json(json!({
        "user_id": user_id,
        "count": messages.len(),
        "messages": messages,
    })))
}

async fn online_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let user_ids = state.registry.online_users().await;
    Json(json!({
        "count": user_ids.len(),
        "user_ids": user_ids,
    }))
}

/// Publish a message onto the ingress topic as if the producer had.
async fn test_send_handler(
    State(state): State<Arc<GatewayState>>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let mut message: Message = serde_json::from_str(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid message: {e}")))?;
    if message.recipient_id == 0 || message.user_id == 0 {
        return Err(ApiError::bad_request("recipient_id and user_id are required"));
    }
    message.normalize();

    let payload = serde_json::to_string(&message)
        .map_err(|e| ApiError::bad_request(format!("invalid message: {e}")))?;
    state.store.publish(NEW_MESSAGE_TOPIC, &payload).await?;
    info!(
        message_id = %message.message_id,
        recipient_id = message.recipient_id,
        "test message published"
    );

    Ok(Json(json!({
        "status": "published",
        "message_id": message.message_id,
        "recipient": message.recipient_id,
        "timestamp": Utc::now(),
    })))
}

async fn test_store_handler(State(state): State<Arc<GatewayState>>) -> Result<Json<Value>, ApiError> {
    let pong = state
        .store
        .ping()
        .await
        .map_err(|e| ApiError::Unavailable(format!("store unreachable: {e}")))?;
    Ok(Json(json!({ "status": "ok", "ping": pong })))
}
