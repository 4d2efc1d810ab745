mod checksum;
mod codec;
mod config;
mod error;
mod fanout;
mod frame;
mod listener;
mod normalize;
mod poll_scheduler;
mod session;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use config::Config;
use fanout::SubscriberRegistry;
use listener::ListenerDeps;
use normalize::RecentWindow;
use session::SessionRegistry;

#[derive(Clone)]
struct AdminState {
    session_registry: Arc<SessionRegistry>,
    subscribers: Arc<SubscriberRegistry>,
    subscriber_token: Arc<str>,
}

// GET /health — liveness, mirrors the teacher's Fly.io health check.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// GET /jimi/stats — per-session registry dump (spec.md §6).
async fn jimi_stats(State(state): State<AdminState>) -> axum::Json<serde_json::Value> {
    let sessions = state.session_registry.snapshot().await;
    axum::Json(json!({
        "activeDevices": sessions.len(),
        "subscribers": state.subscribers.len().await,
        "sessions": sessions,
    }))
}

#[derive(Debug, Deserialize)]
struct SubscribeParams {
    token: Option<String>,
}

// GET /ws/subscribe?token=... — the subscriber push channel stand-in
// (spec.md §6's "subscriber channel" external collaborator, made concrete
// per SPEC_FULL.md §6).
async fn ws_subscribe(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeParams>,
    State(state): State<AdminState>,
) -> impl IntoResponse {
    let authenticated = params
        .token
        .as_deref()
        .map(|t| t == &*state.subscriber_token)
        .unwrap_or(false);
    ws.on_upgrade(move |socket| handle_subscriber_socket(socket, state, authenticated))
}

async fn handle_subscriber_socket(socket: WebSocket, state: AdminState, authenticated: bool) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let id = state.subscribers.attach(tx).await;
    if authenticated {
        state.subscribers.authenticate(id).await;
    } else {
        let _ = sender
            .send(Message::Text(
                json!({"type": "alert-data", "data": {"error": "unauthenticated"}}).to_string(),
            ))
            .await;
    }

    let forward = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Drain inbound frames so the socket stays alive; the subscriber channel
    // is push-only, so anything the client sends is ignored.
    while receiver.next().await.is_some() {}

    forward.abort();
    state.subscribers.detach(id).await;
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "telematics_gateway=info".into()),
        )
        .init();

    let config = Config::from_env();
    info!(
        ports = config.ports.len(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "telematics gateway starting"
    );

    let subscribers = SubscriberRegistry::new();
    let recent_window = Arc::new(Mutex::new(RecentWindow::new()));
    let session_registry = SessionRegistry::new();

    let deps = ListenerDeps {
        subscribers: subscribers.clone(),
        recent_window,
        session_registry: session_registry.clone(),
        idle_timeout: config.idle_timeout,
        max_connections: config.max_connections_per_port,
    };

    for port_config in config.ports.clone() {
        let deps = deps.clone();
        tokio::spawn(async move {
            if let Err(e) = listener::run_port(port_config.clone(), deps).await {
                error!(port = port_config.port, "listener exited: {e}");
            }
        });
    }

    let admin_state = AdminState {
        session_registry,
        subscribers,
        subscriber_token: config.subscriber_token.clone().into(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/jimi/stats", get(jimi_stats))
        .route("/ws/subscribe", get(ws_subscribe))
        .layer(cors)
        .with_state(admin_state);

    info!(addr = %config.admin_bind_addr, "admin surface listening");
    let listener = tokio::net::TcpListener::bind(&config.admin_bind_addr)
        .await
        .expect("bind admin address");
    axum::serve(listener, app).await.expect("admin server exited");
}
