use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;

use crate::bus::{Broadcaster, InputQueue, InputSource};
use crate::cli::Provider;
use crate::control::switch_provider_input;
use crate::provider::{PROVIDERS, env_present, parse_provider_name};
use crate::runtime::AgentRuntime;
use crate::telemetry::TelemetrySink;

pub const SERVER_AUTH_TOKEN_ENV: &str = "SKILLHOST_SERVER_AUTH_TOKEN";

#[derive(Clone)]
pub struct ServerState {
    pub runtime: Arc<AgentRuntime>,
    pub inputs: InputQueue,
    pub broadcaster: Broadcaster,
    pub telemetry: TelemetrySink,
    pub profile: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub app_name: &'static str,
    pub profile: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub generation: u64,
    pub provider: String,
    pub model: String,
    pub tools: usize,
    pub capabilities: usize,
    pub load_issues: usize,
    pub web_clients: usize,
}

#[derive(Debug, Serialize)]
pub struct SkillToolView {
    pub name: String,
    pub description: String,
    pub namespace: String,
    pub module: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatSendRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ModelSelectRequest {
    pub provider: String,
}

#[derive(Debug, Serialize)]
pub struct ModelOption {
    pub id: &'static str,
    pub label: &'static str,
    pub configured: bool,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub fn check_server_auth(
    state: &ServerState,
    headers: &axum::http::HeaderMap,
) -> Result<(), ApiError> {
    let Some(expected_token) = state.auth_token.as_deref() else {
        return Ok(());
    };

    let header_value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let provided_token = header_value
        .strip_prefix("Bearer ")
        .unwrap_or_default()
        .trim();

    if provided_token.is_empty() || provided_token != expected_token {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization bearer token",
        ));
    }

    Ok(())
}

pub fn provider_label(provider: Provider) -> &'static str {
    match provider {
        Provider::Auto => "Auto-detect",
        Provider::Deepseek => "DeepSeek",
        Provider::Qwen => "Qwen",
        Provider::Openai => "OpenAI",
        Provider::NimMinimaxM2 => "NIM / MiniMax-M2",
        Provider::NimGlm47 => "NIM / GLM4.7",
    }
}

pub fn model_options() -> Vec<ModelOption> {
    PROVIDERS
        .iter()
        .map(|spec| ModelOption {
            id: spec.provider.id(),
            label: provider_label(spec.provider),
            configured: env_present(spec.api_key_env),
        })
        .collect()
}

fn enqueue(state: &ServerState, text: String) -> Result<(), ApiError> {
    if state.inputs.push(InputSource::Web, text) {
        return Ok(());
    }
    Err(api_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "agent session is not accepting input",
    ))
}

pub async fn handle_server_health(
    State(state): State<Arc<ServerState>>,
) -> Json<ServerHealthResponse> {
    Json(ServerHealthResponse {
        status: "ok",
        app_name: "skillhost",
        profile: state.profile.clone(),
    })
}

pub async fn handle_status(State(state): State<Arc<ServerState>>) -> Json<StatusResponse> {
    let generation = state.runtime.current();
    Json(StatusResponse {
        generation: generation.id,
        provider: generation.provider.id().to_string(),
        model: generation.model_name.clone(),
        tools: generation.tools.len(),
        capabilities: generation.capabilities.len(),
        load_issues: generation.issues.len(),
        web_clients: state.broadcaster.subscribers(),
    })
}

pub async fn handle_skills(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let generation = state.runtime.current();
    let tools = generation
        .tools
        .iter()
        .map(|entry| SkillToolView {
            name: entry.tool.name().to_string(),
            description: entry.tool.description().to_string(),
            namespace: entry.origin.namespace.clone(),
            module: entry.origin.module.clone(),
        })
        .collect::<Vec<_>>();
    Json(json!({
        "generation": generation.id,
        "capabilities": generation.capabilities,
        "tools": tools,
        "issues": generation.issues,
    }))
}

pub async fn handle_chat_send(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<ChatSendRequest>,
) -> ApiResult<Value> {
    check_server_auth(&state, &headers)?;
    let message = request.message.trim();
    if message.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "message cannot be empty"));
    }
    enqueue(&state, message.to_string())?;
    Ok(Json(json!({ "status": "sent" })))
}

pub async fn handle_chat_models(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let generation = state.runtime.current();
    Json(json!({
        "current": generation.provider.id(),
        "model": generation.model_name,
        "models": model_options(),
    }))
}

pub async fn handle_chat_model(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<ModelSelectRequest>,
) -> ApiResult<Value> {
    check_server_auth(&state, &headers)?;
    let provider = match parse_provider_name(&request.provider) {
        Ok(Provider::Auto) | Err(_) => {
            return Err(api_error(StatusCode::BAD_REQUEST, "unsupported provider"));
        }
        Ok(provider) => provider,
    };
    enqueue(&state, switch_provider_input(provider))?;
    state.telemetry.emit(
        "server.provider_switch_requested",
        json!({ "provider": provider.id() }),
    );
    Ok(Json(json!({ "status": "switching", "provider": provider.id() })))
}

pub async fn handle_chat_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut outbound = state.broadcaster.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            match outbound.recv().await {
                Ok(text) => {
                    if let Err(err) = sender.send(Message::Text(text.into())).await {
                        tracing::debug!(error = %err, "websocket send failed; closing");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "websocket client lagged; messages dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let inputs = state.inputs.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    let trimmed = text.as_str().trim();
                    if !trimmed.is_empty() && !inputs.push(InputSource::Web, trimmed) {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(error = %err, "websocket receive failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

pub fn build_server_router(state: Arc<ServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(handle_server_health))
        .route("/api/status", get(handle_status))
        .route("/api/skills", get(handle_skills))
        .route("/api/chat/send", post(handle_chat_send))
        .route("/api/chat/models", get(handle_chat_models))
        .route("/api/chat/model", post(handle_chat_model))
        .route("/api/chat/ws", get(handle_chat_ws))
        .with_state(state)
}

pub fn server_auth_token_from_env() -> Option<String> {
    std::env::var(SERVER_AUTH_TOKEN_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn run_server<F>(state: ServerState, host: &str, port: u16, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;

    state.telemetry.emit(
        "server.started",
        json!({ "host": host, "port": port, "profile": state.profile }),
    );
    println!(
        "Web console listening on http://{} (health: /healthz, chat: /api/chat/send, ws: /api/chat/ws)",
        addr
    );

    axum::serve(listener, build_server_router(Arc::new(state)))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server runtime failed")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}
