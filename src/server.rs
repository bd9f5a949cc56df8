//! Axum server wiring: the chat endpoint, the transparent proxy, and a
//! liveness probe.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::config::{AppConfig, resolve_target_account};
use crate::llm::{ChatCompletionsDriver, LlmSettings, Orchestrator, TurnEvent};
use crate::mcp::{McpClient, SESSION_HEADER};
use crate::proxy;
use crate::session::SessionStore;

/// Header carrying the conversation id back to the client on `/api/chat`,
/// since the body is a plain token stream.
const CONVERSATION_HEADER: &str = "x-session-id";

/// How often expired conversations are swept.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Start the server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>, settings: LlmSettings) -> anyhow::Result<()> {
    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.model,
        "LLM configuration loaded"
    );
    info!(
        name: "mcp.config.loaded",
        upstream = %config.upstream.url,
        "tool backend configured"
    );

    let mcp = Arc::new(McpClient::new(config.upstream.url.clone()));
    let driver = Arc::new(ChatCompletionsDriver::new(settings));

    let system_prompt = default_system_prompt(resolve_target_account(&config).as_deref());
    let orchestrator = Arc::new(Orchestrator::new(
        driver,
        Arc::clone(&mcp) as _,
        system_prompt,
        config.chat.max_tool_iterations,
    ));

    let sessions = SessionStore::new();

    // Sweep idle conversations in the background.
    let sweep_store = sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = sweep_store.cleanup_expired();
            if removed > 0 {
                info!(name: "sessions.swept", removed = removed, "removed expired conversations");
            }
        }
    });

    let state = AppState {
        mcp,
        orchestrator,
        sessions,
        config: Arc::clone(&config),
    };

    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %format!("http://{addr}"),
        "Server started"
    );

    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // The agent-builder front-end calls /mcp cross-origin and must be able
    // to read the session header.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(SESSION_HEADER),
            HeaderName::from_static(CONVERSATION_HEADER),
        ]);

    Router::new()
        .route("/api/chat", post(api_chat))
        .route("/mcp", post(proxy::mcp_post).get(proxy::mcp_get))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Request body for the chat endpoint.
#[derive(Debug, Deserialize)]
struct ChatRequest {
    /// User message content.
    message: String,
    /// Optional conversation ID (creates a new one if not provided).
    #[serde(default)]
    session_id: Option<String>,
}

/// POST /api/chat - run one chat turn and stream the answer as plain text.
///
/// Errors that occur after the stream has started are emitted as a single
/// inline error token rather than an HTTP failure.
async fn api_chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    let session = match &req.session_id {
        Some(id) => state.sessions.get_or_create(id),
        None => state.sessions.create(),
    };
    let session_id = session.id().to_string();

    info!(
        name: "chat.request",
        session_id = %session_id,
        message_length = req.message.len(),
        "received chat request"
    );

    let orchestrator = Arc::clone(&state.orchestrator);
    let turn_session = session.clone();
    let body_stream = async_stream::stream! {
        // One in-flight turn per conversation; later requests queue here.
        let _turn = turn_session.begin_turn().await;

        let events = orchestrator.chat_turn(turn_session.clone(), req.message);
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            match event {
                TurnEvent::Token(t) => yield Ok::<String, Infallible>(t),
                TurnEvent::Error { message } => {
                    yield Ok(format!("\n[error] {message}"));
                    break;
                }
                TurnEvent::Done => break,
            }
        }
    };

    let mut resp = Response::new(Body::from_stream(body_stream));
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        "text/plain; charset=utf-8".parse().expect("static header"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        "no-cache".parse().expect("static header"),
    );
    if let Ok(value) = session_id.parse() {
        headers.insert(HeaderName::from_static(CONVERSATION_HEADER), value);
    }
    resp
}

/// GET /healthz - liveness probe.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// System prompt for new conversations: date plus the account identity the
/// tool backend acts on.
fn default_system_prompt(target_account: Option<&str>) -> String {
    let date = chrono::Utc::now().format("%Y-%m-%d");
    match target_account {
        Some(account) => {
            format!("You are an assistant. Date: {date}. User account: {account}. You may call tools when useful.")
        }
        None => format!("You are an assistant. Date: {date}. You may call tools when useful."),
    }
}
