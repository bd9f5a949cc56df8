//! HTTP JSON-RPC client for the tool backend.
//!
//! Every call is a POST carrying a JSON-RPC envelope with the pinned session
//! token attached. The backend answers either with a single JSON body or by
//! holding the POST open and emitting exactly one SSE frame whose `id`
//! matches the request; both shapes decode to the same envelope here.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::BridgeError;
use crate::mcp::session::{ACCEPT_VALUE, SESSION_HEADER, SessionRegistry};
use crate::mcp::sse::{await_response, frames};
use crate::mcp::types::{CallToolResult, ListToolsResult, McpTool, rpc_request, rpc_result};

/// Connect timeout for the backend. No overall request timeout is set:
/// held-open streamed POSTs are the expected response shape.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Seam between the orchestrator and the tool backend.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Full tool discovery (all pages).
    async fn list_tools(&self) -> Result<Vec<McpTool>, BridgeError>;

    /// Invoke one tool by its backend name.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, BridgeError>;
}

/// Session-pinned JSON-RPC client for the upstream tool backend.
pub struct McpClient {
    http: reqwest::Client,
    upstream_url: String,
    session: Arc<SessionRegistry>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("upstream_url", &self.upstream_url)
            .field("session", &self.session)
            .finish()
    }
}

impl McpClient {
    /// Create a client for the given upstream base URL.
    #[must_use]
    pub fn new(upstream_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::with_http(http, upstream_url)
    }

    /// Create a client with a caller-supplied HTTP client.
    #[must_use]
    pub fn with_http(http: reqwest::Client, upstream_url: impl Into<String>) -> Self {
        let upstream_url = upstream_url.into();
        let session = Arc::new(SessionRegistry::new(http.clone(), upstream_url.clone()));
        Self {
            http,
            upstream_url,
            session,
            // id 1 belongs to the handshake's initialize call
            next_id: AtomicU64::new(2),
        }
    }

    /// The registry owning the pinned session.
    #[must_use]
    pub fn session(&self) -> &Arc<SessionRegistry> {
        &self.session
    }

    /// Shared HTTP client (reused by the transparent proxy).
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Upstream endpoint URL.
    #[must_use]
    pub fn upstream_url(&self) -> &str {
        &self.upstream_url
    }

    /// Issue one JSON-RPC request and return its `result` member.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let token = self.session.ensure_session().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        debug!(name: "mcp.request", method = method, id = id, "calling tool backend");

        let resp = self
            .http
            .post(&self.upstream_url)
            .header(ACCEPT, ACCEPT_VALUE)
            .header(SESSION_HEADER, &token)
            .json(&rpc_request(id, method, params))
            .send()
            .await?
            .error_for_status()?;

        if let Some(observed) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session.note_upstream_token(observed).await;
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let envelope = if content_type.starts_with("text/event-stream") {
            await_response(frames(resp.bytes_stream()), id).await?
        } else {
            let bytes = resp.bytes().await?;
            serde_json::from_slice::<Value>(&bytes).map_err(|e| {
                BridgeError::MalformedFrame(format!("response body is not JSON: {e}"))
            })?
        };

        rpc_result(&envelope).cloned()
    }
}

#[async_trait]
impl ToolBackend for McpClient {
    async fn list_tools(&self) -> Result<Vec<McpTool>, BridgeError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let result = self
                .request("tools/list", json!({ "cursor": cursor }))
                .await?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| BridgeError::Rpc(format!("invalid tools/list result: {e}")))?;
            out.extend(page.tools);

            match page.next_cursor {
                Some(nc) => cursor = Some(nc),
                None => break,
            }
        }

        Ok(out)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, BridgeError> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| BridgeError::Rpc(format!("invalid tools/call result: {e}")))
    }
}
