//! Transparent session-pinning proxy for the tool backend.
//!
//! Session-naive clients post JSON-RPC envelopes here as if they were
//! talking to the backend directly. The proxy pins one upstream session via
//! the registry, injects the session header on the way out, and relays the
//! upstream's status, body, and content type verbatim. The body is forwarded
//! as opaque bytes in both directions: no JSON parsing, no schema
//! validation, no assumptions about the envelope.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::AppState;
use crate::error::BridgeError;
use crate::mcp::SESSION_HEADER;
use crate::mcp::session::ACCEPT_VALUE;

/// POST /mcp - forward one envelope, relaying a JSON body or a held-open
/// event stream without buffering.
pub async fn mcp_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = match state.mcp.session().ensure_session().await {
        Ok(t) => t,
        Err(e) => return upstream_error(&e),
    };

    let content_type = header_or(&headers, header::CONTENT_TYPE.as_str(), "application/json");
    let accept = header_or(&headers, header::ACCEPT.as_str(), ACCEPT_VALUE);

    debug!(
        name: "proxy.forward",
        method = "POST",
        body_bytes = body.len(),
        "forwarding envelope upstream"
    );

    let upstream = state
        .mcp
        .http()
        .post(state.mcp.upstream_url())
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT, accept)
        .header(SESSION_HEADER, &token)
        .body(body)
        .send()
        .await;

    relay(&state, upstream, &token).await
}

/// GET /mcp - relay an event-stream subscription line by line.
pub async fn mcp_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = match state.mcp.session().ensure_session().await {
        Ok(t) => t,
        Err(e) => return upstream_error(&e),
    };

    let accept = header_or(&headers, header::ACCEPT.as_str(), "text/event-stream");

    let upstream = state
        .mcp
        .http()
        .get(state.mcp.upstream_url())
        .header(header::ACCEPT, accept)
        .header(SESSION_HEADER, &token)
        .send()
        .await;

    relay(&state, upstream, &token).await
}

/// Relay the upstream response: status and content type verbatim, body
/// streamed through unbuffered, exactly one header overlaid (the pinned
/// session token).
async fn relay(
    state: &AppState,
    upstream: Result<reqwest::Response, reqwest::Error>,
    token: &str,
) -> Response {
    let upstream = match upstream {
        Ok(r) => r,
        Err(e) => return upstream_error(&BridgeError::UpstreamUnreachable(e)),
    };

    if let Some(observed) = upstream
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        state.mcp.session().note_upstream_token(observed).await;
    }

    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(SESSION_HEADER, token)
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn header_or<'a>(headers: &'a HeaderMap, name: &str, fallback: &'a str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(fallback)
}

fn upstream_error(e: &BridgeError) -> Response {
    warn!(name: "proxy.upstream_error", error = %e, "proxied call failed");
    (StatusCode::BAD_GATEWAY, format!("upstream request failed: {e}")).into_response()
}
