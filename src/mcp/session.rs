//! Upstream session registry and handshake coordinator.
//!
//! The tool backend requires a handshake before anything else: send
//! `initialize`, capture the session token from the response headers, then
//! send the `notifications/initialized` notification carrying that token.
//! Every subsequent call must present the token.
//!
//! Exactly one session is pinned per registry (and one registry per process).
//! [`SessionRegistry::ensure_session`] is idempotent and safe under
//! concurrent invocation: the state mutex is held across the handshake, so
//! however many callers race on a cold start, exactly one `initialize` goes
//! upstream and every caller observes the same token.

use reqwest::header::ACCEPT;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::mcp::types::{rpc_notification, rpc_request};

/// Header carrying the opaque session token, both directions.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Accept value for every backend call: responses arrive either as a single
/// JSON body or as one SSE frame on a held-open POST.
pub const ACCEPT_VALUE: &str = "application/json, text/event-stream";

const PROTOCOL_VERSION: &str = "2024-10-07";

/// Lifecycle of the pinned session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake attempted yet (or the last one failed).
    Unset,
    /// A handshake is in flight.
    Pending,
    /// Token captured; immutable for the rest of the process lifetime.
    Established(String),
}

/// Owns the single upstream session's lifecycle.
pub struct SessionRegistry {
    http: reqwest::Client,
    upstream_url: String,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("upstream_url", &self.upstream_url)
            .field("state", &self.snapshot())
            .finish()
    }
}

impl SessionRegistry {
    #[must_use]
    pub fn new(http: reqwest::Client, upstream_url: impl Into<String>) -> Self {
        Self {
            http,
            upstream_url: upstream_url.into(),
            state: Mutex::new(SessionState::Unset),
        }
    }

    /// Return the pinned session token, performing the handshake first if
    /// no session is established yet.
    ///
    /// Concurrent callers serialize on the state mutex: the first one in
    /// performs the handshake while the rest park on the lock and find
    /// `Established` when they acquire it. On failure the state reverts to
    /// `Unset` so a later call may retry; there is no retry within this call.
    pub async fn ensure_session(&self) -> Result<String, BridgeError> {
        let mut state = self.state.lock().await;

        if let SessionState::Established(token) = &*state {
            return Ok(token.clone());
        }

        *state = SessionState::Pending;
        match self.handshake().await {
            Ok(token) => {
                info!(
                    name: "mcp.session.established",
                    token_prefix = %token.chars().take(8).collect::<String>(),
                    "upstream session established"
                );
                *state = SessionState::Established(token.clone());
                Ok(token)
            }
            Err(e) => {
                *state = SessionState::Unset;
                Err(e)
            }
        }
    }

    /// Current lifecycle state without waiting.
    ///
    /// The mutex is held for the whole handshake, so failing to acquire it
    /// here means a handshake is in flight.
    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        match self.state.try_lock() {
            Ok(guard) => guard.clone(),
            Err(_) => SessionState::Pending,
        }
    }

    /// Record a session token observed on an upstream response.
    ///
    /// Once established the pinned token is immutable: an upstream that
    /// starts answering with a different token is logged and ignored rather
    /// than silently overwriting the session every caller is using.
    pub async fn note_upstream_token(&self, observed: &str) {
        let state = self.state.lock().await;
        if let SessionState::Established(pinned) = &*state
            && pinned != observed
        {
            warn!(
                name: "mcp.session.rotation_ignored",
                pinned_prefix = %pinned.chars().take(8).collect::<String>(),
                observed_prefix = %observed.chars().take(8).collect::<String>(),
                "upstream issued a different session token; keeping the pinned one"
            );
        }
    }

    async fn handshake(&self) -> Result<String, BridgeError> {
        debug!(name: "mcp.session.handshake", url = %self.upstream_url, "starting handshake");

        let init = rpc_request(
            1,
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        );

        let resp = self
            .http
            .post(&self.upstream_url)
            .header(ACCEPT, ACCEPT_VALUE)
            .json(&init)
            .send()
            .await?
            .error_for_status()?;

        let token = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .ok_or(BridgeError::HandshakeFailed)?;

        // Drain the initialize response body; only the header matters here.
        let _ = resp.bytes().await;

        // Some servers answer the notification with 202/204 or an empty
        // 200 body; any 2xx counts as delivered.
        self.http
            .post(&self.upstream_url)
            .header(ACCEPT, ACCEPT_VALUE)
            .header(SESSION_HEADER, &token)
            .json(&rpc_notification("notifications/initialized"))
            .send()
            .await?
            .error_for_status()?;

        Ok(token)
    }
}
