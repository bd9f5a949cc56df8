//! Error taxonomy for the bridge.
//!
//! Transport-level failures are never silently retried; they propagate to the
//! caller as a terminal error on the current request or chat turn. The session
//! registry reverts to `Unset` on [`BridgeError::HandshakeFailed`] so the next
//! request can retry cleanly.

use axum::http::StatusCode;

/// Errors raised by the session registry, the proxy, and the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The upstream handshake completed without returning a session token.
    #[error("upstream handshake returned no session token")]
    HandshakeFailed,

    /// Network-level failure talking to either backend.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(#[from] reqwest::Error),

    /// Non-2xx (other than 402) from the completion API.
    #[error("completion API returned {status}: {body}")]
    UpstreamCompletionError { status: StatusCode, body: String },

    /// HTTP 402 from the completion API. Never retried.
    #[error("completion API quota exhausted (402 Payment Required)")]
    PaymentRequired,

    /// An undecodable stream event. Skipped and logged where it occurs;
    /// surfaced only when a caller insists on decoding a single frame.
    #[error("malformed stream frame: {0}")]
    MalformedFrame(String),

    /// The completion/tool-dispatch cycle exceeded its iteration bound.
    #[error("tool-calling loop exceeded {limit} iterations")]
    ToolLoopExceeded { limit: usize },

    /// A JSON-RPC error object, or a response missing a required field.
    #[error("upstream rpc failure: {0}")]
    Rpc(String),
}

impl BridgeError {
    /// Message emitted as the inline error token in an already-started
    /// response stream.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::PaymentRequired => {
                "the completion provider declined the request: payment required".to_string()
            }
            Self::ToolLoopExceeded { limit } => {
                format!("the model kept requesting tools beyond the {limit}-call limit")
            }
            other => other.to_string(),
        }
    }
}
