//! Wire types for the JSON-RPC tool backend.
//!
//! The backend speaks JSON-RPC 2.0 envelopes (`{jsonrpc, id, method, params}`)
//! over HTTP. Envelopes the bridge builds itself go through the helpers here;
//! envelopes proxied on behalf of a client are forwarded as opaque bytes and
//! never touch these types.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::BridgeError;

/// A tool descriptor advertised by the backend at discovery time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(rename = "outputSchema", default)]
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<McpTool>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    #[serde(rename = "structuredContent", default)]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    /// Flatten content blocks into the text fed back to the completion API.
    ///
    /// Text blocks contribute their text; other block kinds are rendered as
    /// a tagged placeholder. Falls back to `structuredContent`, then to the
    /// raw JSON, so the model always receives something to reason about.
    #[must_use]
    pub fn text_content(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        for block in &self.content {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        parts.push(text.to_string());
                    }
                }
                Some(other) => parts.push(format!("[{other}]")),
                None => parts.push(block.to_string()),
            }
        }

        if parts.is_empty() {
            if let Some(structured) = &self.structured_content {
                return structured.to_string();
            }
            return serde_json::to_value(self)
                .map(|v| v.to_string())
                .unwrap_or_default();
        }

        parts.join("\n")
    }
}

/// Build a JSON-RPC request envelope.
#[must_use]
pub fn rpc_request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build a JSON-RPC notification envelope (no `id`, no response expected).
#[must_use]
pub fn rpc_notification(method: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
    })
}

/// Extract the `result` member of a response envelope.
///
/// A JSON-RPC `error` member becomes [`BridgeError::Rpc`], as does a response
/// with neither member.
pub fn rpc_result(envelope: &Value) -> Result<&Value, BridgeError> {
    if let Some(err) = envelope.get("error") {
        return Err(BridgeError::Rpc(err.to_string()));
    }
    envelope
        .get("result")
        .ok_or_else(|| BridgeError::Rpc(format!("response missing result: {envelope}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_joins_text_blocks() {
        let result = CallToolResult {
            content: vec![
                json!({"type": "text", "text": "3 messages found"}),
                json!({"type": "text", "text": "newest: hello"}),
            ],
            is_error: false,
            structured_content: None,
        };
        assert_eq!(result.text_content(), "3 messages found\nnewest: hello");
    }

    #[test]
    fn text_content_tags_non_text_blocks() {
        let result = CallToolResult {
            content: vec![json!({"type": "image", "data": "...", "mimeType": "image/png"})],
            is_error: false,
            structured_content: None,
        };
        assert_eq!(result.text_content(), "[image]");
    }

    #[test]
    fn text_content_falls_back_to_structured() {
        let result = CallToolResult {
            content: vec![],
            is_error: false,
            structured_content: Some(json!({"count": 3})),
        };
        assert_eq!(result.text_content(), r#"{"count":3}"#);
    }

    #[test]
    fn rpc_result_rejects_error_envelopes() {
        let envelope =
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "no such method"}});
        let err = rpc_result(&envelope).unwrap_err();
        assert!(matches!(err, BridgeError::Rpc(_)));
    }

    #[test]
    fn rpc_result_requires_a_result_member() {
        let envelope = json!({"jsonrpc": "2.0", "id": 1});
        assert!(rpc_result(&envelope).is_err());
    }

    #[test]
    fn request_envelope_shape() {
        let req = rpc_request(7, "tools/list", json!({}));
        assert_eq!(req["jsonrpc"], "2.0");
        assert_eq!(req["id"], 7);
        assert_eq!(req["method"], "tools/list");
    }
}
