//! Chat Completions API driver.
//!
//! Implements [`LlmDriver`] against the OpenAI-style
//! `/v1/chat/completions` endpoint: a bounded non-streaming request for the
//! tool loop, and an SSE token stream for the final answer.

use axum::http::StatusCode;
use futures::StreamExt;
use serde_json::Value;
use tracing::warn;

use crate::error::BridgeError;

use super::{CompletionMessage, CompletionRequest, LlmDriver, LlmSettings, TokenStream};

/// End-of-stream sentinel frame emitted by the completion API.
const DONE_SENTINEL: &str = "[DONE]";

/// Driver for the Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChatCompletionsDriver {
    /// Create a new driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, settings }
    }

    fn request_body(&self, req: &CompletionRequest, stream: bool) -> Value {
        serde_json::json!({
            "model": self.settings.model,
            "messages": req.messages,
            "tools": if req.tools.is_empty() { Value::Null } else { Value::Array(req.tools.clone()) },
            "max_tokens": self.settings.max_tokens,
            "stream": stream,
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, BridgeError> {
        let url = self.settings.provider.build_chat_url(&self.settings.base_url);

        let mut rb = self.http.post(&url).json(body);
        if let Some(key) = &self.settings.api_key {
            rb = rb.bearer_auth(key);
        }
        for (name, value) in self.settings.provider.attribution_headers() {
            rb = rb.header(name, value);
        }

        let resp = rb.send().await?;
        let status = resp.status();

        if status == StatusCode::PAYMENT_REQUIRED {
            return Err(BridgeError::PaymentRequired);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::UpstreamCompletionError {
                status,
                body: body.chars().take(300).collect(),
            });
        }

        Ok(resp)
    }
}

#[async_trait::async_trait]
impl LlmDriver for ChatCompletionsDriver {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionMessage, BridgeError> {
        let body = self.request_body(&req, false);
        let resp = self.post(&body).await?;

        let v: Value = resp
            .json()
            .await
            .map_err(|e| BridgeError::Rpc(format!("invalid completion response: {e}")))?;
        let message = v
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| {
                BridgeError::Rpc(format!("completion response missing choices[0].message: {v}"))
            })?;

        serde_json::from_value(message.clone())
            .map_err(|e| BridgeError::Rpc(format!("invalid completion message: {e}")))
    }

    async fn stream_text(&self, req: CompletionRequest) -> Result<TokenStream, BridgeError> {
        let body = self.request_body(&req, true);
        let resp = self.post(&body).await?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::stream! {
            let mut buf = Vec::<u8>::new();

            futures::pin_mut!(byte_stream);
            'outer: while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(BridgeError::UpstreamUnreachable(e));
                        break;
                    }
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = find_double_newline(&buf) {
                    let frame = buf.drain(..pos + 2).collect::<Vec<_>>();
                    let text = String::from_utf8_lossy(&frame);

                    for line in text.lines() {
                        let line = line.trim();
                        let Some(data) = line.strip_prefix("data:") else {
                            continue;
                        };
                        let data = data.trim();

                        if data == DONE_SENTINEL {
                            break 'outer;
                        }

                        let v: Value = match serde_json::from_str(data) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(
                                    name: "llm.stream.malformed_frame",
                                    error = %e,
                                    "skipping undecodable delta frame"
                                );
                                continue;
                            }
                        };

                        if let Some(token) = v["choices"][0]["delta"]
                            .get("content")
                            .and_then(Value::as_str)
                            && !token.is_empty()
                        {
                            yield Ok(token.to_string());
                        }
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}
