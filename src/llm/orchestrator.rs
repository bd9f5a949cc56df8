//! Tool-calling orchestrator.
//!
//! Drives one chat turn as an explicit state machine:
//!
//! 1. **Init**: append the user message; ensure a system message at index 0
//! 2. **Discover**: fetch tool descriptors from the backend, build the
//!    name-mapped registry
//! 3. **Completing**: bounded non-streaming completion
//! 4. **Dispatch**: execute requested tool calls, feed results back, return
//!    to Completing
//! 5. **Finalizing**: re-request with streaming and relay tokens
//!
//! The Completing/Dispatch cycle is bounded; a completion API that never
//! stops requesting tools ends the turn with `ToolLoopExceeded` instead of
//! looping forever.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::BridgeError;
use crate::mcp::{ToolBackend, ToolRegistry};
use crate::session::Session;

use super::{CompletionRequest, LlmDriver, Message, MessageRole, ToolCall};

/// Events emitted to the client over one chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// One streamed text token of the final answer.
    Token(String),
    /// Terminal error; the stream ends after this event.
    Error { message: String },
    /// The turn completed and the final answer was recorded.
    Done,
}

/// Named states of the per-turn machine. Loop termination is a transition
/// to `Finalizing`, not an incidental break.
enum Phase {
    Completing,
    Dispatch {
        content: Option<String>,
        calls: Vec<ToolCall>,
    },
    Finalizing,
}

/// Orchestrates completion requests and tool execution for chat turns.
#[derive(Clone)]
pub struct Orchestrator {
    driver: Arc<dyn LlmDriver>,
    backend: Arc<dyn ToolBackend>,
    system_prompt: String,
    max_tool_iterations: usize,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("max_tool_iterations", &self.max_tool_iterations)
            .finish()
    }
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        driver: Arc<dyn LlmDriver>,
        backend: Arc<dyn ToolBackend>,
        system_prompt: String,
        max_tool_iterations: usize,
    ) -> Self {
        Self {
            driver,
            backend,
            system_prompt,
            max_tool_iterations,
        }
    }

    /// Run one chat turn: append the user message to the session, drive the
    /// tool loop, stream the final answer.
    ///
    /// The caller is responsible for holding the session's turn lock so
    /// concurrent turns over the same conversation cannot interleave
    /// appends.
    pub fn chat_turn(
        &self,
        session: Session,
        user_message: String,
    ) -> impl Stream<Item = TurnEvent> + Send + use<> {
        let orchestrator = self.clone();
        let request_id = Uuid::new_v4().to_string();

        async_stream::stream! {
            // Init
            session.ensure_system(&orchestrator.system_prompt);
            session.add_user_message(&user_message);

            info!(
                name: "turn.start",
                request_id = %request_id,
                session_id = %session.id(),
                message_count = session.message_count(),
                "starting chat turn"
            );

            // Discover
            let registry = match orchestrator.backend.list_tools().await {
                Ok(tools) => ToolRegistry::from_discovery(tools),
                Err(e) => {
                    error!(name: "turn.discovery_failed", request_id = %request_id, error = %e, "tool discovery failed");
                    yield TurnEvent::Error { message: e.user_message() };
                    return;
                }
            };
            let tools_json = registry.completion_tools_json();
            debug!(name: "turn.tools", request_id = %request_id, tool_count = registry.len(), "tools discovered");

            let mut phase = Phase::Completing;
            let mut iterations = 0usize;

            loop {
                match phase {
                    Phase::Completing => {
                        if iterations >= orchestrator.max_tool_iterations {
                            let err = BridgeError::ToolLoopExceeded {
                                limit: orchestrator.max_tool_iterations,
                            };
                            error!(name: "turn.tool_loop_exceeded", request_id = %request_id, limit = orchestrator.max_tool_iterations, "aborting runaway tool loop");
                            yield TurnEvent::Error { message: err.user_message() };
                            return;
                        }
                        iterations += 1;

                        let req = CompletionRequest {
                            messages: session.messages(),
                            tools: tools_json.clone(),
                        };
                        let msg = match orchestrator.driver.complete(req).await {
                            Ok(m) => m,
                            Err(e) => {
                                error!(name: "turn.completion_failed", request_id = %request_id, error = %e, "completion request failed");
                                yield TurnEvent::Error { message: e.user_message() };
                                return;
                            }
                        };

                        phase = if msg.has_tool_calls() {
                            Phase::Dispatch {
                                content: msg.content,
                                calls: msg.tool_calls.unwrap_or_default(),
                            }
                        } else {
                            Phase::Finalizing
                        };
                    }

                    Phase::Dispatch { content, calls } => {
                        info!(
                            name: "turn.tool_dispatch",
                            request_id = %request_id,
                            iteration = iterations,
                            call_count = calls.len(),
                            "executing requested tool calls"
                        );

                        session.add_message(Message {
                            role: MessageRole::Assistant,
                            content: content.unwrap_or_default(),
                            tool_call_id: None,
                            tool_calls: Some(calls.clone()),
                        });

                        for call in &calls {
                            let result_text =
                                orchestrator.execute_call(&registry, call, &request_id).await;
                            session.add_message(Message::tool_result(call.id.clone(), result_text));
                        }

                        phase = Phase::Completing;
                    }

                    Phase::Finalizing => {
                        let req = CompletionRequest {
                            messages: session.messages(),
                            tools: tools_json.clone(),
                        };
                        let token_stream = match orchestrator.driver.stream_text(req).await {
                            Ok(s) => s,
                            Err(e) => {
                                error!(name: "turn.finalize_failed", request_id = %request_id, error = %e, "streaming completion failed");
                                yield TurnEvent::Error { message: e.user_message() };
                                return;
                            }
                        };

                        let mut full_response = String::new();
                        futures::pin_mut!(token_stream);
                        while let Some(token) = token_stream.next().await {
                            match token {
                                Ok(t) => {
                                    full_response.push_str(&t);
                                    yield TurnEvent::Token(t);
                                }
                                Err(e) => {
                                    error!(name: "turn.stream_failed", request_id = %request_id, error = %e, "token stream interrupted");
                                    yield TurnEvent::Error { message: e.user_message() };
                                    return;
                                }
                            }
                        }

                        session.add_message(Message::text(MessageRole::Assistant, full_response));
                        info!(
                            name: "turn.done",
                            request_id = %request_id,
                            session_id = %session.id(),
                            iterations = iterations,
                            "chat turn complete"
                        );
                        yield TurnEvent::Done;
                        return;
                    }
                }
            }
        }
    }

    /// Execute one requested call, resolving the mapped name back to the
    /// backend name. Failures become error text fed to the model rather
    /// than ending the turn.
    async fn execute_call(
        &self,
        registry: &ToolRegistry,
        call: &ToolCall,
        request_id: &str,
    ) -> String {
        let Some(backend_name) = registry.resolve(&call.function.name) else {
            error!(
                name: "turn.unknown_tool",
                request_id = %request_id,
                tool = %call.function.name,
                "model requested a tool not present in this turn's discovery"
            );
            return format!("Error: unknown tool {}", call.function.name);
        };

        let arguments: Value = serde_json::from_str(&call.function.arguments)
            .unwrap_or(Value::Object(serde_json::Map::new()));

        info!(
            name: "turn.tool_call",
            request_id = %request_id,
            tool_id = %call.id,
            tool = %backend_name,
            "executing tool call"
        );

        match self.backend.call_tool(backend_name, arguments).await {
            Ok(result) => {
                let text = result.text_content();
                debug!(
                    name: "turn.tool_result",
                    request_id = %request_id,
                    tool_id = %call.id,
                    result_length = text.len(),
                    "tool call succeeded"
                );
                text
            }
            Err(e) => {
                error!(
                    name: "turn.tool_failed",
                    request_id = %request_id,
                    tool_id = %call.id,
                    error = %e,
                    "tool call failed"
                );
                format!("Error: {e}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionMessage, TokenStream, ToolCallFunction};
    use crate::mcp::types::{CallToolResult, McpTool};
    use crate::session::SessionStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Driver double fed from a script of completion results; the streaming
    /// path always yields the configured tokens.
    struct ScriptedDriver {
        completions: Mutex<VecDeque<Result<CompletionMessage, BridgeError>>>,
        tokens: Vec<&'static str>,
        complete_calls: Mutex<usize>,
    }

    impl ScriptedDriver {
        fn new(
            completions: Vec<Result<CompletionMessage, BridgeError>>,
            tokens: Vec<&'static str>,
        ) -> Self {
            Self {
                completions: Mutex::new(completions.into()),
                tokens,
                complete_calls: Mutex::new(0),
            }
        }

        fn message(content: Option<&str>, tool_calls: Option<Vec<ToolCall>>) -> CompletionMessage {
            serde_json::from_value(json!({
                "content": content,
                "tool_calls": tool_calls,
            }))
            .unwrap()
        }

        fn weather_call() -> ToolCall {
            ToolCall {
                id: "call_1".to_string(),
                call_type: "function".to_string(),
                function: ToolCallFunction {
                    name: "get_weather".to_string(),
                    arguments: r#"{"city":"Paris"}"#.to_string(),
                },
            }
        }
    }

    #[async_trait]
    impl LlmDriver for ScriptedDriver {
        async fn complete(&self, _req: CompletionRequest) -> Result<CompletionMessage, BridgeError> {
            *self.complete_calls.lock().unwrap() += 1;
            self.completions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Self::message(None, None)))
        }

        async fn stream_text(&self, _req: CompletionRequest) -> Result<TokenStream, BridgeError> {
            let tokens = self.tokens.clone();
            Ok(Box::pin(futures::stream::iter(
                tokens.into_iter().map(|t| Ok(t.to_string())),
            )))
        }
    }

    /// Backend double advertising one tool and recording invocations.
    struct RecordingBackend {
        tools: Vec<McpTool>,
        calls: Mutex<Vec<(String, Value)>>,
        result_text: &'static str,
    }

    impl RecordingBackend {
        fn with_weather_tool() -> Self {
            Self {
                tools: vec![McpTool {
                    name: "get_weather".to_string(),
                    title: None,
                    description: Some("Current weather for a city".to_string()),
                    input_schema: json!({
                        "type": "object",
                        "properties": {"city": {"type": "string"}},
                        "required": ["city"]
                    }),
                    output_schema: None,
                }],
                calls: Mutex::new(Vec::new()),
                result_text: "Sunny, 21C",
            }
        }
    }

    #[async_trait]
    impl ToolBackend for RecordingBackend {
        async fn list_tools(&self) -> Result<Vec<McpTool>, BridgeError> {
            Ok(self.tools.clone())
        }

        async fn call_tool(
            &self,
            name: &str,
            arguments: Value,
        ) -> Result<CallToolResult, BridgeError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments));
            Ok(CallToolResult {
                content: vec![json!({"type": "text", "text": self.result_text})],
                is_error: false,
                structured_content: None,
            })
        }
    }

    fn orchestrator(driver: Arc<ScriptedDriver>, backend: Arc<RecordingBackend>) -> Orchestrator {
        Orchestrator::new(driver, backend, "You are a test assistant.".to_string(), 10)
    }

    async fn collect(stream: impl Stream<Item = TurnEvent>) -> Vec<TurnEvent> {
        futures::pin_mut!(stream);
        let mut out = Vec::new();
        while let Some(event) = stream.next().await {
            out.push(event);
        }
        out
    }

    fn roles(session: &Session) -> Vec<MessageRole> {
        session.messages().iter().map(|m| m.role).collect()
    }

    #[tokio::test]
    async fn no_tool_calls_goes_straight_to_finalizing() {
        let driver = Arc::new(ScriptedDriver::new(
            vec![Ok(ScriptedDriver::message(Some("hi"), None))],
            vec!["Hello", "!"],
        ));
        let backend = Arc::new(RecordingBackend::with_weather_tool());
        let store = SessionStore::new();
        let session = store.create();

        let events = collect(
            orchestrator(Arc::clone(&driver), Arc::clone(&backend))
                .chat_turn(session.clone(), "hello".to_string()),
        )
        .await;

        assert_eq!(
            events,
            vec![
                TurnEvent::Token("Hello".to_string()),
                TurnEvent::Token("!".to_string()),
                TurnEvent::Done,
            ]
        );
        assert!(backend.calls.lock().unwrap().is_empty());
        assert_eq!(
            roles(&session),
            vec![MessageRole::System, MessageRole::User, MessageRole::Assistant]
        );
        assert_eq!(session.messages()[2].content, "Hello!");
    }

    #[tokio::test]
    async fn weather_scenario_produces_expected_role_order() {
        let driver = Arc::new(ScriptedDriver::new(
            vec![
                Ok(ScriptedDriver::message(
                    None,
                    Some(vec![ScriptedDriver::weather_call()]),
                )),
                Ok(ScriptedDriver::message(Some("done"), None)),
            ],
            vec!["It is ", "sunny"],
        ));
        let backend = Arc::new(RecordingBackend::with_weather_tool());
        let store = SessionStore::new();
        let session = store.create();

        let events = collect(
            orchestrator(Arc::clone(&driver), Arc::clone(&backend))
                .chat_turn(session.clone(), "what's the weather".to_string()),
        )
        .await;

        assert_eq!(events.last(), Some(&TurnEvent::Done));
        assert_eq!(
            roles(&session),
            vec![
                MessageRole::System,
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::Tool,
                MessageRole::Assistant,
            ]
        );

        let messages = session.messages();
        assert!(messages[2].tool_calls.is_some());
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(messages[3].content, "Sunny, 21C");
        assert_eq!(messages[4].content, "It is sunny");

        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "get_weather");
        assert_eq!(calls[0].1, json!({"city": "Paris"}));
    }

    #[tokio::test]
    async fn runaway_tool_loop_is_bounded() {
        // Every completion requests another tool call.
        let completions: Vec<Result<CompletionMessage, BridgeError>> = (0..20)
            .map(|_| {
                Ok(ScriptedDriver::message(
                    None,
                    Some(vec![ScriptedDriver::weather_call()]),
                ))
            })
            .collect();
        let driver = Arc::new(ScriptedDriver::new(completions, vec![]));
        let backend = Arc::new(RecordingBackend::with_weather_tool());
        let store = SessionStore::new();
        let session = store.create();

        let events = collect(
            orchestrator(Arc::clone(&driver), Arc::clone(&backend))
                .chat_turn(session, "loop forever".to_string()),
        )
        .await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            TurnEvent::Error { message } => assert!(message.contains("10")),
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(*driver.complete_calls.lock().unwrap(), 10);
    }

    #[tokio::test]
    async fn payment_required_yields_single_error_and_no_assistant_append() {
        let driver = Arc::new(ScriptedDriver::new(
            vec![Err(BridgeError::PaymentRequired)],
            vec![],
        ));
        let backend = Arc::new(RecordingBackend::with_weather_tool());
        let store = SessionStore::new();
        let session = store.create();

        let events = collect(
            orchestrator(Arc::clone(&driver), Arc::clone(&backend))
                .chat_turn(session.clone(), "hello".to_string()),
        )
        .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TurnEvent::Error { message } if message.contains("payment")));
        // The user message is recorded, but no assistant message for the turn.
        assert_eq!(roles(&session), vec![MessageRole::System, MessageRole::User]);
    }

    #[tokio::test]
    async fn unknown_mapped_tool_becomes_error_text_for_the_model() {
        let bogus_call = ToolCall {
            id: "call_9".to_string(),
            call_type: "function".to_string(),
            function: ToolCallFunction {
                name: "no_such_tool".to_string(),
                arguments: "{}".to_string(),
            },
        };
        let driver = Arc::new(ScriptedDriver::new(
            vec![
                Ok(ScriptedDriver::message(None, Some(vec![bogus_call]))),
                Ok(ScriptedDriver::message(Some("ok"), None)),
            ],
            vec!["recovered"],
        ));
        let backend = Arc::new(RecordingBackend::with_weather_tool());
        let store = SessionStore::new();
        let session = store.create();

        let events = collect(
            orchestrator(Arc::clone(&driver), Arc::clone(&backend))
                .chat_turn(session.clone(), "use a ghost tool".to_string()),
        )
        .await;

        assert_eq!(events.last(), Some(&TurnEvent::Done));
        let messages = session.messages();
        assert_eq!(messages[3].role, MessageRole::Tool);
        assert!(messages[3].content.starts_with("Error: unknown tool"));
        assert!(backend.calls.lock().unwrap().is_empty());
    }
}
