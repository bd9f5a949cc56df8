//! Per-turn tool registry with completion-API name mapping.
//!
//! Backend tool names may contain dots (`gmail.search_messages`), which the
//! completion API rejects in function identifiers (`^[a-zA-Z0-9_-]+$`). The
//! registry substitutes `_` for `.` on the way out and resolves mapped names
//! back through an index, so the round trip is exact for every discovered
//! tool. The index must stay a bijection for the duration of a conversation;
//! a discovery response whose names collide after substitution keeps the
//! first tool and drops the rest.

use std::collections::HashMap;

use serde_json::{Value, json};
use tracing::warn;

use crate::mcp::types::McpTool;

const SUBSTITUTED: char = '.';
const REPLACEMENT: char = '_';

/// Tool descriptors for one turn, with the mapped-name index.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    // mapped name -> (backend name, descriptor)
    index: HashMap<String, (String, McpTool)>,
    // completion-API order follows discovery order
    mapped_names: Vec<String>,
}

impl ToolRegistry {
    /// Build the registry from one discovery response.
    #[must_use]
    pub fn from_discovery(tools: Vec<McpTool>) -> Self {
        let mut registry = Self::default();

        for tool in tools {
            let mapped = sanitize_name(&tool.name);
            if registry.index.contains_key(&mapped) {
                warn!(
                    name: "mcp.tools.name_collision",
                    tool = %tool.name,
                    mapped = %mapped,
                    "tool name collides after substitution; skipping"
                );
                continue;
            }
            registry
                .index
                .insert(mapped.clone(), (tool.name.clone(), tool));
            registry.mapped_names.push(mapped);
        }

        registry
    }

    /// Number of tools available this turn.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mapped_names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mapped_names.is_empty()
    }

    /// Resolve a mapped name back to the backend tool name.
    #[must_use]
    pub fn resolve(&self, mapped: &str) -> Option<&str> {
        self.index.get(mapped).map(|(backend, _)| backend.as_str())
    }

    /// Tool descriptors in the completion API's function schema format.
    #[must_use]
    pub fn completion_tools_json(&self) -> Vec<Value> {
        self.mapped_names
            .iter()
            .filter_map(|mapped| {
                let (_, tool) = self.index.get(mapped)?;
                Some(json!({
                    "type": "function",
                    "function": {
                        "name": mapped,
                        "description": tool.description.as_deref().unwrap_or(""),
                        "parameters": tool.input_schema,
                    }
                }))
            })
            .collect()
    }
}

/// Substitute the completion-API-hostile character.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    name.replace(SUBSTITUTED, &REPLACEMENT.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> McpTool {
        McpTool {
            name: name.to_string(),
            title: None,
            description: Some(format!("{name} tool")),
            input_schema: json!({"type": "object", "properties": {}}),
            output_schema: None,
        }
    }

    #[test]
    fn round_trips_names_containing_the_substituted_character() {
        let registry = ToolRegistry::from_discovery(vec![
            tool("gmail.search_messages"),
            tool("calendar.create_event"),
            tool("plain_name"),
        ]);

        for original in ["gmail.search_messages", "calendar.create_event", "plain_name"] {
            let mapped = sanitize_name(original);
            assert!(!mapped.contains('.'));
            assert_eq!(registry.resolve(&mapped), Some(original));
        }
    }

    #[test]
    fn collision_keeps_first_tool_only() {
        let registry =
            ToolRegistry::from_discovery(vec![tool("a.b"), tool("a_b"), tool("other")]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("a_b"), Some("a.b"));
    }

    #[test]
    fn completion_descriptors_use_mapped_names() {
        let registry = ToolRegistry::from_discovery(vec![tool("gmail.search_messages")]);
        let descriptors = registry.completion_tools_json();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0]["type"], "function");
        assert_eq!(descriptors[0]["function"]["name"], "gmail_search_messages");
        assert_eq!(
            descriptors[0]["function"]["parameters"]["type"],
            "object"
        );
    }

    #[test]
    fn unknown_mapped_name_does_not_resolve() {
        let registry = ToolRegistry::from_discovery(vec![tool("known")]);
        assert_eq!(registry.resolve("unknown"), None);
    }
}
