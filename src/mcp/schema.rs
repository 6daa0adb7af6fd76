//! Tool definition and result shapes shared by both namespaces.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One tool as advertised to the agent runtime.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDef {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

/// One content block of a tool result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// Result of a tool call. Domain failures are carried as `is_error` results
/// with a human-readable message; only schema-level failures (malformed
/// JSON, missing required fields, unknown tool) surface as transport errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text".to_string(),
                text: message.into(),
            }],
            is_error: false,
        }
    }

    pub fn json(value: &impl Serialize) -> Self {
        let text = serde_json::to_string_pretty(value)
            .unwrap_or_else(|error| format!("serialization failed: {error}"));
        Self {
            content: vec![ToolContent {
                kind: "text".to_string(),
                text,
            }],
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text".to_string(),
                text: message.into(),
            }],
            is_error: true,
        }
    }

    pub fn from_error(error: &crate::Error) -> Self {
        Self::error(error.to_string())
    }

    pub fn message(&self) -> &str {
        self.content
            .first()
            .map(|content| content.text.as_str())
            .unwrap_or_default()
    }
}

/// Decode tool arguments; failure is a transport error, not a tool result.
pub fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> crate::Result<T> {
    serde_json::from_value(args)
        .map_err(|error| anyhow::anyhow!("invalid tool arguments: {error}").into())
}

/// Transport error for an unrecognised tool name.
pub fn unknown_tool(name: &str) -> crate::Error {
    anyhow::anyhow!("unknown tool: {name}").into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_serializes_with_is_error_flag() {
        let ok = ToolCallResult::text("done");
        let value = serde_json::to_value(&ok).expect("serialize");
        assert_eq!(value["is_error"], false);
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][0]["text"], "done");

        let err = ToolCallResult::error("phase mismatch");
        let value = serde_json::to_value(&err).expect("serialize");
        assert_eq!(value["is_error"], true);
    }

    #[test]
    fn parse_args_rejects_missing_required_fields() {
        #[derive(Debug, Deserialize)]
        struct Args {
            #[allow(dead_code)]
            summary: String,
        }
        let err = parse_args::<Args>(serde_json::json!({})).expect_err("missing field");
        assert!(err.to_string().contains("invalid tool arguments"));
    }
}
