use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One turn of an agent conversation. The history is append-only during a
/// run and is what callers persist between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum HistoryEntry {
    User { text: String },
    Model { text: String },
    ModelCall { name: String, args: Value },
    ToolResult { name: String, response: Value },
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User { text: text.into() }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::Model { text: text.into() }
    }

    pub fn call(name: impl Into<String>, args: Value) -> Self {
        Self::ModelCall {
            name: name.into(),
            args,
        }
    }

    pub fn tool_result(name: impl Into<String>, response: Value) -> Self {
        Self::ToolResult {
            name: name.into(),
            response,
        }
    }
}
