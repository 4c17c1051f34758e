//! The model's action vocabulary and how responses are interpreted.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::model::{FunctionCall, ModelResponse};

pub const NO_RESPONSE_TEXT: &str = "The model returned no response.";

/// A validated tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
pub enum AgentAction {
    RunCommand {
        command: String,
        #[serde(default)]
        reasoning: Option<String>,
    },
    SendKeys {
        keys: String,
        #[serde(default)]
        reasoning: Option<String>,
    },
    TaskComplete {
        summary: String,
    },
}

impl AgentAction {
    pub fn parse(call: &FunctionCall) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json!({"name": call.name, "args": call.args}))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RunCommand { .. } => "run_command",
            Self::SendKeys { .. } => "send_keys",
            Self::TaskComplete { .. } => "task_complete",
        }
    }

    /// Arguments in the shape the model sent them.
    pub fn args(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("args").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

/// What the loop should do with one model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelTurn {
    Action(AgentAction),
    Text(String),
}

/// Validate a response into an action, falling back to its text (or a
/// generic placeholder) when the call is missing or unrecognized.
pub fn interpret(response: ModelResponse) -> ModelTurn {
    if let Some(call) = response.function_call.as_ref() {
        match AgentAction::parse(call) {
            Ok(action) => return ModelTurn::Action(action),
            Err(error) => {
                tracing::warn!(
                    target = "agent_terminal::agent",
                    name = %call.name,
                    %error,
                    "unrecognized function call; treating response as text"
                );
            }
        }
    }

    match response.text {
        Some(text) if !text.trim().is_empty() => ModelTurn::Text(text),
        _ => ModelTurn::Text(NO_RESPONSE_TEXT.to_string()),
    }
}

/// Function declarations offered to the model.
pub fn tool_declarations() -> Value {
    json!([
        {
            "name": "run_command",
            "description": "Run a shell command in the terminal and wait for it to finish. \
                Returns the command's output. Do not use for interactive programs.",
            "parameters": {
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "The command line to run."},
                    "reasoning": {"type": "string", "description": "Why this command is needed."}
                },
                "required": ["command", "reasoning"]
            }
        },
        {
            "name": "send_keys",
            "description": "Send keystrokes to the terminal and return the output seen shortly after. \
                Use for interactive prompts. Key names: Enter, Tab, Escape, Backspace, Up, Down, \
                Left, Right, Ctrl+C, Ctrl+D, Ctrl+Z; other tokens are typed literally.",
            "parameters": {
                "type": "object",
                "properties": {
                    "keys": {"type": "string", "description": "Keys to send, e.g. \"y Enter\"."},
                    "reasoning": {"type": "string", "description": "Why these keys are needed."}
                },
                "required": ["keys", "reasoning"]
            }
        },
        {
            "name": "task_complete",
            "description": "Declare the task finished.",
            "parameters": {
                "type": "object",
                "properties": {
                    "summary": {"type": "string", "description": "What was done."}
                },
                "required": ["summary"]
            }
        }
    ])
}
