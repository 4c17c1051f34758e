//! Bounded tool-calling agent driving one terminal session.

mod action;
mod control;
mod history;
mod model;
mod runner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capture::{CaptureOutcome, CaptureStatus};
use crate::error::BridgeError;
use crate::helpers::current_timestamp_ms;

pub use action::{interpret, tool_declarations, AgentAction, ModelTurn, NO_RESPONSE_TEXT};
pub use control::{RunControl, RunMode};
pub use history::HistoryEntry;
pub use model::{FunctionCall, ModelClient, ModelResponse};
pub use runner::{Agent, AgentRunState, StepEvent};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_MAX_ITERATIONS: usize = 20;

pub const SYSTEM_PROMPT: &str = "You are an operator working in a live terminal on the user's behalf. \
Use run_command for commands that finish on their own, and send_keys to answer interactive prompts \
or drive full-screen programs. Run one action at a time and read its output before deciding the next. \
Prefer non-interactive flags (for example -y or --no-pager). Never run destructive commands unless \
the user asked for them explicitly. When the task is done, call task_complete with a short summary. \
If you only need to answer a question, reply with text instead of calling a tool.";

/// Appended to the history when a command hits its timeout.
pub const TIMEOUT_NOTE: &str = "[system] The last command did not finish before the timeout. \
It may be waiting for input or still running. The run was stopped for review.";

/// What the agent can do to a terminal. Implemented by session handles and
/// by test doubles.
#[async_trait]
pub trait AgentTerminal: Send + Sync {
    async fn run_command(&self, command: &str) -> Result<CaptureOutcome, BridgeError>;
    async fn send_keys(&self, keys: &str) -> Result<CaptureOutcome, BridgeError>;
    /// Abort any pending capture. Returns whether one was pending.
    fn abort_capture(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub max_iterations: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Command,
    Keys,
    Complete,
    Text,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Done,
    Timeout,
    Aborted,
    Error,
}

impl From<CaptureStatus> for StepStatus {
    fn from(status: CaptureStatus) -> Self {
        match status {
            CaptureStatus::Done => Self::Done,
            CaptureStatus::Timeout => Self::Timeout,
            CaptureStatus::Aborted => Self::Aborted,
        }
    }
}

/// A user-visible log entry for one agent action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub timestamp_ms: u64,
}

impl StepRecord {
    fn new(kind: StepKind, status: StepStatus) -> Self {
        Self {
            kind,
            status,
            command: None,
            keys: None,
            summary: None,
            reasoning: None,
            output: None,
            timestamp_ms: current_timestamp_ms(),
        }
    }

    pub fn command(command: impl Into<String>, reasoning: Option<String>) -> Self {
        Self {
            command: Some(command.into()),
            reasoning,
            ..Self::new(StepKind::Command, StepStatus::Running)
        }
    }

    pub fn keys(keys: impl Into<String>, reasoning: Option<String>) -> Self {
        Self {
            keys: Some(keys.into()),
            reasoning,
            ..Self::new(StepKind::Keys, StepStatus::Running)
        }
    }

    pub fn complete(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            ..Self::new(StepKind::Complete, StepStatus::Done)
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            output: Some(text.into()),
            ..Self::new(StepKind::Text, StepStatus::Done)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: Some(message.into()),
            ..Self::new(StepKind::Error, StepStatus::Error)
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { summary: String },
    TextAnswer { text: String },
    Aborted,
    Error { message: String },
    IterationCapReached { iterations: usize },
}

impl RunOutcome {
    /// The run ended without the model finishing or answering.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::IterationCapReached { .. })
    }
}
