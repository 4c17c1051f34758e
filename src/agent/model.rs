use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::history::HistoryEntry;
use crate::error::ModelError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// A model reply: a function call, text, both, or (rarely) neither.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub function_call: Option<FunctionCall>,
    #[serde(default)]
    pub text: Option<String>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            function_call: None,
            text: Some(text.into()),
        }
    }

    pub fn call(name: impl Into<String>, args: Value) -> Self {
        Self {
            function_call: Some(FunctionCall {
                name: name.into(),
                args,
            }),
            text: None,
        }
    }
}

/// The language model as the agent loop sees it.
///
/// Implementations should stop work promptly once `cancel` fires; the loop
/// also races the call against the token.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call_model(
        &self,
        model_id: &str,
        history: &[HistoryEntry],
        cancel: CancellationToken,
    ) -> Result<ModelResponse, ModelError>;
}
