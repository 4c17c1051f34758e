//! Gemini `generateContent` client.
//!
//! Two auth modes: an API key against the public endpoint, or a bearer token
//! against a Vertex AI project/location.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::{
    tool_declarations, FunctionCall, HistoryEntry, ModelClient, ModelResponse, SYSTEM_PROMPT,
};
use crate::error::ModelError;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_LOCATION: &str = "us-central1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    system_instruction: GeminiContent,
    tools: Vec<GeminiTool>,
    tool_config: ToolConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponse,
    },
    /// Part kinds we never act on (inline data, code execution, ...).
    Other(Value),
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    function_declarations: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolConfig {
    function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Serialize)]
struct FunctionCallingConfig {
    mode: &'static str,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
}

#[derive(Clone, PartialEq, Eq)]
pub enum GeminiAuth {
    /// Sent as `x-goog-api-key` to the public endpoint.
    ApiKey(String),
    /// Bearer token for a Vertex AI project.
    Vertex {
        project: String,
        location: String,
        access_token: String,
    },
}

impl fmt::Debug for GeminiAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Self::Vertex {
                project, location, ..
            } => f
                .debug_struct("Vertex")
                .field("project", project)
                .field("location", location)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiSettings {
    pub auth: GeminiAuth,
    /// Overrides the endpoint root, e.g. for a proxy or a test server.
    pub base_url: Option<String>,
}

impl GeminiSettings {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            auth: GeminiAuth::ApiKey(key.into()),
            base_url: None,
        }
    }

    /// Read settings from `GEMINI_API_KEY`, or from `GOOGLE_CLOUD_PROJECT`,
    /// `GOOGLE_CLOUD_LOCATION` and `GOOGLE_ACCESS_TOKEN` for Vertex AI.
    /// `GEMINI_BASE_URL` overrides the endpoint in both modes.
    pub fn from_env() -> Result<Self, ModelError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ModelError> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let base_url = var("GEMINI_BASE_URL");

        if let Some(key) = var("GEMINI_API_KEY") {
            return Ok(Self {
                auth: GeminiAuth::ApiKey(key),
                base_url,
            });
        }
        if let Some(project) = var("GOOGLE_CLOUD_PROJECT") {
            let access_token = var("GOOGLE_ACCESS_TOKEN").ok_or_else(|| {
                ModelError::Configuration(
                    "GOOGLE_CLOUD_PROJECT is set but GOOGLE_ACCESS_TOKEN is missing".to_string(),
                )
            })?;
            return Ok(Self {
                auth: GeminiAuth::Vertex {
                    project,
                    location: var("GOOGLE_CLOUD_LOCATION")
                        .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
                    access_token,
                },
                base_url,
            });
        }
        Err(ModelError::Configuration(
            "set GEMINI_API_KEY, or GOOGLE_CLOUD_PROJECT with GOOGLE_ACCESS_TOKEN".to_string(),
        ))
    }

    /// `(project, location)`; empty strings for API-key auth.
    fn cache_key(&self) -> (String, String) {
        match &self.auth {
            GeminiAuth::ApiKey(_) => (String::new(), String::new()),
            GeminiAuth::Vertex {
                project, location, ..
            } => (project.clone(), location.clone()),
        }
    }
}

pub struct GeminiClient {
    http: reqwest::Client,
    settings: GeminiSettings,
}

impl GeminiClient {
    pub fn new(settings: GeminiSettings) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_http(http, settings))
    }

    fn with_http(http: reqwest::Client, settings: GeminiSettings) -> Self {
        Self { http, settings }
    }

    fn endpoint(&self, model_id: &str) -> String {
        match &self.settings.auth {
            GeminiAuth::ApiKey(_) => {
                let base = self
                    .settings
                    .base_url
                    .as_deref()
                    .unwrap_or(DEFAULT_BASE_URL)
                    .trim_end_matches('/');
                format!("{base}/models/{model_id}:generateContent")
            }
            GeminiAuth::Vertex {
                project, location, ..
            } => {
                let base = match self.settings.base_url.as_deref() {
                    Some(base) => base.trim_end_matches('/').to_string(),
                    None => format!("https://{location}-aiplatform.googleapis.com/v1"),
                };
                format!(
                    "{base}/projects/{project}/locations/{location}/publishers/google/models/{model_id}:generateContent"
                )
            }
        }
    }

    async fn generate(
        &self,
        model_id: &str,
        history: &[HistoryEntry],
    ) -> Result<ModelResponse, ModelError> {
        let request = build_request(history);
        let builder = self.http.post(self.endpoint(model_id)).json(&request);
        let builder = match &self.settings.auth {
            GeminiAuth::ApiKey(key) => builder.header("x-goog-api-key", key),
            GeminiAuth::Vertex { access_token, .. } => builder.bearer_auth(access_token),
        };

        tracing::debug!(
            target = "agent_terminal::gemini",
            model = model_id,
            contents = request.contents.len(),
            "sending generateContent"
        );
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<GeminiError>(&body)
                .map(|error| error.error.message)
                .unwrap_or(body);
            tracing::warn!(
                target = "agent_terminal::gemini",
                status = %status,
                %message,
                "model API error"
            );
            return Err(ModelError::api(status.as_u16(), message));
        }

        let parsed: GeminiResponse = serde_json::from_str(&body)?;
        Ok(into_model_response(parsed))
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn call_model(
        &self,
        model_id: &str,
        history: &[HistoryEntry],
        cancel: CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ModelError::Cancelled),
            result = self.generate(model_id, history) => result,
        }
    }
}

fn build_request(history: &[HistoryEntry]) -> GeminiRequest {
    GeminiRequest {
        contents: history_to_contents(history),
        system_instruction: GeminiContent {
            role: None,
            parts: vec![GeminiPart::Text {
                text: SYSTEM_PROMPT.to_string(),
            }],
        },
        tools: vec![GeminiTool {
            function_declarations: tool_declarations(),
        }],
        tool_config: ToolConfig {
            function_calling_config: FunctionCallingConfig { mode: "AUTO" },
        },
    }
}

/// Consecutive entries of the same role share one content block.
fn history_to_contents(history: &[HistoryEntry]) -> Vec<GeminiContent> {
    let mut contents: Vec<GeminiContent> = Vec::new();
    for entry in history {
        let (role, part) = match entry {
            HistoryEntry::User { text } => ("user", GeminiPart::Text { text: text.clone() }),
            HistoryEntry::Model { text } => ("model", GeminiPart::Text { text: text.clone() }),
            HistoryEntry::ModelCall { name, args } => (
                "model",
                GeminiPart::FunctionCall {
                    function_call: FunctionCall {
                        name: name.clone(),
                        args: args.clone(),
                    },
                },
            ),
            HistoryEntry::ToolResult { name, response } => (
                "user",
                GeminiPart::FunctionResponse {
                    function_response: FunctionResponse {
                        name: name.clone(),
                        response: response.clone(),
                    },
                },
            ),
        };
        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.push(part),
            _ => contents.push(GeminiContent {
                role: Some(role.to_string()),
                parts: vec![part],
            }),
        }
    }
    contents
}

/// First function call wins; text parts are concatenated.
fn into_model_response(response: GeminiResponse) -> ModelResponse {
    let parts = response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| content.parts)
        .unwrap_or_default();

    let mut function_call = None;
    let mut text = String::new();
    for part in parts {
        match part {
            GeminiPart::FunctionCall { function_call: call } if function_call.is_none() => {
                function_call = Some(call);
            }
            GeminiPart::Text { text: chunk } => text.push_str(&chunk),
            _ => {}
        }
    }

    ModelResponse {
        function_call,
        text: (!text.is_empty()).then_some(text),
    }
}

/// Model clients keyed by `(project, location)`, created once at startup and
/// shared by everything that issues model calls.
pub struct ModelClientCache {
    http: reqwest::Client,
    defaults: GeminiSettings,
    clients: Mutex<HashMap<(String, String), Arc<GeminiClient>>>,
}

impl ModelClientCache {
    pub fn new(defaults: GeminiSettings) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            defaults,
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn default_client(&self) -> Arc<GeminiClient> {
        self.client_for(self.defaults.clone())
    }

    fn client_for(&self, settings: GeminiSettings) -> Arc<GeminiClient> {
        let key = settings.cache_key();
        let mut clients = self.clients.lock();
        Arc::clone(clients.entry(key).or_insert_with(|| {
            tracing::debug!(
                target = "agent_terminal::gemini",
                auth = ?settings.auth,
                "creating model client"
            );
            Arc::new(GeminiClient::with_http(self.http.clone(), settings))
        }))
    }
}

#[cfg(test)]
mod tests {
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;

    fn client_for(server: &MockServer) -> GeminiClient {
        GeminiClient::new(GeminiSettings {
            auth: GeminiAuth::ApiKey("test-key".to_string()),
            base_url: Some(server.base_url()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn function_call_response_is_mapped() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/models/gemini-2.5-flash:generateContent")
                .header("x-goog-api-key", "test-key")
                .body_contains("\"functionDeclarations\"")
                .body_contains("\"systemInstruction\"");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"run_command","args":{"command":"uptime","reasoning":"check load"}}}]}}]}"#);
        });

        let client = client_for(&server);
        let response = client
            .call_model(
                "gemini-2.5-flash",
                &[HistoryEntry::user("how loaded is this box?")],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        mock.assert_hits(1);
        let call = response.function_call.unwrap();
        assert_eq!(call.name, "run_command");
        assert_eq!(call.args["command"], "uptime");
        assert_eq!(response.text, None);
    }

    #[tokio::test]
    async fn text_parts_are_joined() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/models/m:generateContent");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello, "},{"text":"world."}]}}]}"#);
        });

        let response = client_for(&server)
            .call_model("m", &[HistoryEntry::user("hi")], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.text.as_deref(), Some("Hello, world."));
        assert!(response.function_call.is_none());
    }

    #[tokio::test]
    async fn empty_candidates_yield_empty_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/models/m:generateContent");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"candidates":[]}"#);
        });

        let response = client_for(&server)
            .call_model("m", &[HistoryEntry::user("hi")], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response, ModelResponse::default());
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_message() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/models/m:generateContent");
            then.status(429)
                .header("content-type", "application/json")
                .body(r#"{"error":{"code":429,"message":"Resource has been exhausted","status":"RESOURCE_EXHAUSTED"}}"#);
        });

        let error = client_for(&server)
            .call_model("m", &[HistoryEntry::user("hi")], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(error.is_rate_limited());
        assert!(error.to_string().contains("Resource has been exhausted"));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/models/m:generateContent");
            then.status(200).body(r#"{"candidates":[]}"#);
        });

        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = client_for(&server)
            .call_model("m", &[HistoryEntry::user("hi")], cancel)
            .await
            .unwrap_err();
        assert!(error.is_cancelled());
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn vertex_auth_uses_project_path_and_bearer() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/projects/proj-1/locations/europe-west4/publishers/google/models/m:generateContent")
                .header("authorization", "Bearer ya29.token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"candidates":[{"content":{"parts":[{"text":"ok"}]}}]}"#);
        });

        let client = GeminiClient::new(GeminiSettings {
            auth: GeminiAuth::Vertex {
                project: "proj-1".to_string(),
                location: "europe-west4".to_string(),
                access_token: "ya29.token".to_string(),
            },
            base_url: Some(server.base_url()),
        })
        .unwrap();
        let response = client
            .call_model("m", &[HistoryEntry::user("hi")], CancellationToken::new())
            .await
            .unwrap();
        mock.assert_hits(1);
        assert_eq!(response.text.as_deref(), Some("ok"));
    }

    #[test]
    fn history_maps_to_alternating_contents() {
        let history = vec![
            HistoryEntry::user("list files"),
            HistoryEntry::call("run_command", json!({"command": "ls"})),
            HistoryEntry::tool_result("run_command", json!({"output": "a b"})),
            HistoryEntry::user("[system] note"),
            HistoryEntry::model("Done."),
        ];
        let contents = serde_json::to_value(history_to_contents(&history)).unwrap();
        assert_eq!(
            contents,
            json!([
                {"role": "user", "parts": [{"text": "list files"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "run_command", "args": {"command": "ls"}}}]},
                {"role": "user", "parts": [
                    {"functionResponse": {"name": "run_command", "response": {"output": "a b"}}},
                    {"text": "[system] note"}
                ]},
                {"role": "model", "parts": [{"text": "Done."}]}
            ])
        );
    }

    #[test]
    fn unknown_parts_do_not_break_parsing() {
        let parsed: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"inlineData":{"mimeType":"image/png","data":""}},{"text":"hi"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(into_model_response(parsed).text.as_deref(), Some("hi"));
    }

    #[test]
    fn settings_from_env_prefers_api_key() {
        let vars: HashMap<&str, &str> = [
            ("GEMINI_API_KEY", "k"),
            ("GOOGLE_CLOUD_PROJECT", "p"),
            ("GOOGLE_ACCESS_TOKEN", "t"),
        ]
        .into_iter()
        .collect();
        let settings =
            GeminiSettings::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(settings.auth, GeminiAuth::ApiKey("k".to_string()));
    }

    #[test]
    fn settings_from_env_builds_vertex_with_default_location() {
        let vars: HashMap<&str, &str> = [("GOOGLE_CLOUD_PROJECT", "p"), ("GOOGLE_ACCESS_TOKEN", "t")]
            .into_iter()
            .collect();
        let settings =
            GeminiSettings::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(
            settings.auth,
            GeminiAuth::Vertex {
                project: "p".to_string(),
                location: DEFAULT_LOCATION.to_string(),
                access_token: "t".to_string(),
            }
        );
    }

    #[test]
    fn settings_from_env_requires_credentials() {
        let error = GeminiSettings::from_lookup(|_| None).unwrap_err();
        assert!(matches!(error, ModelError::Configuration(_)));
        let error = GeminiSettings::from_lookup(|name| {
            (name == "GOOGLE_CLOUD_PROJECT").then(|| "p".to_string())
        })
        .unwrap_err();
        assert!(error.to_string().contains("GOOGLE_ACCESS_TOKEN"));
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let rendered = format!("{:?}", GeminiSettings::api_key("secret-key"));
        assert!(!rendered.contains("secret-key"));
    }

    #[test]
    fn cache_hands_out_one_client_per_location() {
        let cache = ModelClientCache::new(GeminiSettings {
            auth: GeminiAuth::Vertex {
                project: "p".to_string(),
                location: "us-central1".to_string(),
                access_token: "t".to_string(),
            },
            base_url: None,
        })
        .unwrap();
        let a = cache.default_client();
        let b = cache.default_client();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.clients.lock().len(), 1);
        assert!(a.endpoint("m").starts_with("https://us-central1-aiplatform.googleapis.com/v1/projects/p/"));
    }
}
