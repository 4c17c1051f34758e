//! WebSocket front end: one socket is one terminal session with one agent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::{Agent, AgentConfig, ModelClient, StepEvent};
use crate::bridge::SessionBridge;
use crate::protocol::{BridgeToClient, ClientToBridge};

const OUTBOUND_CAPACITY: usize = 512;
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ServerState {
    bridge: Arc<SessionBridge>,
    model: Option<Arc<dyn ModelClient>>,
    agent: AgentConfig,
}

impl ServerState {
    /// `model` may be absent; sessions then work without agent support.
    pub fn new(
        bridge: Arc<SessionBridge>,
        model: Option<Arc<dyn ModelClient>>,
        agent: AgentConfig,
    ) -> Self {
        Self {
            bridge,
            model,
            agent,
        }
    }
}

pub fn router(state: ServerState) -> axum::Router {
    use axum::{routing, Router};

    Router::new()
        .route("/health", routing::get(health))
        .route("/ws", routing::get(ws_upgrade))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: ServerState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(target = "agent_terminal::server", %addr, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!(target = "agent_terminal::server", "shutting down");
        })
        .await
        .context("server error")
}

async fn health(axum::extract::State(state): axum::extract::State<ServerState>) -> axum::Json<Value> {
    axum::Json(json!({
        "status": "ok",
        "service": "agent-terminal",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.bridge.session_count(),
        "agentEnabled": state.model.is_some(),
    }))
}

async fn ws_upgrade(
    ws: axum::extract::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<ServerState>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let mut connection = Connection::open(state, outbound_tx);
    tracing::info!(target = "agent_terminal::server", session = %connection.id, "client connected");

    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientToBridge>(text.as_str()) {
                            Ok(message) => connection.handle(message),
                            Err(error) => {
                                connection.reply(BridgeToClient::error(format!("invalid message: {error}")));
                            }
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        connection.handle_binary(bytes.to_vec());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::debug!(target = "agent_terminal::server", %error, "socket read failed");
                        break;
                    }
                }
            }
            Some(message) = outbound_rx.recv() => {
                let Ok(text) = serde_json::to_string(&message) else {
                    continue;
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    connection.close().await;
}

/// Per-socket state. Slow operations run on spawned tasks so the socket
/// loop keeps draining the outbound queue.
struct Connection {
    id: String,
    state: ServerState,
    outbound: mpsc::Sender<BridgeToClient>,
    agent: Option<Arc<Agent>>,
    run: Option<JoinHandle<()>>,
}

impl Connection {
    fn open(state: ServerState, outbound: mpsc::Sender<BridgeToClient>) -> Self {
        let id = Uuid::new_v4().to_string();
        state.bridge.open_session(id.clone(), outbound.clone());
        Self {
            id,
            state,
            outbound,
            agent: None,
            run: None,
        }
    }

    fn handle(&mut self, message: ClientToBridge) {
        match message {
            ClientToBridge::Connect(descriptor) => {
                let bridge = Arc::clone(&self.state.bridge);
                let id = self.id.clone();
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    if let Err(error) = bridge.connect(&id, descriptor).await {
                        let _ = outbound.send(BridgeToClient::error(error.to_string())).await;
                    }
                });
            }
            ClientToBridge::Data { data } => {
                self.state.bridge.send_data(&self.id, data.into_bytes());
            }
            ClientToBridge::Resize(size) => self.state.bridge.resize(&self.id, size),
            ClientToBridge::Disconnect => {
                if let Some(agent) = self.agent.as_ref() {
                    agent.stop();
                }
                let bridge = Arc::clone(&self.state.bridge);
                let id = self.id.clone();
                tokio::spawn(async move { bridge.disconnect(&id).await });
            }
            ClientToBridge::AgentStart { prompt, model } => self.start_agent(Some(prompt), model),
            ClientToBridge::AgentRetry => self.start_agent(None, None),
            ClientToBridge::AgentPause => {
                if let Some(agent) = self.agent.as_ref() {
                    agent.pause();
                }
            }
            ClientToBridge::AgentResume => {
                if let Some(agent) = self.agent.as_ref() {
                    agent.resume();
                }
            }
            ClientToBridge::AgentStop => {
                if let Some(agent) = self.agent.as_ref() {
                    agent.stop();
                }
            }
        }
    }

    fn handle_binary(&self, bytes: Vec<u8>) {
        self.state.bridge.send_data(&self.id, bytes);
    }

    fn reply(&self, message: BridgeToClient) {
        if self.outbound.try_send(message).is_err() {
            tracing::warn!(target = "agent_terminal::server", session = %self.id, "outbound queue full; reply dropped");
        }
    }

    fn run_in_progress(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.is_finished())
    }

    /// `prompt: None` retries the last prompt.
    fn start_agent(&mut self, prompt: Option<String>, model: Option<String>) {
        if self.run_in_progress() {
            self.reply(BridgeToClient::error("agent is already running"));
            return;
        }
        let Some(client) = self.state.model.clone() else {
            self.reply(BridgeToClient::error("no model credentials configured"));
            return;
        };

        let model = match (model, self.agent.as_ref()) {
            (Some(model), _) => model,
            // A retry repeats the last run on the model it used.
            (None, Some(agent)) if prompt.is_none() => agent.config().model.clone(),
            (None, _) => self.state.agent.model.clone(),
        };
        let agent = match self.agent.take() {
            Some(agent) if agent.config().model == model => agent,
            previous => {
                let config = AgentConfig {
                    model,
                    ..self.state.agent.clone()
                };
                let agent = Agent::new(
                    client,
                    Arc::new(self.state.bridge.handle(self.id.clone())),
                    config,
                );
                // Switching models keeps the conversation.
                if let Some(previous) = previous {
                    agent.continue_from(&previous);
                }
                Arc::new(agent)
            }
        };
        self.agent = Some(Arc::clone(&agent));
        self.run = Some(tokio::spawn(drive_run(agent, prompt, self.outbound.clone())));
    }

    async fn close(mut self) {
        if let Some(agent) = self.agent.take() {
            agent.stop();
        }
        if let Some(run) = self.run.take() {
            run.abort();
        }
        self.state.bridge.close_session(&self.id).await;
        tracing::info!(target = "agent_terminal::server", session = %self.id, "client disconnected");
    }
}

/// Run the agent and forward its steps and final outcome to the client.
async fn drive_run(agent: Arc<Agent>, prompt: Option<String>, outbound: mpsc::Sender<BridgeToClient>) {
    let mut steps = agent.subscribe();
    let run = {
        let agent = Arc::clone(&agent);
        async move {
            match prompt {
                Some(prompt) => Some(agent.start(prompt).await),
                None => agent.retry_last().await,
            }
        }
    };
    tokio::pin!(run);

    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            step = steps.recv() => match step {
                Ok(event) => forward_step(&outbound, event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(target = "agent_terminal::server", skipped, "step stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
        }
    };
    while let Ok(event) = steps.try_recv() {
        forward_step(&outbound, event).await;
    }

    let message = match outcome {
        Some(outcome) => BridgeToClient::AgentFinished { outcome },
        None => BridgeToClient::error("nothing to retry"),
    };
    let _ = outbound.send(message).await;
}

async fn forward_step(outbound: &mpsc::Sender<BridgeToClient>, event: StepEvent) {
    let _ = outbound
        .send(BridgeToClient::AgentStep {
            index: event.index,
            step: event.step,
        })
        .await;
}
