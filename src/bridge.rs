//! Session bridge: one backend per client session.
//!
//! Each session owns at most one backend and one capture slot. Backend
//! events are drained by a per-session pump task that forwards output to the
//! client first and to the capture engine second, preserving backend order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::agent::AgentTerminal;
use crate::backend::{BackendEvent, BackendHandle, BackendOptions};
use crate::capture::{
    new_marker, wrap_command, CaptureEngine, CaptureMode, CaptureOutcome, DEFAULT_COMMAND_TIMEOUT,
    DEFAULT_SAMPLE_WINDOW,
};
use crate::error::BridgeError;
use crate::helpers::Utf8Decoder;
use crate::keys::translate_keys;
use crate::protocol::{BridgeToClient, ConnectionDescriptor, SessionStatus, TermSize};

const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub backend: BackendOptions,
    /// Deadline for a sentinel capture.
    pub command_timeout: Duration,
    /// Quiescence window for a sample capture.
    pub sample_window: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend: BackendOptions::default(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            sample_window: DEFAULT_SAMPLE_WINDOW,
        }
    }
}

struct SessionShared {
    id: String,
    status: Mutex<SessionStatus>,
    capture: CaptureEngine,
    outbound: mpsc::Sender<BridgeToClient>,
}

impl SessionShared {
    fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    async fn emit(&self, message: BridgeToClient) {
        // The client may already be gone; that is not our problem here.
        let _ = self.outbound.send(message).await;
    }

    /// Move status forward and tell the client. Backward moves are ignored.
    async fn advance(&self, next: SessionStatus, message: Option<String>) -> bool {
        let changed = {
            let mut status = self.status.lock();
            if status.can_advance_to(next) {
                *status = next;
                true
            } else {
                false
            }
        };
        if changed {
            tracing::debug!(
                target = "agent_terminal::bridge",
                session = %self.id,
                status = ?next,
                "session status changed"
            );
            self.emit(BridgeToClient::Status {
                status: next,
                message,
            })
            .await;
        }
        changed
    }
}

struct SessionEntry {
    shared: Arc<SessionShared>,
    pending_size: TermSize,
    backend: Option<BackendHandle>,
    pump: Option<JoinHandle<()>>,
}

/// Multiplexes client sessions onto local or remote shells.
pub struct SessionBridge {
    config: BridgeConfig,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Register a client session. Messages for the client go to `outbound`.
    pub fn open_session(&self, id: impl Into<String>, outbound: mpsc::Sender<BridgeToClient>) {
        let id = id.into();
        let entry = SessionEntry {
            shared: Arc::new(SessionShared {
                id: id.clone(),
                status: Mutex::new(SessionStatus::Idle),
                capture: CaptureEngine::new(),
                outbound,
            }),
            pending_size: TermSize::default(),
            backend: None,
            pump: None,
        };
        if self.sessions.lock().insert(id.clone(), entry).is_some() {
            tracing::warn!(target = "agent_terminal::bridge", session = %id, "session id reused");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        self.sessions.lock().get(id).map(|entry| entry.shared.status())
    }

    pub fn pending_size(&self, id: &str) -> Option<TermSize> {
        self.sessions.lock().get(id).map(|entry| entry.pending_size)
    }

    /// Attach a backend chosen by `descriptor`, replacing any current one.
    pub async fn connect(&self, id: &str, descriptor: ConnectionDescriptor) -> Result<(), BridgeError> {
        if !self.sessions.lock().contains_key(id) {
            return Err(BridgeError::UnknownSession(id.to_string()));
        }
        self.teardown(id).await;

        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| BridgeError::UnknownSession(id.to_string()))?;

        // Spawn with the pending size under the lock so no resize slips
        // between reading it and attaching the backend.
        *entry.shared.status.lock() = SessionStatus::Connecting;
        let (backend, events) =
            BackendHandle::start(descriptor, entry.pending_size, &self.config.backend);
        tracing::info!(
            target = "agent_terminal::bridge",
            session = %id,
            kind = ?backend.kind(),
            "session connecting"
        );
        entry.pump = Some(tokio::spawn(pump_events(Arc::clone(&entry.shared), events)));
        entry.backend = Some(backend);
        Ok(())
    }

    /// Forward client input. Dropped silently unless the shell is ready.
    pub fn send_data(&self, id: &str, bytes: Vec<u8>) {
        let sessions = self.sessions.lock();
        let Some(entry) = sessions.get(id) else {
            return;
        };
        if entry.shared.status() != SessionStatus::Ready {
            return;
        }
        if let Some(backend) = entry.backend.as_ref() {
            backend.write(bytes);
        }
    }

    /// Resize the terminal, or remember the size for the next spawn.
    pub fn resize(&self, id: &str, size: TermSize) {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(id) else {
            return;
        };
        entry.pending_size = size;
        if entry.shared.status().is_terminal() {
            return;
        }
        if let Some(backend) = entry.backend.as_ref() {
            backend.resize(size);
        }
    }

    /// Tear the backend down. Safe to call any number of times.
    pub async fn disconnect(&self, id: &str) {
        // Claim the final status first so the backend's own exit event
        // doesn't produce a second transition.
        let changed = {
            let sessions = self.sessions.lock();
            let Some(entry) = sessions.get(id) else {
                return;
            };
            let mut status = entry.shared.status.lock();
            let changed = status.can_advance_to(SessionStatus::Disconnected);
            if changed {
                *status = SessionStatus::Disconnected;
            }
            changed
        };

        let Some(shared) = self.teardown(id).await else {
            return;
        };
        if changed {
            tracing::info!(target = "agent_terminal::bridge", session = %id, "session disconnected");
            shared
                .emit(BridgeToClient::status(SessionStatus::Disconnected))
                .await;
        }
    }

    /// Client departure: disconnect and forget the session.
    pub async fn close_session(&self, id: &str) {
        self.disconnect(id).await;
        if self.sessions.lock().remove(id).is_some() {
            tracing::info!(target = "agent_terminal::bridge", session = %id, "session closed");
        }
    }

    /// Run a command and wait for it to finish, time out, or be aborted.
    pub async fn run_command(&self, id: &str, command: &str) -> Result<CaptureOutcome, BridgeError> {
        let marker = new_marker();
        let line = wrap_command(command, &marker);
        let outcome = self.capture(id, CaptureMode::Sentinel { marker }, self.config.command_timeout, line)?;
        outcome
            .await
            .map_err(|_| BridgeError::NotConnected(id.to_string()))
    }

    /// Send keystrokes and sample output for the quiescence window.
    pub async fn send_keys(&self, id: &str, keys: &str) -> Result<CaptureOutcome, BridgeError> {
        let input = translate_keys(keys);
        let outcome = self.capture(id, CaptureMode::Sample, self.config.sample_window, input)?;
        outcome
            .await
            .map_err(|_| BridgeError::NotConnected(id.to_string()))
    }

    /// Resolve the session's pending capture early. Returns whether one was pending.
    pub fn abort_capture(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .get(id)
            .is_some_and(|entry| entry.shared.capture.abort())
    }

    pub fn handle(self: &Arc<Self>, id: impl Into<String>) -> SessionHandle {
        SessionHandle {
            bridge: Arc::clone(self),
            id: id.into(),
        }
    }

    fn capture(
        &self,
        id: &str,
        mode: CaptureMode,
        deadline: Duration,
        input: String,
    ) -> Result<tokio::sync::oneshot::Receiver<CaptureOutcome>, BridgeError> {
        let sessions = self.sessions.lock();
        let entry = sessions
            .get(id)
            .ok_or_else(|| BridgeError::UnknownSession(id.to_string()))?;
        let backend = entry
            .backend
            .as_ref()
            .filter(|_| entry.shared.status() == SessionStatus::Ready)
            .ok_or_else(|| BridgeError::NotConnected(id.to_string()))?;

        // Arm the capture before writing so no output is missed.
        let outcome = entry.shared.capture.begin(mode, deadline);
        if !backend.write(input.into_bytes()) {
            entry.shared.capture.abort();
            return Err(BridgeError::NotConnected(id.to_string()));
        }
        Ok(outcome)
    }

    /// Detach and stop the backend, then wait for its pump to drain.
    /// Returns the session's shared state if the session exists.
    async fn teardown(&self, id: &str) -> Option<Arc<SessionShared>> {
        let (shared, backend, pump) = {
            let mut sessions = self.sessions.lock();
            let entry = sessions.get_mut(id)?;
            (
                Arc::clone(&entry.shared),
                entry.backend.take(),
                entry.pump.take(),
            )
        };

        shared.capture.abort();
        if let Some(backend) = backend {
            tracing::info!(
                target = "agent_terminal::bridge",
                session = %id,
                kind = ?backend.kind(),
                "tearing down backend"
            );
            backend.shutdown().await;
        }
        if let Some(mut pump) = pump {
            if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut pump).await.is_err() {
                pump.abort();
            }
        }
        Some(shared)
    }
}

async fn pump_events(shared: Arc<SessionShared>, mut events: mpsc::Receiver<BackendEvent>) {
    shared
        .emit(BridgeToClient::status(SessionStatus::Connecting))
        .await;
    let mut decoder = Utf8Decoder::default();

    while let Some(event) = events.recv().await {
        match event {
            BackendEvent::Authenticated => {
                shared.advance(SessionStatus::Authenticated, None).await;
            }
            BackendEvent::Ready => {
                shared.advance(SessionStatus::Ready, None).await;
            }
            BackendEvent::Data(bytes) => {
                let text = decoder.decode(&bytes);
                if !text.is_empty() {
                    shared.emit(BridgeToClient::Output { data: text }).await;
                }
                shared.capture.feed(&bytes);
            }
            BackendEvent::Exit { code, signal } => {
                let message = match (code, signal) {
                    (_, Some(signal)) => format!("shell terminated by {signal}"),
                    (Some(code), None) => format!("shell exited with code {code}"),
                    (None, None) => "shell exited".to_string(),
                };
                shared.capture.abort();
                shared
                    .advance(SessionStatus::Disconnected, Some(message))
                    .await;
            }
            BackendEvent::Error(message) => {
                tracing::warn!(
                    target = "agent_terminal::bridge",
                    session = %shared.id,
                    %message,
                    "session failed"
                );
                shared.capture.abort();
                shared
                    .advance(SessionStatus::Error, Some(message.clone()))
                    .await;
                shared.emit(BridgeToClient::error(message)).await;
            }
        }
    }
}

/// A session as seen by an agent.
#[derive(Clone)]
pub struct SessionHandle {
    bridge: Arc<SessionBridge>,
    id: String,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl AgentTerminal for SessionHandle {
    async fn run_command(&self, command: &str) -> Result<CaptureOutcome, BridgeError> {
        self.bridge.run_command(&self.id, command).await
    }

    async fn send_keys(&self, keys: &str) -> Result<CaptureOutcome, BridgeError> {
        self.bridge.send_keys(&self.id, keys).await
    }

    fn abort_capture(&self) -> bool {
        self.bridge.abort_capture(&self.id)
    }
}
