//! Backend process adapters.
//!
//! Each backend runs as one tokio task that owns the underlying terminal
//! (local pty or remote shell channel). The session talks to it through a
//! command queue and listens on an event queue; there are no callbacks.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::BridgeError;
use crate::protocol::{BackendKind, ConnectionDescriptor, TermSize};
use crate::pty::PtySession;
use crate::remote;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const EVENT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Shell to run for local sessions instead of the login shell.
    pub shell: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            shell: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Lifecycle and output events. A backend emits any number of `Data` events
/// and ends with exactly one `Exit` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Authenticated,
    Ready,
    Data(Vec<u8>),
    Exit {
        code: Option<u32>,
        signal: Option<String>,
    },
    Error(String),
}

#[derive(Debug)]
pub(crate) enum BackendCommand {
    Write(Vec<u8>),
    Resize(TermSize),
    Close,
}

pub struct BackendHandle {
    kind: BackendKind,
    commands: mpsc::UnboundedSender<BackendCommand>,
    task: JoinHandle<()>,
}

impl BackendHandle {
    /// Start the backend that `descriptor` routes to, sized to `size`.
    pub fn start(
        descriptor: ConnectionDescriptor,
        size: TermSize,
        options: &BackendOptions,
    ) -> (Self, mpsc::Receiver<BackendEvent>) {
        let kind = descriptor.backend_kind();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        tracing::info!(
            target = "agent_terminal::backend",
            ?kind,
            cols = size.cols,
            rows = size.rows,
            host = %descriptor.host,
            "starting backend"
        );

        let task = match kind {
            BackendKind::Local => tokio::spawn(run_local(
                options.shell.clone(),
                size,
                command_rx,
                event_tx,
            )),
            BackendKind::Remote => tokio::spawn(remote::run_remote(
                descriptor,
                size,
                options.connect_timeout,
                command_rx,
                event_tx,
            )),
        };

        (
            Self {
                kind,
                commands: command_tx,
                task,
            },
            event_rx,
        )
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Queue input for the backend. Returns false once the backend is gone.
    pub fn write(&self, bytes: Vec<u8>) -> bool {
        self.commands.send(BackendCommand::Write(bytes)).is_ok()
    }

    pub fn resize(&self, size: TermSize) -> bool {
        self.commands.send(BackendCommand::Resize(size)).is_ok()
    }

    /// Tear the backend down and wait for its task to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(BackendCommand::Close);
        let mut task = self.task;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            tracing::warn!(
                target = "agent_terminal::backend",
                kind = ?self.kind,
                "backend did not stop in time; aborting task"
            );
            task.abort();
        }
    }
}

async fn run_local(
    shell: Option<String>,
    size: TermSize,
    mut commands: mpsc::UnboundedReceiver<BackendCommand>,
    events: mpsc::Sender<BackendEvent>,
) {
    let (pty, mut output) = match PtySession::spawn_shell(shell.as_deref(), size.cols, size.rows) {
        Ok(spawned) => spawned,
        Err(error) => {
            let error = BridgeError::Spawn(format!("{error:#}"));
            tracing::error!(target = "agent_terminal::backend", %error, "local spawn failed");
            let _ = events.send(BackendEvent::Error(error.to_string())).await;
            return;
        }
    };

    // No authentication step for a local shell.
    let _ = events.send(BackendEvent::Authenticated).await;
    let _ = events.send(BackendEvent::Ready).await;

    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(bytes) => {
                    if events.send(BackendEvent::Data(bytes)).await.is_err() {
                        let _ = pty.shutdown();
                        return;
                    }
                }
                None => {
                    let code = pty.wait_exit().await;
                    tracing::info!(target = "agent_terminal::backend", ?code, "local shell exited");
                    let _ = events.send(BackendEvent::Exit { code, signal: None }).await;
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(BackendCommand::Write(bytes)) => {
                    if let Err(error) = pty.write_all(&bytes) {
                        tracing::warn!(target = "agent_terminal::backend", error = %error, "pty write failed");
                    }
                }
                Some(BackendCommand::Resize(size)) => {
                    if let Err(error) = pty.resize(size.cols, size.rows) {
                        tracing::warn!(target = "agent_terminal::backend", error = %error, "pty resize failed");
                    }
                }
                Some(BackendCommand::Close) | None => {
                    let _ = pty.shutdown();
                    tracing::debug!(target = "agent_terminal::backend", pid = ?pty.pid(), "local shell killed");
                    let _ = events
                        .send(BackendEvent::Exit { code: None, signal: Some("SIGKILL".to_string()) })
                        .await;
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn local_options() -> BackendOptions {
        BackendOptions {
            shell: Some("/bin/sh".to_string()),
            ..BackendOptions::default()
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<BackendEvent>) -> BackendEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("backend event timed out")
            .expect("backend event channel closed")
    }

    #[test]
    fn local_adapter_future_can_be_spawned() {
        fn assert_send<T: Send>(_: &T) {}
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::channel(1);
        let task = run_local(None, TermSize::default(), command_rx, event_tx);
        assert_send(&task);
    }

    #[tokio::test]
    async fn local_backend_reports_lifecycle_then_output() {
        let (backend, mut events) = BackendHandle::start(
            ConnectionDescriptor::local(),
            TermSize::default(),
            &local_options(),
        );
        assert_eq!(backend.kind(), BackendKind::Local);
        assert_eq!(next_event(&mut events).await, BackendEvent::Authenticated);
        assert_eq!(next_event(&mut events).await, BackendEvent::Ready);

        assert!(backend.write(b"echo backend-$((2*21))\r".to_vec()));
        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains("backend-42") {
            match next_event(&mut events).await {
                BackendEvent::Data(bytes) => seen.extend(bytes),
                other => panic!("unexpected event {other:?}"),
            }
        }
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn local_backend_ends_with_exit_event() {
        let (backend, mut events) = BackendHandle::start(
            ConnectionDescriptor::local(),
            TermSize::default(),
            &local_options(),
        );
        backend.write(b"exit 7\r".to_vec());
        let exit = loop {
            match next_event(&mut events).await {
                BackendEvent::Exit { code, .. } => break code,
                BackendEvent::Error(message) => panic!("unexpected error {message}"),
                _ => {}
            }
        };
        assert_eq!(exit, Some(7));
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_error() {
        let options = BackendOptions {
            shell: Some("/nonexistent/shell".to_string()),
            ..BackendOptions::default()
        };
        let (backend, mut events) =
            BackendHandle::start(ConnectionDescriptor::local(), TermSize::default(), &options);
        match next_event(&mut events).await {
            BackendEvent::Error(message) => assert!(message.contains("failed to spawn")),
            other => panic!("expected spawn error, got {other:?}"),
        }
        backend.shutdown().await;
    }
}
