use serde::{Deserialize, Serialize};

use crate::agent::{RunOutcome, StepRecord};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Hosts that are served by a local pseudo-terminal instead of SSH.
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]"];

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Where a session should connect and how to authenticate.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// PEM/OpenSSH private key text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub is_local: bool,
}

impl ConnectionDescriptor {
    pub fn local() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_SSH_PORT,
            username: String::new(),
            password: None,
            private_key: None,
            passphrase: None,
            is_local: true,
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        let host = self.host.trim().to_ascii_lowercase();
        if self.is_local || LOOPBACK_HOSTS.contains(&host.as_str()) {
            BackendKind::Local
        } else {
            BackendKind::Remote
        }
    }
}

// Credentials stay out of logs.
impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("is_local", &self.is_local)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Authenticated,
    Ready,
    Error,
    Disconnected,
}

impl SessionStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::Authenticated => 2,
            Self::Ready => 3,
            Self::Error | Self::Disconnected => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Disconnected)
    }

    /// Status only moves forward; `Error` and `Disconnected` are final.
    pub fn can_advance_to(self, next: SessionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Messages a client sends over its session socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientToBridge {
    Connect(ConnectionDescriptor),
    Data {
        data: String,
    },
    Resize(TermSize),
    Disconnect,
    AgentStart {
        prompt: String,
        #[serde(default)]
        model: Option<String>,
    },
    AgentPause,
    AgentResume,
    AgentStop,
    AgentRetry,
}

/// Messages the bridge sends back to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BridgeToClient {
    Status {
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Output {
        data: String,
    },
    Error {
        message: String,
    },
    AgentStep {
        index: usize,
        step: StepRecord,
    },
    AgentFinished {
        outcome: RunOutcome,
    },
}

impl BridgeToClient {
    pub fn status(status: SessionStatus) -> Self {
        Self::Status {
            status,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
