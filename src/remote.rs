//! Remote shell backend over SSH.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use tokio::sync::mpsc;

use crate::backend::{BackendCommand, BackendEvent};
use crate::error::BridgeError;
use crate::protocol::{ConnectionDescriptor, TermSize};

const TERM: &str = "xterm-256color";
const MAX_INTERACTIVE_ROUNDS: usize = 5;

struct ClientHandler {
    host: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are not pinned; credential handling is pass-through.
        tracing::debug!(
            target = "agent_terminal::remote",
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "accepting server host key"
        );
        Ok(true)
    }
}

fn connect_error(error: russh::Error) -> BridgeError {
    BridgeError::TransportConnect(error.to_string())
}

/// Parse a private key supplied as text.
pub fn load_private_key(text: &str, passphrase: Option<&str>) -> Result<key::KeyPair, BridgeError> {
    russh_keys::decode_secret_key(text, passphrase)
        .map_err(|error| BridgeError::TransportAuth(format!("invalid private key: {error}")))
}

/// Answer every keyboard-interactive prompt with the password.
async fn keyboard_interactive(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    password: &str,
) -> Result<bool, BridgeError> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(username, None::<String>)
        .await
        .map_err(connect_error)?;
    for _ in 0..MAX_INTERACTIVE_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure => return Ok(false),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                let answers = prompts.iter().map(|_| password.to_string()).collect();
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(connect_error)?;
            }
        }
    }
    Ok(false)
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    descriptor: &ConnectionDescriptor,
) -> Result<(), BridgeError> {
    let username = descriptor.username.as_str();

    if let Some(key_text) = descriptor.private_key.as_deref() {
        let key_pair = load_private_key(key_text, descriptor.passphrase.as_deref())?;
        if handle
            .authenticate_publickey(username, Arc::new(key_pair))
            .await
            .map_err(connect_error)?
        {
            return Ok(());
        }
    }

    if let Some(password) = descriptor.password.as_deref() {
        if handle
            .authenticate_password(username, password)
            .await
            .map_err(connect_error)?
        {
            return Ok(());
        }
        if keyboard_interactive(handle, username, password).await? {
            return Ok(());
        }
    }

    Err(BridgeError::TransportAuth(format!(
        "server rejected credentials for {username}@{}",
        descriptor.host
    )))
}

async fn open_transport(
    descriptor: &ConnectionDescriptor,
    connect_timeout: Duration,
) -> Result<Handle<ClientHandler>, BridgeError> {
    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        ..client::Config::default()
    });
    let handler = ClientHandler {
        host: descriptor.host.clone(),
    };
    let address = (descriptor.host.as_str(), descriptor.port);

    let connect = async {
        let mut handle = client::connect(config, address, handler)
            .await
            .map_err(connect_error)?;
        authenticate(&mut handle, descriptor).await?;
        Ok::<_, BridgeError>(handle)
    };

    tokio::time::timeout(connect_timeout, connect)
        .await
        .map_err(|_| {
            BridgeError::TransportConnect(format!(
                "timed out after {}s connecting to {}:{}",
                connect_timeout.as_secs(),
                descriptor.host,
                descriptor.port
            ))
        })?
}

pub(crate) async fn run_remote(
    descriptor: ConnectionDescriptor,
    size: TermSize,
    connect_timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<BackendCommand>,
    events: mpsc::Sender<BackendEvent>,
) {
    let handle = match open_transport(&descriptor, connect_timeout).await {
        Ok(handle) => handle,
        Err(error) => {
            tracing::warn!(
                target = "agent_terminal::remote",
                host = %descriptor.host,
                %error,
                "remote connect failed"
            );
            let _ = events.send(BackendEvent::Error(error.to_string())).await;
            return;
        }
    };
    let _ = events.send(BackendEvent::Authenticated).await;

    let shell = async {
        let channel = handle.channel_open_session().await?;
        channel
            .request_pty(false, TERM, u32::from(size.cols), u32::from(size.rows), 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        Ok::<_, russh::Error>(channel)
    };
    let mut channel = match shell.await {
        Ok(channel) => channel,
        Err(error) => {
            let error = connect_error(error);
            let _ = events.send(BackendEvent::Error(error.to_string())).await;
            end_transport(&handle).await;
            return;
        }
    };
    let _ = events.send(BackendEvent::Ready).await;
    tracing::info!(
        target = "agent_terminal::remote",
        host = %descriptor.host,
        user = %descriptor.username,
        "remote shell ready"
    );

    let mut exit_code = None;
    let mut exit_signal = None;
    loop {
        tokio::select! {
            message = channel.wait() => match message {
                // stdout and stderr share one stream: the consumer is a terminal.
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if events.send(BackendEvent::Data(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    exit_signal = Some(format!("{signal_name:?}"));
                }
                Some(ChannelMsg::Close) | None => {
                    let _ = events
                        .send(BackendEvent::Exit { code: exit_code, signal: exit_signal.take() })
                        .await;
                    end_transport(&handle).await;
                    return;
                }
                Some(_) => {}
            },
            command = commands.recv() => match command {
                Some(BackendCommand::Write(bytes)) => {
                    if let Err(error) = channel.data(&bytes[..]).await {
                        tracing::warn!(target = "agent_terminal::remote", %error, "remote write failed");
                    }
                }
                Some(BackendCommand::Resize(size)) => {
                    if let Err(error) = channel
                        .window_change(u32::from(size.cols), u32::from(size.rows), 0, 0)
                        .await
                    {
                        tracing::warn!(target = "agent_terminal::remote", %error, "remote resize failed");
                    }
                }
                Some(BackendCommand::Close) | None => break,
            },
        }
    }

    // Shell stream first, transport second, so the channel's close never
    // races a half-closed connection.
    let _ = channel.eof().await;
    let _ = channel.close().await;
    end_transport(&handle).await;
    let _ = events
        .send(BackendEvent::Exit {
            code: exit_code,
            signal: exit_signal,
        })
        .await;
}

async fn end_transport(handle: &Handle<ClientHandler>) {
    if let Err(error) = handle
        .disconnect(Disconnect::ByApplication, "session closed", "en")
        .await
    {
        tracing::debug!(target = "agent_terminal::remote", %error, "transport already closed");
    }
}
