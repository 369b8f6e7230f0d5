use std::net::ToSocketAddrs;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Msg;
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg};
use shellgate_common::protocols::{LaunchParams, TerminalSize};
use shellgate_common::{SessionId, SshDriverConfig};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::*;

use crate::error::SshClientError;
use crate::handle::SshSessionHandle;

const STDIO_CHANNEL_CAPACITY: usize = 64;
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

pub(crate) struct ClientHandler {
    pub session_id: SessionId,
}

impl russh::client::Handler for ClientHandler {
    type Error = SshClientError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(session=%self.session_id, key_type=%server_public_key.algorithm().as_str(), "Host key received");
        Ok(true)
    }
}

#[derive(Debug)]
pub(crate) enum ChannelOp {
    Data(Bytes),
    Resize(TerminalSize),
    Close,
}

/// Dials the target, authenticates from the resolved secret map, opens a
/// PTY shell channel and returns a handle wired to it.
pub(crate) async fn connect_and_open(
    params: &LaunchParams,
    config: &SshDriverConfig,
) -> Result<SshSessionHandle, SshClientError> {
    let address_str = format!("{}:{}", params.host, params.port);
    let address = address_str
        .to_socket_addrs()?
        .next()
        .ok_or(SshClientError::Resolve)?;

    let secret = params.secret.expose_secret();
    let username = secret
        .get("username")
        .cloned()
        .unwrap_or_else(|| "root".to_owned());

    info!(session=%params.session_id, %address, username=%username, "Connecting");

    let handler = ClientHandler {
        session_id: params.session_id,
    };
    let ssh_config = Arc::new(russh::client::Config::default());
    let mut ssh = timeout(
        config.connect_timeout,
        russh::client::connect(ssh_config, address, handler),
    )
    .await
    .map_err(|_| SshClientError::Timeout)??;

    let mut authenticated = false;
    if let Some(key_data) = secret.get("private_key") {
        let passphrase = secret.get("private_key_passphrase").map(|s| s.as_str());
        let key = russh::keys::decode_secret_key(key_data, passphrase)?;
        authenticated = ssh
            .authenticate_publickey(username.clone(), PrivateKeyWithHashAlg::new(Arc::new(key), None))
            .await?
            .success();
        if authenticated {
            debug!(session=%params.session_id, "Authenticated with key");
        }
    }
    if !authenticated {
        if let Some(password) = secret.get("password") {
            authenticated = ssh
                .authenticate_password(username.clone(), password)
                .await?
                .success();
            if authenticated {
                debug!(session=%params.session_id, "Authenticated with password");
            }
        }
    }
    if !authenticated {
        let _ = ssh
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
        return Err(SshClientError::Authentication);
    }

    let mut channel = ssh.channel_open_session().await?;
    channel
        .request_pty(
            true,
            &config.terminal_type,
            params.terminal.cols,
            params.terminal.rows,
            0,
            0,
            &[],
        )
        .await?;
    channel.request_shell(true).await?;

    let (ops_tx, ops_rx) = unbounded_channel();
    let (stdout_tx, stdout_rx) = mpsc::channel(STDIO_CHANNEL_CAPACITY);
    let (stderr_tx, stderr_rx) = mpsc::channel(STDIO_CHANNEL_CAPACITY);

    tokio::spawn(run_channel(
        channel,
        ops_rx,
        stdout_tx,
        stderr_tx,
        params.session_id,
    ));

    info!(session=%params.session_id, %address, "Connected");
    Ok(SshSessionHandle::new(
        params.session_id,
        ops_tx,
        stdout_rx,
        stderr_rx,
        Arc::new(Mutex::new(ssh)),
    ))
}

/// Owns the shell channel: stdin writes and resizes arrive as ops, stdout
/// and stderr chunks leave on bounded channels in the order the target
/// produced them. Slow consumers apply SSH window backpressure instead
/// of dropping data.
async fn run_channel(
    mut channel: Channel<Msg>,
    mut ops_rx: UnboundedReceiver<ChannelOp>,
    stdout_tx: mpsc::Sender<Bytes>,
    stderr_tx: mpsc::Sender<Bytes>,
    session_id: SessionId,
) {
    if let Err(error) = async {
        loop {
            tokio::select! {
                op = ops_rx.recv() => {
                    match op {
                        Some(ChannelOp::Data(data)) => {
                            channel.data(&data[..]).await?;
                        }
                        Some(ChannelOp::Resize(size)) => {
                            channel.window_change(size.cols, size.rows, 0, 0).await?;
                        }
                        Some(ChannelOp::Close) | None => {
                            let _ = channel.eof().await;
                            break;
                        }
                    }
                }
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            let bytes: &[u8] = &data;
                            if stdout_tx.send(Bytes::copy_from_slice(bytes)).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            if ext == SSH_EXTENDED_DATA_STDERR {
                                let bytes: &[u8] = &data;
                                if stderr_tx.send(Bytes::copy_from_slice(bytes)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            debug!(session=%session_id, exit_status, "Remote exit status");
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            break;
                        }
                        Some(msg) => {
                            debug!(session=%session_id, ?msg, "Unhandled channel message");
                        }
                    }
                }
            }
        }
        Ok::<(), SshClientError>(())
    }
    .await
    {
        warn!(session=%session_id, %error, "Shell channel error");
    }
    debug!(session=%session_id, "Shell channel closed");
}
