use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Handle;
use shellgate_common::protocols::{
    HandleError, SessionHandle, SftpProvider, TerminalSize,
};
use shellgate_common::SessionId;
use tokio::sync::mpsc::{Receiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::*;

use crate::client::{ChannelOp, ClientHandler};
use crate::sftp::SshSftpProvider;

/// Live SSH session. Shared between the terminal bridge, snippet
/// injection and the SFTP registry; `close` is idempotent and ends all
/// reads promptly.
pub struct SshSessionHandle {
    id: SessionId,
    ops_tx: UnboundedSender<ChannelOp>,
    stdout: Mutex<Option<Receiver<Bytes>>>,
    stderr: Mutex<Option<Receiver<Bytes>>>,
    ssh: Arc<Mutex<Handle<ClientHandler>>>,
    sftp: Arc<SshSftpProvider>,
    closed: AtomicBool,
}

impl SshSessionHandle {
    pub(crate) fn new(
        id: SessionId,
        ops_tx: UnboundedSender<ChannelOp>,
        stdout: Receiver<Bytes>,
        stderr: Receiver<Bytes>,
        ssh: Arc<Mutex<Handle<ClientHandler>>>,
    ) -> Self {
        SshSessionHandle {
            id,
            ops_tx,
            stdout: Mutex::new(Some(stdout)),
            stderr: Mutex::new(Some(stderr)),
            sftp: Arc::new(SshSftpProvider::new(ssh.clone())),
            ssh,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SessionHandle for SshSessionHandle {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn write_stdin(&self, data: Bytes) -> Result<(), HandleError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(HandleError::Closed);
        }
        self.ops_tx
            .send(ChannelOp::Data(data))
            .map_err(|_| HandleError::Closed)
    }

    async fn take_stdout(&self) -> Option<Receiver<Bytes>> {
        self.stdout.lock().await.take()
    }

    async fn take_stderr(&self) -> Option<Receiver<Bytes>> {
        self.stderr.lock().await.take()
    }

    async fn resize(&self, size: TerminalSize) -> Result<(), HandleError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(HandleError::Closed);
        }
        self.ops_tx
            .send(ChannelOp::Resize(size))
            .map_err(|_| HandleError::Closed)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.ops_tx.send(ChannelOp::Close);
        let mut ssh = self.ssh.lock().await;
        if let Err(error) = ssh
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
        {
            debug!(session=%self.id, %error, "Disconnect error");
        }
        debug!(session=%self.id, "SSH session closed");
    }

    fn sftp_provider(&self) -> Option<Arc<dyn SftpProvider>> {
        Some(self.sftp.clone())
    }
}
