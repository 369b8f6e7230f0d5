use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::SftpProvider;
use crate::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for TerminalSize {
    fn default() -> Self {
        TerminalSize { cols: 80, rows: 24 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("session handle is closed")]
    Closed,
    #[error("I/O: {0}")]
    Io(String),
}

/// A live connection to a target, as produced by a driver's launcher.
///
/// The handle is shared between the terminal bridge (reads and writes),
/// the SFTP channel registry and snippet injection (stdin writer); all
/// consumers hold it behind an `Arc`. `close` is idempotent and makes
/// every subsequent read return `None` promptly.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    fn id(&self) -> SessionId;

    async fn write_stdin(&self, data: Bytes) -> Result<(), HandleError>;

    /// One-shot: the first caller takes the stdout stream; later calls
    /// return `None`.
    async fn take_stdout(&self) -> Option<mpsc::Receiver<Bytes>>;

    /// One-shot, same contract as `take_stdout`.
    async fn take_stderr(&self) -> Option<mpsc::Receiver<Bytes>>;

    async fn resize(&self, size: TerminalSize) -> Result<(), HandleError>;

    async fn close(&self);

    /// Present when the target connection can multiplex SFTP.
    fn sftp_provider(&self) -> Option<Arc<dyn SftpProvider>>;
}
