use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use russh::client::Handle;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use shellgate_common::protocols::{SftpClient, SftpEntry, SftpError, SftpProvider};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::*;

use crate::client::ClientHandler;

/// Opens SFTP subsystem channels over the session's SSH connection.
pub struct SshSftpProvider {
    ssh: Arc<Mutex<Handle<ClientHandler>>>,
}

impl SshSftpProvider {
    pub(crate) fn new(ssh: Arc<Mutex<Handle<ClientHandler>>>) -> Self {
        SshSftpProvider { ssh }
    }
}

#[async_trait]
impl SftpProvider for SshSftpProvider {
    async fn open(&self) -> Result<Arc<dyn SftpClient>, SftpError> {
        let mut channel = {
            let ssh = self.ssh.lock().await;
            ssh.channel_open_session()
                .await
                .map_err(|e| SftpError::Other(e.to_string()))?
        };
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SftpError::Other(e.to_string()))?;
        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::Other(e.to_string()))?;
        debug!("SFTP subsystem channel opened");
        Ok(Arc::new(RusshSftpClient { session }))
    }
}

struct RusshSftpClient {
    session: SftpSession,
}

fn map_err(path: &str, error: russh_sftp::client::error::Error) -> SftpError {
    use russh_sftp::client::error::Error;
    match error {
        Error::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => SftpError::NotFound(path.to_owned()),
            StatusCode::PermissionDenied => SftpError::PermissionDenied(path.to_owned()),
            _ => SftpError::Other(status.error_message),
        },
        other => SftpError::Other(other.to_string()),
    }
}

fn entry_from_attrs(
    name: String,
    path: String,
    attrs: &russh_sftp::protocol::FileAttributes,
) -> SftpEntry {
    SftpEntry {
        name,
        path,
        size: attrs.size.unwrap_or(0),
        is_dir: attrs.is_dir(),
        modified: attrs
            .mtime
            .and_then(|t| DateTime::from_timestamp(t as i64, 0)),
        permissions: attrs.permissions,
    }
}

#[async_trait]
impl SftpClient for RusshSftpClient {
    async fn read_dir(&self, path: &str) -> Result<Vec<SftpEntry>, SftpError> {
        let dir = self
            .session
            .read_dir(path)
            .await
            .map_err(|e| map_err(path, e))?;
        let base = path.trim_end_matches('/');
        Ok(dir
            .map(|entry| {
                let name = entry.file_name();
                let full = format!("{base}/{name}");
                entry_from_attrs(name, full, &entry.metadata())
            })
            .collect())
    }

    async fn metadata(&self, path: &str) -> Result<SftpEntry, SftpError> {
        let attrs = self
            .session
            .metadata(path)
            .await
            .map_err(|e| map_err(path, e))?;
        let name = path
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or(path)
            .to_owned();
        Ok(entry_from_attrs(name, path.to_owned(), &attrs))
    }

    async fn read(&self, path: &str, offset: u64, limit: u64) -> Result<Bytes, SftpError> {
        let mut file = self
            .session
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(|e| map_err(path, e))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| SftpError::Other(e.to_string()))?;
        let mut buf = Vec::with_capacity(limit.min(1024 * 1024) as usize);
        let mut reader = file.take(limit);
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| SftpError::Other(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    async fn write(&self, path: &str, offset: u64, data: Bytes) -> Result<u64, SftpError> {
        let flags = if offset == 0 {
            OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE
        } else {
            OpenFlags::WRITE
        };
        let mut file = self
            .session
            .open_with_flags(path, flags)
            .await
            .map_err(|e| map_err(path, e))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| SftpError::Other(e.to_string()))?;
        file.write_all(&data)
            .await
            .map_err(|e| SftpError::Other(e.to_string()))?;
        file.shutdown()
            .await
            .map_err(|e| SftpError::Other(e.to_string()))?;
        Ok(offset + data.len() as u64)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.session
            .rename(from, to)
            .await
            .map_err(|e| map_err(from, e))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        self.session
            .remove_file(path)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        self.session
            .remove_dir(path)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        self.session
            .create_dir(path)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn close(&self) {
        if let Err(error) = self.session.close().await {
            debug!(%error, "SFTP close error");
        }
    }
}
