use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum SftpError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("file too large")]
    FileTooLarge,
    #[error("upload too large")]
    UploadTooLarge,
    #[error("requested range not satisfiable")]
    RangeInvalid,
    #[error("no SFTP channel for this session")]
    SessionNotFound,
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("SFTP error: {0}")]
    Other(String),
}

impl SftpError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "sftp.not_found",
            Self::PermissionDenied(_) => "sftp.permission_denied",
            Self::FileTooLarge => "sftp.file_too_large",
            Self::UploadTooLarge => "sftp.upload_too_large",
            Self::RangeInvalid => "sftp.range_invalid",
            Self::SessionNotFound => "sftp_session_not_found",
            Self::InvalidPath(_) => "bad_request",
            Self::Other(_) => "sftp.error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SftpEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
    pub permissions: Option<u32>,
}

/// Capability facet of a session handle: opens SFTP subclients over the
/// already-established target connection.
#[async_trait]
pub trait SftpProvider: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn SftpClient>, SftpError>;
}

/// The minimal file-operation surface the HTTP handlers need. Paths are
/// already sanitised by the caller.
#[async_trait]
pub trait SftpClient: Send + Sync {
    async fn read_dir(&self, path: &str) -> Result<Vec<SftpEntry>, SftpError>;
    async fn metadata(&self, path: &str) -> Result<SftpEntry, SftpError>;
    /// Reads up to `limit` bytes starting at `offset`.
    async fn read(&self, path: &str, offset: u64, limit: u64) -> Result<Bytes, SftpError>;
    /// Writes `data` at `offset`, creating the file when `offset == 0`.
    /// Returns the resulting total file size.
    async fn write(&self, path: &str, offset: u64, data: Bytes) -> Result<u64, SftpError>;
    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError>;
    async fn remove_file(&self, path: &str) -> Result<(), SftpError>;
    async fn remove_dir(&self, path: &str) -> Result<(), SftpError>;
    async fn create_dir(&self, path: &str) -> Result<(), SftpError>;
    async fn close(&self);
}
