mod handle;
mod sftp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
pub use handle::{HandleError, SessionHandle, TerminalSize};
use serde::{Deserialize, Serialize};
pub use sftp::{SftpClient, SftpEntry, SftpError, SftpProvider};
use uuid::Uuid;

use crate::{Secret, SessionId};

pub const PROTOCOL_SSH: &str = "ssh";

/// What a protocol driver can do. Consulted before wiring optional
/// facilities (recording, SFTP) onto a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverCapabilities {
    pub terminal: bool,
    pub desktop: bool,
    pub file_transfer: bool,
    pub clipboard: bool,
    pub session_recording: bool,
    pub metrics: bool,
    pub reconnect: bool,
    #[serde(default)]
    pub extras: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("authentication failed")]
    AuthFailed,
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection timed out")]
    Timeout,
}

impl DriverError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthFailed => "driver.auth_failed",
            Self::Unreachable(_) => "driver.unreachable",
            Self::Protocol(_) | Self::Timeout => "driver.launch_failed",
        }
    }
}

/// Everything a driver needs to open a session against a target. The
/// secret map is the vault's resolved plaintext; it never outlives the
/// launch call.
pub struct LaunchParams {
    pub session_id: SessionId,
    pub connection_id: Uuid,
    pub protocol_id: String,
    pub user_id: Uuid,
    pub host: String,
    pub port: u16,
    pub settings: HashMap<String, serde_json::Value>,
    pub secret: Secret<HashMap<String, String>>,
    pub terminal: TerminalSize,
}

pub trait Driver: Send + Sync {
    fn protocol(&self) -> &'static str;
    fn capabilities(&self) -> DriverCapabilities;
    /// Present when the driver can open interactive sessions.
    fn launcher(&self) -> Option<&dyn Launcher>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, params: LaunchParams) -> Result<Arc<dyn SessionHandle>, DriverError>;
}
