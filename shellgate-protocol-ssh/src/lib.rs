mod client;
mod error;
mod handle;
mod sftp;

use std::sync::Arc;

use async_trait::async_trait;
pub use error::SshClientError;
pub use handle::SshSessionHandle;
use shellgate_common::protocols::{
    Driver, DriverCapabilities, DriverError, LaunchParams, Launcher, SessionHandle, PROTOCOL_SSH,
};
use shellgate_common::SshDriverConfig;
use tracing::*;

/// SSH protocol driver: opens interactive PTY sessions against targets
/// and exposes an SFTP subclient over the same connection.
pub struct SshDriver {
    config: SshDriverConfig,
}

impl SshDriver {
    pub fn new(config: &SshDriverConfig) -> Self {
        SshDriver {
            config: config.clone(),
        }
    }
}

impl Driver for SshDriver {
    fn protocol(&self) -> &'static str {
        PROTOCOL_SSH
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            terminal: true,
            desktop: false,
            file_transfer: true,
            clipboard: false,
            session_recording: true,
            metrics: false,
            reconnect: false,
            extras: vec![],
        }
    }

    fn launcher(&self) -> Option<&dyn Launcher> {
        Some(self)
    }
}

#[async_trait]
impl Launcher for SshDriver {
    async fn launch(&self, params: LaunchParams) -> Result<Arc<dyn SessionHandle>, DriverError> {
        info!(
            session_id=%params.session_id,
            host=%params.host,
            port=params.port,
            "Launching SSH session"
        );
        let handle = client::connect_and_open(&params, &self.config).await?;
        Ok(Arc::new(handle))
    }
}
