use std::sync::Arc;

use anyhow::Result;
use sea_orm::DatabaseConnection;
use shellgate_common::ShellgateConfig;
use tokio::sync::Mutex;

use crate::db::{close_stale_sessions, connect_to_db};
use crate::drivers::DriverRegistry;
use crate::hub::RealtimeHub;
use crate::permissions::PermissionChecker;
use crate::recordings::SessionRecordings;
use crate::sessions::SessionLifecycleService;
use crate::sftp_channels::SftpChannelRegistry;
use crate::state::ActiveSessionRegistry;
use crate::templates::TemplateCatalog;
use crate::vault::VaultResolver;

/// Shared service graph, cloned into every handler.
#[derive(Clone)]
pub struct Services {
    pub db: Arc<Mutex<DatabaseConnection>>,
    pub config: Arc<Mutex<ShellgateConfig>>,
    pub hub: Arc<RealtimeHub>,
    pub registry: Arc<ActiveSessionRegistry>,
    pub lifecycle: Arc<SessionLifecycleService>,
    pub permissions: Arc<PermissionChecker>,
    pub vault: Arc<VaultResolver>,
    pub recordings: Arc<SessionRecordings>,
    pub sftp_channels: Arc<SftpChannelRegistry>,
    pub drivers: Arc<DriverRegistry>,
    pub templates: Arc<TemplateCatalog>,
}

impl Services {
    /// Connects to the database, runs startup hygiene and wires the
    /// service graph. Drivers are registered by the caller beforehand.
    pub async fn new(config: ShellgateConfig, drivers: DriverRegistry) -> Result<Self> {
        let db = connect_to_db(&config).await?;
        close_stale_sessions(&db).await?;
        let db = Arc::new(Mutex::new(db));

        let hub = Arc::new(RealtimeHub::new());
        let registry = Arc::new(ActiveSessionRegistry::new(hub.clone()));
        let permissions = Arc::new(PermissionChecker::new(db.clone()));
        let recordings = Arc::new(SessionRecordings::new(db.clone(), &config)?);
        let vault = Arc::new(VaultResolver::new(
            db.clone(),
            permissions.clone(),
            &config.vault,
        )?);
        let lifecycle = Arc::new(SessionLifecycleService::new(
            db.clone(),
            registry.clone(),
            recordings.clone(),
            permissions.clone(),
            hub.clone(),
        ));

        Ok(Services {
            db,
            config: Arc::new(Mutex::new(config)),
            hub,
            registry,
            lifecycle,
            permissions,
            vault,
            recordings,
            sftp_channels: Arc::new(SftpChannelRegistry::new()),
            drivers: Arc::new(drivers),
            templates: Arc::new(TemplateCatalog::new()),
        })
    }
}
