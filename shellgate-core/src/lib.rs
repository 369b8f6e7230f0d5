pub mod consts;
mod data;
pub mod db;
mod drivers;
mod hub;
pub mod permissions;
pub mod recordings;
mod services;
mod sessions;
mod sftp_channels;
mod state;
mod templates;
mod vault;

pub use data::*;
pub use drivers::DriverRegistry;
pub use hub::{HubSubscription, RealtimeHub, StreamMessage};
pub use permissions::PermissionChecker;
pub use services::Services;
pub use sessions::{CloseSessionParams, SessionLifecycleService, StartSessionParams};
pub use sftp_channels::{SftpChannelRegistry, SftpLease};
pub use state::{
    ActiveSession, ActiveSessionRegistry, ChatEntry, ListActiveOptions, Participant,
    RegisterSessionParams,
};
pub use templates::{MaterializedConfig, TemplateCatalog, TemplateDef};
pub use vault::{VaultResolver, Viewer};
