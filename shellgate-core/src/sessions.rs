use std::sync::Arc;

use chrono::{Duration, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use shellgate_common::{SessionId, SessionMetadata, ShellgateError};
use shellgate_db_entities::ConnectionSession::{self, SessionStatus};
use tokio::sync::Mutex;
use tracing::*;
use uuid::Uuid;

use crate::consts::STREAM_CONNECTION_SESSIONS;
use crate::hub::RealtimeHub;
use crate::permissions::{PermissionChecker, PERM_SESSION_VIEW_ALL, PERM_SESSION_VIEW_TEAM};
use crate::recordings::SessionRecordings;
use crate::state::{ActiveSessionRegistry, Participant, RegisterSessionParams};

pub struct StartSessionParams {
    pub session_id: Option<SessionId>,
    pub connection_id: Uuid,
    pub protocol_id: String,
    pub owner_user_id: Uuid,
    pub owner_username: String,
    pub team_id: Option<Uuid>,
    pub host: String,
    pub port: u16,
    pub concurrent_limit: u32,
    pub allow_duplicates: bool,
    pub metadata: SessionMetadata,
    /// `Starting` for the pre-launch path, `Active` when the tunnel is
    /// already attaching.
    pub status: SessionStatus,
}

pub struct CloseSessionParams {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub reason: String,
}

/// Orchestrates persistence, the in-memory registry and broadcasts.
/// Every mutation commits to the database and the registry before its
/// event goes out on the hub.
pub struct SessionLifecycleService {
    db: Arc<Mutex<DatabaseConnection>>,
    registry: Arc<ActiveSessionRegistry>,
    recordings: Arc<SessionRecordings>,
    permissions: Arc<PermissionChecker>,
    hub: Arc<RealtimeHub>,
}

impl SessionLifecycleService {
    pub fn new(
        db: Arc<Mutex<DatabaseConnection>>,
        registry: Arc<ActiveSessionRegistry>,
        recordings: Arc<SessionRecordings>,
        permissions: Arc<PermissionChecker>,
        hub: Arc<RealtimeHub>,
    ) -> Self {
        SessionLifecycleService {
            db,
            registry,
            recordings,
            permissions,
            hub,
        }
    }

    /// Writes the session row, registers the active record and broadcasts
    /// `session.opened`. The row is rolled back when the registry rejects
    /// the session (limit reached or duplicate).
    pub async fn start_session(
        &self,
        params: StartSessionParams,
    ) -> Result<SessionId, ShellgateError> {
        let id = params.session_id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();

        {
            use sea_orm::ActiveValue::Set;
            let db = self.db.lock().await;
            let row = ConnectionSession::ActiveModel {
                id: Set(id),
                connection_id: Set(params.connection_id),
                protocol_id: Set(params.protocol_id.clone()),
                owner_user_id: Set(params.owner_user_id),
                team_id: Set(params.team_id),
                host: Set(params.host.clone()),
                port: Set(params.port as i32),
                status: Set(params.status),
                started_at: Set(now),
                last_heartbeat_at: Set(now),
                closed_at: Set(None),
                close_reason: Set(None),
                metadata: Set(serde_json::to_value(&params.metadata)?),
            };
            row.insert(&*db).await?;
        }

        let register = self
            .registry
            .register_session(RegisterSessionParams {
                id,
                connection_id: params.connection_id,
                owner_user_id: params.owner_user_id,
                owner_username: params.owner_username,
                protocol_id: params.protocol_id,
                team_id: params.team_id,
                host: params.host,
                port: params.port,
                concurrent_limit: params.concurrent_limit,
                allow_duplicates: params.allow_duplicates,
                metadata: params.metadata.clone(),
            })
            .await;

        if let Err(error) = register {
            let db = self.db.lock().await;
            if let Err(rollback_error) =
                ConnectionSession::Entity::delete_by_id(id).exec(&*db).await
            {
                error!(%rollback_error, session_id=%id, "Failed to roll back session row");
            }
            return Err(error);
        }

        if params.status == SessionStatus::Active && params.metadata.recording_enabled {
            self.start_recording(&id, &params.metadata).await;
        }

        info!(session_id=%id, user_id=%params.owner_user_id, "Session started");
        self.hub
            .broadcast(
                STREAM_CONNECTION_SESSIONS,
                "session.opened",
                serde_json::json!({"session_id": id, "connection_id": params.connection_id}),
            )
            .await;
        Ok(id)
    }

    /// Flips a pre-launched session from `starting` to `active` when its
    /// tunnel attaches.
    pub async fn mark_active(&self, id: &SessionId) -> Result<(), ShellgateError> {
        let session = self.load(id).await?;
        match session.status {
            SessionStatus::Active => return Ok(()),
            SessionStatus::Starting => (),
            _ => return Err(ShellgateError::TunnelUnavailable),
        }

        {
            use sea_orm::ActiveValue::Set;
            let db = self.db.lock().await;
            let mut model: ConnectionSession::ActiveModel = session.clone().into();
            model.status = Set(SessionStatus::Active);
            model.last_heartbeat_at = Set(Utc::now());
            model.update(&*db).await?;
        }

        let metadata: SessionMetadata = serde_json::from_value(session.metadata)?;
        if metadata.recording_enabled {
            self.start_recording(id, &metadata).await;
        }
        Ok(())
    }

    async fn start_recording(&self, id: &SessionId, metadata: &SessionMetadata) {
        if self.recordings.is_recording(id).await {
            return;
        }
        if let Err(error) = self
            .recordings
            .start(
                id,
                metadata.recording_policy.clone(),
                metadata.terminal,
                &id.to_string(),
            )
            .await
        {
            warn!(%error, session_id=%id, "Could not start recording");
        }
    }

    /// Updates both the persisted and the in-memory last-seen timestamp.
    /// A heartbeat for a closed session is a no-op.
    pub async fn heartbeat(&self, id: &SessionId) {
        if self.registry.get_session(id).await.is_none() {
            return;
        }
        self.registry.heartbeat(id).await;

        use sea_orm::ActiveValue::Set;
        let db = self.db.lock().await;
        let result = ConnectionSession::Entity::update_many()
            .set(ConnectionSession::ActiveModel {
                last_heartbeat_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(ConnectionSession::Column::Id.eq(*id))
            .filter(ConnectionSession::Column::ClosedAt.is_null())
            .exec(&*db)
            .await;
        if let Err(error) = result {
            warn!(%error, session_id=%id, "Failed to persist heartbeat");
        }
    }

    /// Returns the persisted session row if `user_id` may access it.
    /// The row is consulted before the registry so closed sessions are
    /// rejected even while in-memory cleanup is still in flight.
    pub async fn authorize_session_access(
        &self,
        session_id: &SessionId,
        user_id: &Uuid,
    ) -> Result<ConnectionSession::Model, ShellgateError> {
        let session = self.load(session_id).await?;

        if session.owner_user_id == *user_id {
            return Ok(session);
        }

        if let Some(active) = self.registry.get_session(session_id).await {
            if active.lock().await.is_participant(user_id) {
                return Ok(session);
            }
        }

        if self
            .permissions
            .user_has_permission(user_id, PERM_SESSION_VIEW_ALL)
            .await?
        {
            return Ok(session);
        }

        if let Some(team_id) = session.team_id {
            if self
                .permissions
                .user_has_permission(user_id, PERM_SESSION_VIEW_TEAM)
                .await?
                && self.permissions.is_team_member(user_id, &team_id).await?
            {
                return Ok(session);
            }
        }

        Err(ShellgateError::SessionAccessDenied)
    }

    /// Marks the row terminal, removes the active record, closes the
    /// driver handle, finalises any recording and broadcasts
    /// `session.closed`. A second close is a no-op.
    pub async fn close_session(&self, params: CloseSessionParams) -> Result<(), ShellgateError> {
        let id = params.session_id;
        let session = self.load(&id).await?;
        if session.status.is_terminal() {
            return Ok(());
        }

        let status = if params.status.is_terminal() {
            params.status
        } else {
            SessionStatus::Closed
        };

        {
            use sea_orm::ActiveValue::Set;
            let db = self.db.lock().await;
            let mut model: ConnectionSession::ActiveModel = session.clone().into();
            model.status = Set(status);
            model.closed_at = Set(Some(Utc::now().max(session.started_at)));
            model.close_reason = Set(Some(params.reason.clone()));
            model.update(&*db).await?;
        }

        if let Some(active) = self.registry.remove_session(&id).await {
            let handle = active.lock().await.handle();
            if let Some(handle) = handle {
                handle.close().await;
            }
        }

        if let Err(error) = self.recordings.stop(&id, &params.reason).await {
            warn!(%error, session_id=%id, "Failed to finalise recording");
        }

        info!(session_id=%id, ?status, reason=%params.reason, "Session closed");
        self.hub
            .broadcast(
                STREAM_CONNECTION_SESSIONS,
                "session.closed",
                serde_json::json!({
                    "session_id": id,
                    "status": status,
                    "reason": params.reason,
                }),
            )
            .await;
        Ok(())
    }

    pub async fn add_participant(
        &self,
        session_id: &SessionId,
        participant: Participant,
        added_by: &Uuid,
    ) -> Result<Participant, ShellgateError> {
        let added = self.registry.add_participant(session_id, participant).await?;
        info!(
            %session_id,
            user_id=%added.user_id,
            %added_by,
            access_mode=?added.access_mode,
            "Participant joined"
        );
        Ok(added)
    }

    pub async fn remove_participant(
        &self,
        session_id: &SessionId,
        user_id: &Uuid,
        removed_by: &Uuid,
    ) -> Result<(), ShellgateError> {
        self.registry.remove_participant(session_id, user_id).await?;
        info!(%session_id, %user_id, %removed_by, "Participant left");
        Ok(())
    }

    pub async fn grant_write(
        &self,
        session_id: &SessionId,
        user_id: &Uuid,
        granted_by: &Uuid,
    ) -> Result<(), ShellgateError> {
        self.registry
            .grant_write_access(session_id, user_id, granted_by)
            .await?;
        info!(%session_id, %user_id, %granted_by, "Write access granted");
        Ok(())
    }

    pub async fn relinquish_write(
        &self,
        session_id: &SessionId,
        user_id: &Uuid,
    ) -> Result<Option<Uuid>, ShellgateError> {
        let new_holder = self
            .registry
            .relinquish_write_access(session_id, user_id)
            .await?;
        info!(%session_id, %user_id, ?new_holder, "Write access released");
        Ok(new_holder)
    }

    async fn load(&self, id: &SessionId) -> Result<ConnectionSession::Model, ShellgateError> {
        let db = self.db.lock().await;
        ConnectionSession::Entity::find_by_id(*id)
            .one(&*db)
            .await?
            .ok_or(ShellgateError::SessionNotFound(*id))
    }

    /// Evicts sessions whose heartbeat went stale. Called periodically.
    pub async fn evict_stale(&self, stale_after: Duration) {
        for id in self.registry.stale_sessions(stale_after).await {
            warn!(session_id=%id, "Evicting stale session");
            if let Err(error) = self
                .close_session(CloseSessionParams {
                    session_id: id,
                    status: SessionStatus::Evicted,
                    reason: "heartbeat_timeout".into(),
                })
                .await
            {
                error!(%error, session_id=%id, "Failed to evict session");
            }
        }
    }

    /// Closes every live session, e.g. on shutdown.
    pub async fn close_all(&self, reason: &str) {
        for id in self.registry.all_session_ids().await {
            if let Err(error) = self
                .close_session(CloseSessionParams {
                    session_id: id,
                    status: SessionStatus::Closed,
                    reason: reason.into(),
                })
                .await
            {
                error!(%error, session_id=%id, "Failed to close session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use data_encoding::BASE64;
    use sea_orm::{ActiveModelTrait, Database};
    use shellgate_common::protocols::TerminalSize;
    use shellgate_common::{
        JwtConfig, RecordingPolicySnapshot, Secret, ShellgateConfig, TemplateSnapshot, VaultConfig,
    };
    use shellgate_db_entities::Connection;
    use shellgate_db_migrations::migrate_database;

    use super::*;
    use crate::hub::RealtimeHub;
    use crate::recordings::SessionRecordings;
    use crate::state::ActiveSessionRegistry;

    struct Fixture {
        lifecycle: SessionLifecycleService,
        registry: Arc<ActiveSessionRegistry>,
        db: Arc<Mutex<DatabaseConnection>>,
        connection_id: Uuid,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        migrate_database(&db).await.unwrap();
        let db = Arc::new(Mutex::new(db));

        let dir = tempfile::tempdir().unwrap();
        let config = ShellgateConfig {
            database_url: Secret::new("sqlite::memory:".to_owned()),
            http: Default::default(),
            jwt: JwtConfig {
                secret: Secret::new("test".to_owned()),
                issuer: "shellgate".to_owned(),
                access_ttl: std::time::Duration::from_secs(60),
            },
            recordings: Default::default(),
            sessions: Default::default(),
            ssh: Default::default(),
            vault: VaultConfig {
                master_key: Secret::new(BASE64.encode(&[0u8; 32])),
            },
            paths_relative_to: dir.path().to_path_buf(),
        };

        let connection_id = Uuid::new_v4();
        {
            use sea_orm::ActiveValue::Set;
            let guard = db.lock().await;
            Connection::ActiveModel {
                id: Set(connection_id),
                name: Set("test-box".to_owned()),
                protocol_id: Set("ssh".to_owned()),
                owner_user_id: Set(Uuid::new_v4()),
                team_id: Set(None),
                host: Set("host.internal".to_owned()),
                port: Set(2222),
                settings: Set(serde_json::json!({})),
                identity_id: Set(None),
                template_id: Set(None),
                template_fingerprint: Set(None),
                concurrent_limit: Set(None),
                allow_duplicate_sessions: Set(None),
                enable_sftp: Set(None),
                created_at: Set(Utc::now()),
                updated_at: Set(Utc::now()),
            }
            .insert(&*guard)
            .await
            .unwrap();
        }

        let hub = Arc::new(RealtimeHub::new());
        let registry = Arc::new(ActiveSessionRegistry::new(hub.clone()));
        let permissions = Arc::new(PermissionChecker::new(db.clone()));
        let recordings = Arc::new(SessionRecordings::new(db.clone(), &config).unwrap());
        let lifecycle = SessionLifecycleService::new(
            db.clone(),
            registry.clone(),
            recordings,
            permissions,
            hub,
        );

        Fixture {
            lifecycle,
            registry,
            db,
            connection_id,
            _dir: dir,
        }
    }

    fn metadata() -> SessionMetadata {
        SessionMetadata {
            recording_policy: RecordingPolicySnapshot {
                mode: shellgate_common::RecordingMode::Disabled,
                storage: shellgate_common::RecordingStorageKind::Filesystem,
                retention_days: 0,
                require_consent: false,
            },
            recording_enabled: false,
            sftp_enabled: true,
            terminal: TerminalSize::default(),
            template: TemplateSnapshot::default(),
            capabilities: vec![],
        }
    }

    fn start_params(fx: &Fixture, owner: Uuid, limit: u32) -> StartSessionParams {
        StartSessionParams {
            session_id: None,
            connection_id: fx.connection_id,
            protocol_id: "ssh".to_owned(),
            owner_user_id: owner,
            owner_username: "owner".to_owned(),
            team_id: None,
            host: "host.internal".to_owned(),
            port: 2222,
            concurrent_limit: limit,
            allow_duplicates: true,
            metadata: metadata(),
            status: SessionStatus::Active,
        }
    }

    #[tokio::test]
    async fn start_and_close_round_trip() {
        let fx = fixture().await;
        let owner = Uuid::new_v4();
        let id = fx.lifecycle.start_session(start_params(&fx, owner, 0)).await.unwrap();

        let row = fx.lifecycle.authorize_session_access(&id, &owner).await.unwrap();
        assert_eq!(row.status, SessionStatus::Active);
        assert!(row.closed_at.is_none());

        fx.lifecycle
            .close_session(CloseSessionParams {
                session_id: id,
                status: SessionStatus::Closed,
                reason: "completed".to_owned(),
            })
            .await
            .unwrap();

        let row = fx.lifecycle.authorize_session_access(&id, &owner).await.unwrap();
        assert_eq!(row.status, SessionStatus::Closed);
        assert_eq!(row.close_reason.as_deref(), Some("completed"));
        let closed_at = row.closed_at.unwrap();
        assert!(closed_at >= row.started_at);
        assert!(fx.registry.get_session(&id).await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let fx = fixture().await;
        let owner = Uuid::new_v4();
        let id = fx.lifecycle.start_session(start_params(&fx, owner, 0)).await.unwrap();

        for reason in ["completed", "second-close-ignored"] {
            fx.lifecycle
                .close_session(CloseSessionParams {
                    session_id: id,
                    status: SessionStatus::Closed,
                    reason: reason.to_owned(),
                })
                .await
                .unwrap();
        }
        let row = fx.lifecycle.authorize_session_access(&id, &owner).await.unwrap();
        assert_eq!(row.close_reason.as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn authorize_denies_strangers() {
        let fx = fixture().await;
        let owner = Uuid::new_v4();
        let id = fx.lifecycle.start_session(start_params(&fx, owner, 0)).await.unwrap();

        let stranger = Uuid::new_v4();
        assert!(matches!(
            fx.lifecycle.authorize_session_access(&id, &stranger).await,
            Err(ShellgateError::SessionAccessDenied)
        ));
        assert!(matches!(
            fx.lifecycle
                .authorize_session_access(&Uuid::new_v4(), &owner)
                .await,
            Err(ShellgateError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn registry_reject_rolls_back_the_row() {
        let fx = fixture().await;
        let owner = Uuid::new_v4();
        fx.lifecycle.start_session(start_params(&fx, owner, 1)).await.unwrap();

        let second = fx.lifecycle.start_session(start_params(&fx, owner, 1)).await;
        assert!(matches!(second, Err(ShellgateError::ConcurrentLimit(1))));

        let count = {
            use sea_orm::{ColumnTrait, QueryFilter};
            let db = fx.db.lock().await;
            ConnectionSession::Entity::find()
                .filter(ConnectionSession::Column::OwnerUserId.eq(owner))
                .all(&*db)
                .await
                .unwrap()
                .len()
        };
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn heartbeat_after_close_is_a_noop() {
        let fx = fixture().await;
        let owner = Uuid::new_v4();
        let id = fx.lifecycle.start_session(start_params(&fx, owner, 0)).await.unwrap();
        fx.lifecycle
            .close_session(CloseSessionParams {
                session_id: id,
                status: SessionStatus::Closed,
                reason: "completed".to_owned(),
            })
            .await
            .unwrap();
        let before = fx.lifecycle.authorize_session_access(&id, &owner).await.unwrap();

        fx.lifecycle.heartbeat(&id).await;

        let after = fx.lifecycle.authorize_session_access(&id, &owner).await.unwrap();
        assert_eq!(before.last_heartbeat_at, after.last_heartbeat_at);
    }

    #[tokio::test]
    async fn stale_sessions_are_evicted() {
        let fx = fixture().await;
        let owner = Uuid::new_v4();
        let id = fx.lifecycle.start_session(start_params(&fx, owner, 0)).await.unwrap();

        // Anything is stale against a zero threshold.
        fx.lifecycle.evict_stale(Duration::zero()).await;

        let row = fx.lifecycle.authorize_session_access(&id, &owner).await.unwrap();
        assert_eq!(row.status, SessionStatus::Evicted);
        assert_eq!(row.close_reason.as_deref(), Some("heartbeat_timeout"));
        assert!(fx.registry.get_session(&id).await.is_none());
    }
}
