mod terminal;
mod writer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder,
};
use serde::Serialize;
use shellgate_common::helpers::fs::secure_directory;
use shellgate_common::protocols::TerminalSize;
use shellgate_common::{
    RecordingPolicySnapshot, RecordingStorageKind, SessionId, ShellgateConfig, ShellgateError,
};
use shellgate_db_entities::ConnectionSession;
use shellgate_db_entities::RecordingArtifact::{self, StorageKind};
use tokio::sync::Mutex;
use tracing::*;
use uuid::Uuid;

pub use terminal::{TerminalRecorder, TerminalStream};
pub use writer::{FinalizedRecording, RecordingWriter};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("database: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("failed to serialize a recording item: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("writer is closed")]
    Closed,

    #[error("writer queue overflow")]
    Overflow,

    #[error("recording storage unavailable")]
    Unavailable,
}

impl From<Error> for ShellgateError {
    fn from(e: Error) -> Self {
        match e {
            Error::Overflow => ShellgateError::RecordingOverflow,
            Error::Unavailable => ShellgateError::RecordingUnavailable,
            Error::Database(e) => ShellgateError::Database(e),
            Error::Io(e) => ShellgateError::Io(e),
            Error::Serialization(e) => ShellgateError::SerializeJson(e),
            Error::Closed => ShellgateError::RecordingUnavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

struct LiveRecording {
    record_id: Uuid,
    started_at: DateTime<Utc>,
    last_event_at: Option<DateTime<Utc>>,
    bytes_recorded: u64,
    policy: RecordingPolicySnapshot,
    storage_path: String,
    recorder: TerminalRecorder,
    failed: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatus {
    pub active: bool,
    pub session_id: SessionId,
    pub record_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub bytes_recorded: u64,
    pub recording_mode: shellgate_common::RecordingMode,
    pub failed: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingScope {
    Personal,
    Team,
    All,
}

pub struct ListRecordingsOptions {
    pub user_id: Uuid,
    pub scope: RecordingScope,
    pub team_ids: Vec<Uuid>,
    pub page: u64,
    pub per_page: u64,
    pub sort_desc: bool,
}

/// Sidecar capture of terminal streams. One gzip writer per recorded
/// session; artifacts are immutable once finalised.
pub struct SessionRecordings {
    db: Arc<Mutex<DatabaseConnection>>,
    path: PathBuf,
    live: Mutex<HashMap<SessionId, LiveRecording>>,
}

impl SessionRecordings {
    pub fn new(
        db: Arc<Mutex<DatabaseConnection>>,
        config: &ShellgateConfig,
    ) -> Result<Self> {
        let mut path = config.paths_relative_to.clone();
        path.push(&config.recordings.path);
        std::fs::create_dir_all(&path)?;
        secure_directory(&path)?;
        Ok(SessionRecordings {
            db,
            path,
            live: Mutex::new(HashMap::new()),
        })
    }

    /// Opens a recording for `session_id`. The caller has already decided
    /// that the policy demands recording.
    pub async fn start(
        &self,
        session_id: &SessionId,
        policy: RecordingPolicySnapshot,
        terminal: TerminalSize,
        title: &str,
    ) -> Result<()> {
        if policy.storage != RecordingStorageKind::Filesystem {
            return Err(Error::Unavailable);
        }

        let record_id = Uuid::new_v4();
        let storage_path = format!("{session_id}/{record_id}.cast.gz");
        let absolute = self.path.join(&storage_path);
        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let started_at = Utc::now();
        let recorder = TerminalRecorder::new(RecordingWriter::new(absolute)?);
        recorder.write_header(terminal, title, started_at)?;

        info!(%session_id, %record_id, "Recording session");
        let mut live = self.live.lock().await;
        live.insert(
            *session_id,
            LiveRecording {
                record_id,
                started_at,
                last_event_at: None,
                bytes_recorded: 0,
                policy,
                storage_path,
                recorder,
                failed: None,
            },
        );
        Ok(())
    }

    pub async fn is_recording(&self, session_id: &SessionId) -> bool {
        let live = self.live.lock().await;
        live.get(session_id).map(|r| r.failed.is_none()).unwrap_or(false)
    }

    /// Appends one stream chunk. Sessions that are not recording are
    /// ignored; an overflowing writer fails the recording but never
    /// blocks the caller.
    pub async fn record_stream(
        &self,
        session_id: &SessionId,
        stream: TerminalStream,
        chunk: &[u8],
    ) {
        let mut live = self.live.lock().await;
        let Some(state) = live.get_mut(session_id) else {
            return;
        };
        if state.failed.is_some() {
            return;
        }
        let overflowed = match state.recorder.write_event(stream, chunk) {
            Ok(()) => {
                state.bytes_recorded += chunk.len() as u64;
                state.last_event_at = Some(Utc::now());
                false
            }
            Err(Error::Overflow) => true,
            Err(error) => {
                warn!(%error, %session_id, "Recording write failed");
                state.failed = Some("error");
                false
            }
        };
        if overflowed {
            warn!(%session_id, "Recording writer overflow, closing recording");
            let state = live.remove(session_id);
            drop(live);
            if let Some(state) = state {
                if let Err(error) = self.finalize(*session_id, state, "overflow").await {
                    error!(%error, %session_id, "Could not finalise overflowed recording");
                }
            }
        }
    }

    pub async fn status(&self, session_id: &SessionId) -> Option<RecordingStatus> {
        let live = self.live.lock().await;
        live.get(session_id).map(|state| RecordingStatus {
            active: state.failed.is_none(),
            session_id: *session_id,
            record_id: state.record_id,
            started_at: state.started_at,
            last_event_at: state.last_event_at,
            bytes_recorded: state.bytes_recorded,
            recording_mode: state.policy.mode,
            failed: state.failed,
        })
    }

    /// Finishes the recording and persists its artifact row. A second
    /// stop is a no-op returning `None`.
    pub async fn stop(
        &self,
        session_id: &SessionId,
        reason: &str,
    ) -> Result<Option<RecordingArtifact::Model>> {
        let state = {
            let mut live = self.live.lock().await;
            live.remove(session_id)
        };
        match state {
            Some(state) => Ok(Some(self.finalize(*session_id, state, reason).await?)),
            None => Ok(None),
        }
    }

    async fn finalize(
        &self,
        session_id: SessionId,
        state: LiveRecording,
        reason: &str,
    ) -> Result<RecordingArtifact::Model> {
        let duration = state.recorder.elapsed_seconds();
        let finalized = state.recorder.finalize().await?;
        let created_at = Utc::now();
        let retention_until = (state.policy.retention_days > 0)
            .then(|| created_at + Duration::days(state.policy.retention_days as i64));

        info!(
            %session_id,
            record_id=%state.record_id,
            size=finalized.size_bytes,
            %reason,
            "Recording finalised"
        );

        use sea_orm::ActiveValue::Set;
        let db = self.db.lock().await;
        let model = RecordingArtifact::ActiveModel {
            id: Set(state.record_id),
            session_id: Set(session_id),
            storage_kind: Set(StorageKind::Filesystem),
            storage_path: Set(state.storage_path),
            size_bytes: Set(finalized.size_bytes as i64),
            duration_seconds: Set(duration),
            checksum: Set(finalized.checksum),
            created_at: Set(created_at),
            retention_until: Set(retention_until),
        };
        Ok(model.insert(&*db).await?)
    }

    pub async fn latest_artifact(
        &self,
        session_id: &SessionId,
    ) -> std::result::Result<Option<RecordingArtifact::Model>, ShellgateError> {
        let db = self.db.lock().await;
        Ok(RecordingArtifact::Entity::find()
            .filter(RecordingArtifact::Column::SessionId.eq(*session_id))
            .order_by_desc(RecordingArtifact::Column::CreatedAt)
            .one(&*db)
            .await?)
    }

    pub async fn get(
        &self,
        record_id: &Uuid,
    ) -> std::result::Result<(RecordingArtifact::Model, PathBuf), ShellgateError> {
        let db = self.db.lock().await;
        let model = RecordingArtifact::Entity::find_by_id(*record_id)
            .one(&*db)
            .await?
            .ok_or_else(|| ShellgateError::NotFound("recording".into()))?;
        let path = self.path.join(&model.storage_path);
        Ok((model, path))
    }

    pub async fn list(
        &self,
        options: &ListRecordingsOptions,
    ) -> std::result::Result<(Vec<RecordingArtifact::Model>, u64), ShellgateError> {
        let db = self.db.lock().await;

        let session_filter = match options.scope {
            RecordingScope::All => None,
            RecordingScope::Personal => {
                let sessions = ConnectionSession::Entity::find()
                    .filter(ConnectionSession::Column::OwnerUserId.eq(options.user_id))
                    .all(&*db)
                    .await?;
                Some(sessions.into_iter().map(|s| s.id).collect::<Vec<_>>())
            }
            RecordingScope::Team => {
                let sessions = ConnectionSession::Entity::find()
                    .filter(ConnectionSession::Column::TeamId.is_in(options.team_ids.clone()))
                    .all(&*db)
                    .await?;
                Some(sessions.into_iter().map(|s| s.id).collect::<Vec<_>>())
            }
        };

        let mut query = RecordingArtifact::Entity::find();
        if let Some(ids) = session_filter {
            query = query.filter(RecordingArtifact::Column::SessionId.is_in(ids));
        }
        query = if options.sort_desc {
            query.order_by_desc(RecordingArtifact::Column::CreatedAt)
        } else {
            query.order_by_asc(RecordingArtifact::Column::CreatedAt)
        };

        let per_page = options.per_page.clamp(1, 200);
        let paginator = query.paginate(&*db, per_page);
        let total = paginator.num_items().await?;
        let items = paginator.fetch_page(options.page).await?;
        Ok((items, total))
    }

    pub async fn delete(&self, record_id: &Uuid) -> std::result::Result<(), ShellgateError> {
        let (model, path) = self.get(record_id).await?;
        if let Err(error) = tokio::fs::remove_file(&path).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                return Err(error.into());
            }
        }
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        let db = self.db.lock().await;
        RecordingArtifact::Entity::delete_by_id(model.id)
            .exec(&*db)
            .await?;
        Ok(())
    }

    /// Deletes artifacts whose retention has lapsed. Runs from the daily
    /// sweeper.
    pub async fn sweep_expired(&self) -> std::result::Result<u64, ShellgateError> {
        let now = Utc::now();
        let expired = {
            let db = self.db.lock().await;
            RecordingArtifact::Entity::find()
                .filter(RecordingArtifact::Column::RetentionUntil.is_not_null())
                .filter(RecordingArtifact::Column::RetentionUntil.lt(now))
                .all(&*db)
                .await?
        };
        let mut removed = 0;
        for artifact in expired {
            let id = artifact.id;
            if let Err(error) = self.delete(&id).await {
                warn!(%error, record_id=%id, "Failed to delete expired recording");
            } else {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
