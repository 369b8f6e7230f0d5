use sea_orm::entity::prelude::*;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[sea_orm(string_value = "starting")]
    Starting,
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "closed")]
    Closed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "evicted")]
    Evicted,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed | Self::Evicted)
    }
}

/// Persisted session row. Invariant: `closed_at` is non-null exactly when
/// the status is terminal, and `closed_at >= started_at`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "connection_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub connection_id: Uuid,
    pub protocol_id: String,
    pub owner_user_id: Uuid,
    pub team_id: Option<Uuid>,
    pub host: String,
    pub port: i32,
    pub status: SessionStatus,
    pub started_at: ChronoDateTimeUtc,
    pub last_heartbeat_at: ChronoDateTimeUtc,
    pub closed_at: Option<ChronoDateTimeUtc>,
    pub close_reason: Option<String>,
    /// `shellgate_common::SessionMetadata` blob.
    pub metadata: serde_json::Value,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Connection,
    Recordings,
    ChatMessages,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Connection => Entity::belongs_to(super::Connection::Entity)
                .from(Column::ConnectionId)
                .to(super::Connection::Column::Id)
                .into(),
            Self::Recordings => Entity::has_many(super::RecordingArtifact::Entity)
                .from(Column::Id)
                .to(super::RecordingArtifact::Column::SessionId)
                .into(),
            Self::ChatMessages => Entity::has_many(super::ChatMessage::Entity)
                .from(Column::Id)
                .to(super::ChatMessage::Column::SessionId)
                .into(),
        }
    }
}

impl Related<super::Connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl Related<super::RecordingArtifact::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Recordings.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
