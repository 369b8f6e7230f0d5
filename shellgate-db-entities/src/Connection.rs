use sea_orm::entity::prelude::*;
use serde::Serialize;
use uuid::Uuid;

/// A saved target. Host and protocol are immutable under update.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub protocol_id: String,
    pub owner_user_id: Uuid,
    pub team_id: Option<Uuid>,
    pub host: String,
    pub port: i32,
    /// Driver settings map (JSON object).
    pub settings: serde_json::Value,
    pub identity_id: Option<Uuid>,
    pub template_id: Option<String>,
    pub template_fingerprint: Option<String>,
    /// Per-connection override of the concurrent session limit, 0 = use
    /// the system default.
    pub concurrent_limit: Option<i32>,
    pub allow_duplicate_sessions: Option<bool>,
    pub enable_sftp: Option<bool>,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Sessions,
    Identity,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Sessions => Entity::has_many(super::ConnectionSession::Entity)
                .from(Column::Id)
                .to(super::ConnectionSession::Column::ConnectionId)
                .into(),
            Self::Identity => Entity::belongs_to(super::Identity::Entity)
                .from(Column::IdentityId)
                .to(super::Identity::Column::Id)
                .into(),
        }
    }
}

impl Related<super::ConnectionSession::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Sessions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
