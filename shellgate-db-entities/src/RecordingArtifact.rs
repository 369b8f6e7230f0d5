use sea_orm::entity::prelude::*;
use sea_orm::sea_query::ForeignKeyAction;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[sea_orm(string_value = "filesystem")]
    Filesystem,
    #[sea_orm(string_value = "s3")]
    S3,
}

/// Finalised capture of a session's terminal streams. Immutable once the
/// checksum is written.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "recording_artifacts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub session_id: Uuid,
    pub storage_kind: StorageKind,
    pub storage_path: String,
    pub size_bytes: i64,
    pub duration_seconds: f64,
    /// sha256 over the compressed bytes, hex.
    pub checksum: String,
    pub created_at: ChronoDateTimeUtc,
    pub retention_until: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Session,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Session => Entity::belongs_to(super::ConnectionSession::Entity)
                .from(Column::SessionId)
                .to(super::ConnectionSession::Column::Id)
                .on_delete(ForeignKeyAction::Cascade)
                .into(),
        }
    }
}

impl Related<super::ConnectionSession::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Session.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
