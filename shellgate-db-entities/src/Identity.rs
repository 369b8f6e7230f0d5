use sea_orm::entity::prelude::*;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum IdentityScope {
    #[sea_orm(string_value = "global")]
    Global,
    #[sea_orm(string_value = "team")]
    Team,
    #[sea_orm(string_value = "connection")]
    Connection,
    #[sea_orm(string_value = "user")]
    User,
}

/// A credential record. The payload is AEAD-encrypted; plaintext exists
/// only transiently in a resolved secret map.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "identities")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub scope: IdentityScope,
    pub owner_user_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub connection_id: Option<Uuid>,
    pub template_id: Option<String>,
    /// nonce || ciphertext, base64.
    #[serde(skip_serializing)]
    pub payload: String,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Shares,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Shares => Entity::has_many(super::IdentityShare::Entity)
                .from(Column::Id)
                .to(super::IdentityShare::Column::IdentityId)
                .into(),
        }
    }
}

impl Related<super::IdentityShare::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Shares.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
