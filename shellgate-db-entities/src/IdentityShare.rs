use sea_orm::entity::prelude::*;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, EnumIter, DeriveActiveEnum, Serialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(8))")]
#[serde(rename_all = "lowercase")]
pub enum ShareLevel {
    #[sea_orm(string_value = "view")]
    View,
    #[sea_orm(string_value = "use")]
    Use,
    #[sea_orm(string_value = "manage")]
    Manage,
}

/// Grants a user or a team access to an identity at a given level.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "identity_shares")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub identity_id: Uuid,
    pub user_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub level: ShareLevel,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Identity,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Identity => Entity::belongs_to(super::Identity::Entity)
                .from(Column::IdentityId)
                .to(super::Identity::Column::Id)
                .into(),
        }
    }
}

impl Related<super::Identity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Identity.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
