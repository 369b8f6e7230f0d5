use sea_orm::entity::prelude::*;
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub is_root: bool,
    /// Per-user override of the concurrent session limit, 0 = unlimited,
    /// null = use the system default.
    pub concurrent_limit: Option<i32>,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Roles,
    Teams,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Roles => Entity::has_many(super::UserRoleAssignment::Entity)
                .from(Column::Id)
                .to(super::UserRoleAssignment::Column::UserId)
                .into(),
            Self::Teams => Entity::has_many(super::TeamMember::Entity)
                .from(Column::Id)
                .to(super::TeamMember::Column::UserId)
                .into(),
        }
    }
}

impl Related<super::Role::Entity> for Entity {
    fn to() -> RelationDef {
        super::UserRoleAssignment::Relation::Role.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::UserRoleAssignment::Relation::User.def().rev())
    }
}

impl ActiveModelBehavior for ActiveModel {}
