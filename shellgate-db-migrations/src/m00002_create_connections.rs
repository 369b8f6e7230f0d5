use sea_orm::Schema;
use sea_orm_migration::prelude::*;

pub mod connection {
    use sea_orm::entity::prelude::*;
    use uuid::Uuid;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
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
        pub settings: serde_json::Value,
        pub identity_id: Option<Uuid>,
        pub template_id: Option<String>,
        pub template_fingerprint: Option<String>,
        pub concurrent_limit: Option<i32>,
        pub allow_duplicate_sessions: Option<bool>,
        pub enable_sftp: Option<bool>,
        pub created_at: DateTimeUtc,
        pub updated_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod identity {
    use sea_orm::entity::prelude::*;
    use uuid::Uuid;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "identities")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: Uuid,
        pub name: String,
        pub scope: String,
        pub owner_user_id: Option<Uuid>,
        pub team_id: Option<Uuid>,
        pub connection_id: Option<Uuid>,
        pub template_id: Option<String>,
        pub payload: String,
        pub created_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod identity_share {
    use sea_orm::entity::prelude::*;
    use uuid::Uuid;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "identity_shares")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: Uuid,
        pub identity_id: Uuid,
        pub user_id: Option<Uuid>,
        pub team_id: Option<Uuid>,
        pub level: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter)]
    pub enum Relation {
        Identity,
    }

    impl RelationTrait for Relation {
        fn def(&self) -> RelationDef {
            match self {
                Self::Identity => Entity::belongs_to(super::identity::Entity)
                    .from(Column::IdentityId)
                    .to(super::identity::Column::Id)
                    .into(),
            }
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m00002_create_connections"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let builder = manager.get_database_backend();
        let schema = Schema::new(builder);
        manager
            .create_table(schema.create_table_from_entity(connection::Entity))
            .await?;
        manager
            .create_table(schema.create_table_from_entity(identity::Entity))
            .await?;
        manager
            .create_table(schema.create_table_from_entity(identity_share::Entity))
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(identity_share::Entity).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(identity::Entity).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(connection::Entity).to_owned())
            .await?;
        Ok(())
    }
}
