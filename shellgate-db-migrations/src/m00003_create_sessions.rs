use sea_orm::Schema;
use sea_orm_migration::prelude::*;

pub mod connection_session {
    use sea_orm::entity::prelude::*;
    use sea_orm::sea_query::ForeignKeyAction;
    use uuid::Uuid;

    use super::super::m00002_create_connections::connection;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
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
        pub status: String,
        pub started_at: DateTimeUtc,
        pub last_heartbeat_at: DateTimeUtc,
        pub closed_at: Option<DateTimeUtc>,
        pub close_reason: Option<String>,
        pub metadata: serde_json::Value,
    }

    #[derive(Copy, Clone, Debug, EnumIter)]
    pub enum Relation {
        Connection,
    }

    impl RelationTrait for Relation {
        fn def(&self) -> RelationDef {
            match self {
                Self::Connection => Entity::belongs_to(connection::Entity)
                    .from(Column::ConnectionId)
                    .to(connection::Column::Id)
                    .on_delete(ForeignKeyAction::Cascade)
                    .into(),
            }
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m00003_create_sessions"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let builder = manager.get_database_backend();
        let schema = Schema::new(builder);
        manager
            .create_table(schema.create_table_from_entity(connection_session::Entity))
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(connection_session::Entity).to_owned())
            .await?;
        Ok(())
    }
}
