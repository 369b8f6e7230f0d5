use sea_orm::Schema;
use sea_orm_migration::prelude::*;

pub mod recording_artifact {
    use sea_orm::entity::prelude::*;
    use sea_orm::sea_query::ForeignKeyAction;
    use uuid::Uuid;

    use super::super::m00003_create_sessions::connection_session;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "recording_artifacts")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: Uuid,
        pub session_id: Uuid,
        pub storage_kind: String,
        pub storage_path: String,
        pub size_bytes: i64,
        pub duration_seconds: f64,
        pub checksum: String,
        pub created_at: DateTimeUtc,
        pub retention_until: Option<DateTimeUtc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter)]
    pub enum Relation {
        Session,
    }

    impl RelationTrait for Relation {
        fn def(&self) -> RelationDef {
            match self {
                Self::Session => Entity::belongs_to(connection_session::Entity)
                    .from(Column::SessionId)
                    .to(connection_session::Column::Id)
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
        "m00004_create_recordings"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let builder = manager.get_database_backend();
        let schema = Schema::new(builder);
        manager
            .create_table(schema.create_table_from_entity(recording_artifact::Entity))
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(recording_artifact::Entity).to_owned())
            .await?;
        Ok(())
    }
}
