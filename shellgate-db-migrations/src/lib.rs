use sea_orm::DatabaseConnection;
use sea_orm_migration::prelude::*;
use sea_orm_migration::MigrationTrait;

mod m00001_create_directory;
mod m00002_create_connections;
mod m00003_create_sessions;
mod m00004_create_recordings;
mod m00005_create_chat;
mod m00006_create_snippets;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m00001_create_directory::Migration),
            Box::new(m00002_create_connections::Migration),
            Box::new(m00003_create_sessions::Migration),
            Box::new(m00004_create_recordings::Migration),
            Box::new(m00005_create_chat::Migration),
            Box::new(m00006_create_snippets::Migration),
        ]
    }
}

pub async fn migrate_database(connection: &DatabaseConnection) -> Result<(), DbErr> {
    Migrator::up(connection, None).await
}
