use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectOptions, Database, DatabaseConnection, EntityTrait, QueryFilter,
    TransactionTrait,
};
use shellgate_common::helpers::fs::secure_file;
use shellgate_common::ShellgateConfig;
use shellgate_db_entities::ConnectionSession::{self, SessionStatus};
use shellgate_db_migrations::migrate_database;
use tokio::sync::Mutex;
use tracing::*;

pub async fn connect_to_db(config: &ShellgateConfig) -> Result<DatabaseConnection> {
    let mut url = url::Url::parse(&config.database_url.expose_secret()[..])?;
    if url.scheme() == "sqlite" {
        let path = url.path();
        let mut abs_path = config.paths_relative_to.clone();
        abs_path.push(path);
        abs_path.push("db.sqlite3");

        if let Some(parent) = abs_path.parent() {
            std::fs::create_dir_all(parent)?
        }

        url.set_path(
            abs_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Failed to convert database path to string"))?,
        );
        url.set_query(Some("mode=rwc"));

        let db = Database::connect(ConnectOptions::new(url.to_string())).await?;
        db.begin().await?.commit().await?;
        drop(db);

        secure_file(&abs_path)?;
    }

    let mut opt = ConnectOptions::new(url.to_string());
    opt.max_connections(100)
        .min_connections(5)
        .connect_timeout(Duration::from_secs(8))
        .idle_timeout(Duration::from_secs(8))
        .max_lifetime(Duration::from_secs(8))
        .sqlx_logging(true);

    let connection = Database::connect(opt).await?;

    migrate_database(&connection).await?;
    Ok(connection)
}

/// Startup hygiene: any session row left open by a previous process is a
/// leftover; mark it closed so authorization and listings never see a
/// phantom live session.
pub async fn close_stale_sessions(db: &DatabaseConnection) -> Result<()> {
    use sea_orm::ActiveValue::Set;

    let affected = ConnectionSession::Entity::update_many()
        .set(ConnectionSession::ActiveModel {
            status: Set(SessionStatus::Closed),
            closed_at: Set(Some(Utc::now())),
            close_reason: Set(Some("server_restart".to_owned())),
            ..Default::default()
        })
        .filter(Expr::col(ConnectionSession::Column::ClosedAt).is_null())
        .exec(db)
        .await?
        .rows_affected;
    if affected > 0 {
        warn!(count = affected, "Closed sessions left over from a previous run");
    }
    Ok(())
}

/// Prunes terminally-closed sessions older than `retention`. Recording
/// artifacts have their own retention sweep.
pub async fn cleanup_db(db: &Arc<Mutex<DatabaseConnection>>, retention: &Duration) -> Result<()> {
    let cutoff = Utc::now() - chrono::Duration::from_std(*retention)?;
    let db = db.lock().await;

    ConnectionSession::Entity::delete_many()
        .filter(Expr::col(ConnectionSession::Column::ClosedAt).is_not_null())
        .filter(ConnectionSession::Column::ClosedAt.lt(cutoff))
        .exec(&*db)
        .await?;

    Ok(())
}
