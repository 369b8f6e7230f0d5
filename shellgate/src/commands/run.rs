use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use shellgate_core::db::cleanup_db;
use shellgate_core::{DriverRegistry, Services};
use shellgate_protocol_http::HttpGatewayServer;
use shellgate_protocol_ssh::SshDriver;
use tracing::*;

use crate::config::load_config;

const HEARTBEAT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(120);
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const SESSION_ROW_RETENTION: Duration = Duration::from_secs(90 * 24 * 3600);

pub(crate) async fn command(cli: &crate::Cli) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    info!(%version, "Shellgate");

    let config = load_config(&cli.config)?;

    let mut drivers = DriverRegistry::new();
    if config.ssh.enable {
        drivers.register(Arc::new(SshDriver::new(&config.ssh)));
    }

    let listen = config.http.listen.clone();
    let services = Services::new(config, drivers).await?;

    // Stale-heartbeat eviction: a dead client leads to session close
    // within a couple of sweep intervals even without a clean WS close.
    tokio::spawn({
        let lifecycle = services.lifecycle.clone();
        async move {
            loop {
                tokio::time::sleep(HEARTBEAT_SWEEP_INTERVAL).await;
                lifecycle
                    .evict_stale(chrono::Duration::from_std(HEARTBEAT_STALE_AFTER).unwrap_or_default())
                    .await;
            }
        }
    });

    // Daily retention sweep for recordings and old session rows.
    tokio::spawn({
        let services = services.clone();
        async move {
            loop {
                match services.recordings.sweep_expired().await {
                    Ok(0) => debug!("Retention sweep: nothing to remove"),
                    Ok(removed) => info!(removed, "Retention sweep removed expired recordings"),
                    Err(error) => error!(%error, "Retention sweep failed"),
                }
                if let Err(error) = cleanup_db(&services.db, &SESSION_ROW_RETENTION).await {
                    error!(%error, "Failed to clean up the database");
                }
                tokio::time::sleep(RETENTION_SWEEP_INTERVAL).await;
            }
        }
    });

    let server = HttpGatewayServer::new(&services).await?;

    if console::user_attended() {
        info!("--------------------------------------------");
        info!("Shellgate is now running.");
        info!("Accepting HTTP connections on {listen}");
        info!("--------------------------------------------");
    }

    tokio::select! {
        result = server.run(listen) => {
            if let Err(error) = result {
                error!(?error, "HTTP server error");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            services.lifecycle.close_all("server_shutdown").await;
        }
    }

    info!("Exiting");
    Ok(())
}
