mod api;
mod auth;
mod bridge;
mod common;
mod envelope;
mod hub_ws;
mod range;
mod sftp_path;
mod tunnel;
mod ws;

use std::fmt::Debug;

use anyhow::Result;
use poem::listener::TcpListener;
use poem::{Endpoint, EndpointExt, IntoResponse, Route, Server};
use shellgate_core::Services;
use tracing::*;

pub use auth::{issue_access_token, CurrentUser};
pub use bridge::{BridgeEvents, BridgeParams, TerminalBridge};

use crate::envelope::error_response;

/// The HTTP+WebSocket face of the gateway.
pub struct HttpGatewayServer {
    services: Services,
}

impl HttpGatewayServer {
    pub async fn new(services: &Services) -> Result<Self> {
        Ok(HttpGatewayServer {
            services: services.clone(),
        })
    }

    pub fn app(&self) -> impl poem::Endpoint {
        Route::new()
            .nest("/api", api::routes().around(|ep, req| async move {
                Ok(match ep.call(req).await {
                    Ok(response) => response.into_response(),
                    Err(error) => error_response(error),
                })
            }))
            .at("/ws", poem::get(ws::ws_endpoint))
            .data(self.services.clone())
    }

    pub async fn run(self, address: String) -> Result<()> {
        let app = self.app();
        info!(%address, "Listening");
        Server::new(TcpListener::bind(address)).run(app).await?;
        Ok(())
    }
}

impl Debug for HttpGatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HttpGatewayServer")
    }
}
