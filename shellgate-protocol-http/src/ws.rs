use poem::web::websocket::WebSocket;
use poem::web::{Data, Query};
use poem::{handler, IntoResponse, Request};
use shellgate_common::ShellgateError;
use shellgate_core::consts::STREAM_NOTIFICATIONS;
use shellgate_core::Services;
use tracing::*;

use crate::auth::{CurrentUser, TUNNEL_PURPOSE};
use crate::hub_ws::{origin_allowed, serve_hub};
use crate::tunnel::{self, TunnelQuery};

/// Single WebSocket surface: `?tunnel=ssh` opens a session tunnel,
/// otherwise the connection subscribes to named realtime streams.
#[handler]
pub async fn ws_endpoint(
    req: &Request,
    ws: WebSocket,
    Data(services): Data<&Services>,
    user: CurrentUser,
    Query(query): Query<TunnelQuery>,
) -> poem::Result<poem::Response> {
    let origin = req
        .headers()
        .get(http::header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok());
    let allowed_origins = {
        let config = services.config.lock().await;
        config.http.allowed_origins.clone()
    };
    if !origin_allowed(origin, host, &allowed_origins) {
        warn!(?origin, "WebSocket origin rejected");
        return Err(ShellgateError::PermissionDenied.into());
    }

    // A tunnel token opens exactly the session it was minted for.
    if user.claims.purpose.as_deref() == Some(TUNNEL_PURPOSE)
        && user.claims.session_id != query.session_id
    {
        return Err(ShellgateError::Unauthorized.into());
    }

    match query.tunnel.as_deref() {
        Some("ssh") => {
            let prepared = tunnel::prepare(services, &user, &query).await?;
            let services = services.clone();
            Ok(ws
                .on_upgrade(move |socket| tunnel::run(services, prepared, socket))
                .into_response())
        }
        Some(other) => {
            Err(ShellgateError::BadRequest(format!("unsupported tunnel type {other}")).into())
        }
        None => {
            let streams: Vec<String> = query
                .streams
                .as_deref()
                .unwrap_or(STREAM_NOTIFICATIONS)
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.trim().to_owned())
                .collect();
            let subscription = services.hub.subscribe(user.user_id, streams).await?;
            let services = services.clone();
            let user_id = user.user_id;
            Ok(ws
                .on_upgrade(move |socket| serve_hub(services, user_id, subscription, socket))
                .into_response())
        }
    }
}
