use std::collections::HashMap;

use poem::web::{Data, Json, Query};
use poem::{handler, Response};
use serde::Deserialize;
use shellgate_common::protocols::{TerminalSize, PROTOCOL_SSH};
use shellgate_common::{ShellgateError, TunnelDescriptor};
use shellgate_core::permissions::{PERM_SESSION_VIEW_ALL, PERM_SESSION_VIEW_TEAM};
use shellgate_core::{
    ActiveSessionSnapshot, ListActiveOptions, Services, SessionSnapshot, StartSessionParams,
};
use shellgate_db_entities::ConnectionSession::{self, SessionStatus};
use sea_orm::EntityTrait;
use serde_json::json;
use uuid::Uuid;

use crate::auth::{issue_tunnel_token, CurrentUser};
use crate::common::{
    build_session_metadata, display_name, effective_concurrent_limit, ensure_launch_permissions,
    get_visible_connection, load_user,
};
use crate::envelope::{api_created, api_ok};

#[derive(Deserialize)]
struct LaunchRequest {
    connection_id: Uuid,
    session_id: Option<Uuid>,
    recording_enabled: Option<bool>,
    terminal_width: Option<u32>,
    terminal_height: Option<u32>,
}

/// Reserves a session and hands back the WebSocket tunnel descriptor.
/// The driver connection is opened when the tunnel attaches.
#[handler]
pub async fn launch(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Json(body): Json<LaunchRequest>,
) -> poem::Result<Response> {
    let connection = get_visible_connection(services, &user.user_id, &body.connection_id).await?;
    if connection.protocol_id != PROTOCOL_SSH {
        return Err(ShellgateError::HandleIncompatible.into());
    }
    ensure_launch_permissions(services, &user.user_id, &connection).await?;

    let config = services.templates.materialize(&connection);
    let terminal = match (body.terminal_width, body.terminal_height) {
        (Some(cols), Some(rows)) if cols > 0 && rows > 0 => TerminalSize { cols, rows },
        _ => TerminalSize::default(),
    };
    let metadata = build_session_metadata(
        services,
        &connection,
        &config,
        body.recording_enabled.unwrap_or(false),
        terminal,
    )
    .await;

    let owner = load_user(services, &user.user_id).await?;
    let (concurrent_limit, allow_duplicates) = {
        let app_config = services.config.lock().await;
        (
            effective_concurrent_limit(
                connection.concurrent_limit,
                owner.concurrent_limit,
                app_config.sessions.concurrent_limit_default,
            ),
            connection
                .allow_duplicate_sessions
                .unwrap_or(app_config.sessions.allow_duplicate_connections),
        )
    };

    let session_id = services
        .lifecycle
        .start_session(StartSessionParams {
            session_id: body.session_id,
            connection_id: connection.id,
            protocol_id: connection.protocol_id.clone(),
            owner_user_id: user.user_id,
            owner_username: display_name(services, &user.user_id).await,
            team_id: connection.team_id,
            host: config.host.clone(),
            port: config.port,
            concurrent_limit,
            allow_duplicates,
            metadata: metadata.clone(),
            status: SessionStatus::Starting,
        })
        .await?;

    let token = {
        let app_config = services.config.lock().await;
        issue_tunnel_token(&app_config.jwt, user.user_id, session_id)?
    };

    let session = {
        let db = services.db.lock().await;
        ConnectionSession::Entity::find_by_id(session_id)
            .one(&*db)
            .await
            .map_err(ShellgateError::from)?
            .ok_or(ShellgateError::SessionNotFound(session_id))?
    };

    let tunnel = TunnelDescriptor {
        url: "/ws".to_owned(),
        token,
        protocol: PROTOCOL_SSH.to_owned(),
        params: HashMap::from([
            ("tunnel".to_owned(), PROTOCOL_SSH.to_owned()),
            ("session_id".to_owned(), session_id.to_string()),
            ("connection_id".to_owned(), connection.id.to_string()),
        ]),
    };

    Ok(api_created(json!({
        "session": SessionSnapshot::from(session),
        "tunnel": tunnel,
        "descriptor": {
            "connection_id": connection.id,
            "name": connection.name,
            "protocol_id": connection.protocol_id,
            "host": config.host,
            "port": config.port,
        },
        "template_mismatch": metadata.template.version_mismatch,
    })))
}

#[derive(Deserialize)]
struct ListQuery {
    scope: Option<String>,
    team_id: Option<Uuid>,
    protocol_id: Option<String>,
}

#[handler]
pub async fn list(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Query(query): Query<ListQuery>,
) -> poem::Result<Response> {
    let scope = query.scope.as_deref().unwrap_or("personal");
    let options = match scope {
        "all" => {
            if !services
                .permissions
                .user_has_permission(&user.user_id, PERM_SESSION_VIEW_ALL)
                .await?
            {
                return Err(ShellgateError::PermissionDenied.into());
            }
            ListActiveOptions {
                user_id: user.user_id,
                include_all: true,
                include_teams: false,
                team_ids: vec![],
            }
        }
        "team" => {
            let mut team_ids = services.permissions.team_ids_for_user(&user.user_id).await?;
            if let Some(team_id) = query.team_id {
                if !team_ids.contains(&team_id)
                    && !services
                        .permissions
                        .user_has_permission(&user.user_id, PERM_SESSION_VIEW_TEAM)
                        .await?
                {
                    return Err(ShellgateError::PermissionDenied.into());
                }
                team_ids = vec![team_id];
            }
            ListActiveOptions {
                user_id: user.user_id,
                include_all: false,
                include_teams: true,
                team_ids,
            }
        }
        _ => ListActiveOptions {
            user_id: user.user_id,
            include_all: false,
            include_teams: false,
            team_ids: vec![],
        },
    };

    let sessions = services.registry.list_active(&options).await;
    let mut snapshots = Vec::with_capacity(sessions.len());
    for session in sessions {
        let guard = session.lock().await;
        if let Some(protocol_id) = &query.protocol_id {
            if guard.protocol_id != *protocol_id {
                continue;
            }
        }
        snapshots.push(ActiveSessionSnapshot::from(&*guard));
    }
    snapshots.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(api_ok(snapshots))
}
