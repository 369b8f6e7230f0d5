use bytes::Bytes;
use chrono::Utc;
use poem::web::{Data, Json, Path, Query};
use poem::{handler, Response};
use sea_orm::{ActiveModelTrait, ColumnTrait, Condition, EntityTrait, QueryFilter, QueryOrder};
use serde::Deserialize;
use serde_json::json;
use shellgate_common::ShellgateError;
use shellgate_core::permissions::PERM_SNIPPET_MANAGE;
use shellgate_core::Services;
use shellgate_db_entities::Snippet::{self, SnippetScope};
use tracing::*;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::envelope::{api_accepted, api_created, api_ok};

#[derive(Deserialize)]
struct ListQuery {
    connection_id: Option<Uuid>,
}

/// Global snippets, the caller's own, and those scoped to the requested
/// connection.
#[handler]
pub async fn list(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Query(query): Query<ListQuery>,
) -> poem::Result<Response> {
    let mut condition = Condition::any()
        .add(Snippet::Column::Scope.eq(SnippetScope::Global))
        .add(
            Condition::all()
                .add(Snippet::Column::Scope.eq(SnippetScope::User))
                .add(Snippet::Column::OwnerUserId.eq(user.user_id)),
        );
    if let Some(connection_id) = query.connection_id {
        condition = condition.add(
            Condition::all()
                .add(Snippet::Column::Scope.eq(SnippetScope::Connection))
                .add(Snippet::Column::ConnectionId.eq(connection_id)),
        );
    }

    let snippets = {
        let db = services.db.lock().await;
        Snippet::Entity::find()
            .filter(condition)
            .order_by_asc(Snippet::Column::Name)
            .all(&*db)
            .await
            .map_err(ShellgateError::from)?
    };
    Ok(api_ok(snippets))
}

#[derive(Deserialize)]
struct CreateSnippetRequest {
    name: String,
    #[serde(default)]
    description: String,
    command: String,
    scope: SnippetScope,
    connection_id: Option<Uuid>,
}

#[handler]
pub async fn create(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Json(body): Json<CreateSnippetRequest>,
) -> poem::Result<Response> {
    if body.name.trim().is_empty() || body.command.is_empty() {
        return Err(ShellgateError::BadRequest("name and command are required".into()).into());
    }
    // User-scoped snippets are self-service; wider scopes need the
    // manage permission.
    if body.scope != SnippetScope::User
        && !services
            .permissions
            .user_has_permission(&user.user_id, PERM_SNIPPET_MANAGE)
            .await?
    {
        return Err(ShellgateError::PermissionDenied.into());
    }
    if body.scope == SnippetScope::Connection && body.connection_id.is_none() {
        return Err(
            ShellgateError::BadRequest("connection scope requires connection_id".into()).into(),
        );
    }

    use sea_orm::ActiveValue::Set;
    let model = Snippet::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(body.name),
        description: Set(body.description),
        command: Set(body.command),
        scope: Set(body.scope),
        owner_user_id: Set((body.scope == SnippetScope::User).then_some(user.user_id)),
        connection_id: Set(body.connection_id),
        updated_at: Set(Utc::now()),
    };
    let snippet = {
        let db = services.db.lock().await;
        model.insert(&*db).await.map_err(ShellgateError::from)?
    };
    Ok(api_created(snippet))
}

#[handler]
pub async fn delete(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(snippet_id): Path<Uuid>,
) -> poem::Result<Response> {
    let snippet = {
        let db = services.db.lock().await;
        Snippet::Entity::find_by_id(snippet_id)
            .one(&*db)
            .await
            .map_err(ShellgateError::from)?
            .ok_or_else(|| ShellgateError::NotFound("snippet".into()))?
    };
    let owns = snippet.owner_user_id == Some(user.user_id);
    if !owns
        && !services
            .permissions
            .user_has_permission(&user.user_id, PERM_SNIPPET_MANAGE)
            .await?
    {
        return Err(ShellgateError::PermissionDenied.into());
    }
    {
        let db = services.db.lock().await;
        Snippet::Entity::delete_by_id(snippet_id)
            .exec(&*db)
            .await
            .map_err(ShellgateError::from)?;
    }
    Ok(api_ok(json!({"deleted": true})))
}

#[derive(Deserialize)]
struct ExecuteSnippetRequest {
    snippet_id: Uuid,
}

/// Writes the snippet's command (plus newline) into the session's stdin.
/// Only the current write holder may inject input.
#[handler]
pub async fn execute(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Json(body): Json<ExecuteSnippetRequest>,
) -> poem::Result<Response> {
    let row = services
        .lifecycle
        .authorize_session_access(&session_id, &user.user_id)
        .await?;

    let active = services
        .registry
        .get_session(&session_id)
        .await
        .ok_or(ShellgateError::SessionNotFound(session_id))?;
    if !active.lock().await.holds_write(&user.user_id) {
        return Err(ShellgateError::PermissionDenied.into());
    }

    let snippet = {
        let db = services.db.lock().await;
        Snippet::Entity::find_by_id(body.snippet_id)
            .one(&*db)
            .await
            .map_err(ShellgateError::from)?
            .ok_or_else(|| ShellgateError::NotFound("snippet".into()))?
    };
    let visible = match snippet.scope {
        SnippetScope::Global => true,
        SnippetScope::User => snippet.owner_user_id == Some(user.user_id),
        SnippetScope::Connection => snippet.connection_id == Some(row.connection_id),
    };
    if !visible {
        return Err(ShellgateError::NotFound("snippet".into()).into());
    }

    let handle = services
        .registry
        .peek_handle(&session_id)
        .await
        .ok_or(ShellgateError::HandleUnavailable)?;

    let mut command = snippet.command.into_bytes();
    command.push(b'\n');
    handle
        .write_stdin(Bytes::from(command))
        .await
        .map_err(ShellgateError::from)?;

    info!(%session_id, user_id=%user.user_id, snippet_id=%body.snippet_id, "Snippet executed");
    Ok(api_accepted(json!({"executed": true})))
}
