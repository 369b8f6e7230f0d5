use chrono::{DateTime, Utc};
use poem::web::{Data, Json, Path, Query};
use poem::{handler, Response};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use serde::Deserialize;
use shellgate_common::ShellgateError;
use shellgate_core::{ChatMessageSnapshot, Services};
use shellgate_db_entities::ChatMessage;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::envelope::{api_created, api_ok};

const DEFAULT_HISTORY_LIMIT: u64 = 50;
const MAX_HISTORY_LIMIT: u64 = 200;

#[derive(Deserialize)]
struct PostMessageRequest {
    content: String,
}

#[handler]
pub async fn post_message(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Json(body): Json<PostMessageRequest>,
) -> poem::Result<Response> {
    if body.content.trim().is_empty() {
        return Err(ShellgateError::BadRequest("empty message".into()).into());
    }

    services
        .lifecycle
        .authorize_session_access(&session_id, &user.user_id)
        .await?;
    let active = services
        .registry
        .get_session(&session_id)
        .await
        .ok_or(ShellgateError::SessionNotFound(session_id))?;
    if !active.lock().await.is_participant(&user.user_id) {
        return Err(ShellgateError::SessionAccessDenied.into());
    }

    // Commit to the ring (and broadcast), then persist the same entry.
    let entry = services
        .registry
        .append_chat_message(&session_id, user.user_id, body.content)
        .await?;

    {
        use sea_orm::ActiveValue::Set;
        let db = services.db.lock().await;
        ChatMessage::ActiveModel {
            id: Set(entry.id),
            session_id: Set(session_id),
            author_user_id: Set(entry.author_user_id),
            content: Set(entry.content.clone()),
            created_at: Set(entry.created_at),
        }
        .insert(&*db)
        .await
        .map_err(ShellgateError::from)?;
    }

    Ok(api_created(ChatMessageSnapshot::from_entry(
        session_id, &entry,
    )))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<u64>,
    before: Option<DateTime<Utc>>,
}

/// Chat history survives session close; this reads the persisted table,
/// newest-last.
#[handler]
pub async fn history(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> poem::Result<Response> {
    services
        .lifecycle
        .authorize_session_access(&session_id, &user.user_id)
        .await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let mut find = ChatMessage::Entity::find()
        .filter(ChatMessage::Column::SessionId.eq(session_id))
        .order_by_desc(ChatMessage::Column::CreatedAt)
        .limit(limit);
    if let Some(before) = query.before {
        find = find.filter(ChatMessage::Column::CreatedAt.lt(before));
    }

    let mut messages = {
        let db = services.db.lock().await;
        find.all(&*db).await.map_err(ShellgateError::from)?
    };
    messages.reverse();
    let snapshots: Vec<ChatMessageSnapshot> = messages.into_iter().map(Into::into).collect();
    Ok(api_ok(snapshots))
}
