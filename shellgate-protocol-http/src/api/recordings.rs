use poem::http::StatusCode;
use poem::web::{Data, Path, Query};
use poem::{handler, Body, Response};
use serde::Deserialize;
use serde_json::json;
use shellgate_common::{SessionMetadata, ShellgateError};
use shellgate_core::permissions::{PERM_RECORDING_DELETE, PERM_RECORDING_VIEW};
use shellgate_core::recordings::{ListRecordingsOptions, RecordingScope};
use shellgate_core::Services;
use shellgate_db_entities::ConnectionSession;
use sea_orm::EntityTrait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::envelope::{api_ok, api_ok_meta, Meta};
use crate::range::parse_range;

#[handler]
pub async fn status(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
) -> poem::Result<Response> {
    let row = services
        .lifecycle
        .authorize_session_access(&session_id, &user.user_id)
        .await?;

    let live = services.recordings.status(&session_id).await;
    let record = services.recordings.latest_artifact(&session_id).await?;
    let metadata: SessionMetadata =
        serde_json::from_value(row.metadata).map_err(ShellgateError::from)?;

    let body = match live {
        Some(status) => json!({
            "active": status.active,
            "session_id": session_id,
            "started_at": status.started_at,
            "last_event_at": status.last_event_at,
            "bytes_recorded": status.bytes_recorded,
            "recording_mode": status.recording_mode,
            "record": record,
        }),
        None => json!({
            "active": false,
            "session_id": session_id,
            "started_at": null,
            "last_event_at": null,
            "bytes_recorded": 0,
            "recording_mode": metadata.recording_policy.mode,
            "record": record,
        }),
    };
    Ok(api_ok(body))
}

#[handler]
pub async fn stop(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
) -> poem::Result<Response> {
    let row = services
        .lifecycle
        .authorize_session_access(&session_id, &user.user_id)
        .await?;
    if row.owner_user_id != user.user_id
        && !services
            .permissions
            .user_has_permission(&user.user_id, PERM_RECORDING_VIEW)
            .await?
    {
        return Err(ShellgateError::PermissionDenied.into());
    }

    let artifact = services
        .recordings
        .stop(&session_id, "stopped_by_user")
        .await
        .map_err(ShellgateError::from)?
        .ok_or(ShellgateError::RecordingUnavailable)?;
    Ok(api_ok(artifact))
}

#[derive(Deserialize)]
struct ListQuery {
    scope: Option<String>,
    sort: Option<String>,
    page: Option<u64>,
    per_page: Option<u64>,
}

#[handler]
pub async fn list(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Query(query): Query<ListQuery>,
) -> poem::Result<Response> {
    let scope = match query.scope.as_deref().unwrap_or("personal") {
        "all" => {
            if !services
                .permissions
                .user_has_permission(&user.user_id, PERM_RECORDING_VIEW)
                .await?
            {
                return Err(ShellgateError::PermissionDenied.into());
            }
            RecordingScope::All
        }
        "team" => RecordingScope::Team,
        _ => RecordingScope::Personal,
    };

    let team_ids = services.permissions.team_ids_for_user(&user.user_id).await?;
    let page = query.page.unwrap_or(0);
    let per_page = query.per_page.unwrap_or(20);
    let (items, total) = services
        .recordings
        .list(&ListRecordingsOptions {
            user_id: user.user_id,
            scope,
            team_ids,
            page,
            per_page,
            sort_desc: query.sort.as_deref() != Some("started_at"),
        })
        .await?;
    Ok(api_ok_meta(items, Meta::new(page, per_page, total)))
}

/// Authorising artifact access goes through the owning session row.
async fn authorize_record_access(
    services: &Services,
    user: &CurrentUser,
    record_id: &Uuid,
) -> Result<(shellgate_db_entities::RecordingArtifact::Model, std::path::PathBuf), ShellgateError>
{
    let (artifact, path) = services.recordings.get(record_id).await?;
    let session = {
        let db = services.db.lock().await;
        ConnectionSession::Entity::find_by_id(artifact.session_id)
            .one(&*db)
            .await?
    };
    let owns = session
        .map(|s| s.owner_user_id == user.user_id)
        .unwrap_or(false);
    if !owns
        && !services
            .permissions
            .user_has_permission(&user.user_id, PERM_RECORDING_VIEW)
            .await?
    {
        return Err(ShellgateError::PermissionDenied);
    }
    Ok((artifact, path))
}

/// Serves the gzip artifact, honouring single `Range: bytes=...` requests
/// with 206 responses.
#[handler]
pub async fn download(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(record_id): Path<Uuid>,
    req: &poem::Request,
) -> poem::Result<Response> {
    let (artifact, path) = authorize_record_access(services, &user, &record_id).await?;
    let size = artifact.size_bytes as u64;
    let filename = format!("session-{}.cast.gz", artifact.session_id);

    let range_header = req
        .headers()
        .get(http::header::RANGE)
        .and_then(|v| v.to_str().ok());

    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(ShellgateError::from)?;

    let response = match range_header {
        Some(header) => {
            let range = parse_range(header, size).map_err(|e| {
                poem::Error::from(e)
            })?;
            file.seek(std::io::SeekFrom::Start(range.start))
                .await
                .map_err(ShellgateError::from)?;
            let mut buf = vec![0u8; range.len() as usize];
            file.read_exact(&mut buf)
                .await
                .map_err(ShellgateError::from)?;
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(http::header::CONTENT_TYPE, "application/gzip")
                .header(http::header::ACCEPT_RANGES, "bytes")
                .header(http::header::CONTENT_RANGE, range.content_range(size))
                .header(
                    http::header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{filename}\""),
                )
                .body(Body::from(buf))
        }
        None => Response::builder()
            .header(http::header::CONTENT_TYPE, "application/gzip")
            .header(http::header::ACCEPT_RANGES, "bytes")
            .header(http::header::CONTENT_LENGTH, size)
            .header(
                http::header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            )
            .body(Body::from_async_read(file)),
    };
    Ok(response)
}

#[handler]
pub async fn delete(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(record_id): Path<Uuid>,
) -> poem::Result<Response> {
    if !services
        .permissions
        .user_has_permission(&user.user_id, PERM_RECORDING_DELETE)
        .await?
    {
        return Err(ShellgateError::PermissionDenied.into());
    }
    services.recordings.delete(&record_id).await?;
    Ok(api_ok(json!({"deleted": true})))
}
