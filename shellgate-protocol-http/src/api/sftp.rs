use bytes::Bytes;
use poem::web::{Data, Json, Path, Query};
use poem::{handler, Body, Response};
use serde::Deserialize;
use serde_json::json;
use shellgate_common::protocols::{SftpEntry, SftpError};
use shellgate_common::ShellgateError;
use shellgate_core::consts::STREAM_SFTP_TRANSFERS;
use shellgate_core::permissions::PERM_SSH_SFTP;
use shellgate_core::{Services, SftpLease};
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::envelope::{api_created, api_ok};
use crate::sftp_path::sanitize_path;

const MAX_READ_BYTES: u64 = 2 * 1024 * 1024;
const MAX_UPLOAD_CHUNK: usize = 8 * 1024 * 1024;
const MAX_DOWNLOAD_BYTES: u64 = 64 * 1024 * 1024;

const UPLOAD_OFFSET_HEADER: &str = "Upload-Offset";

/// All file operations require session access plus the SFTP permission
/// on the session's connection.
async fn borrow_channel(
    services: &Services,
    user: &CurrentUser,
    session_id: &Uuid,
) -> Result<SftpLease, ShellgateError> {
    let row = services
        .lifecycle
        .authorize_session_access(session_id, &user.user_id)
        .await?;
    let allowed = row.owner_user_id == user.user_id
        || services
            .permissions
            .user_has_resource_permission(
                &user.user_id,
                "connection",
                &row.connection_id,
                PERM_SSH_SFTP,
            )
            .await?;
    if !allowed {
        return Err(ShellgateError::PermissionDenied);
    }
    Ok(services.sftp_channels.borrow(session_id).await?)
}

#[derive(Deserialize)]
struct PathQuery {
    path: Option<String>,
}

#[handler]
pub async fn list(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Query(query): Query<PathQuery>,
) -> poem::Result<Response> {
    let path = sanitize_path(query.path.as_deref().unwrap_or("")).map_err(ShellgateError::from)?;
    let lease = borrow_channel(services, &user, &session_id).await?;
    let mut entries = lease
        .client()
        .read_dir(&path)
        .await
        .map_err(ShellgateError::from)?;
    // Directories first, then case-insensitive by name.
    entries.sort_by(|a: &SftpEntry, b: &SftpEntry| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    Ok(api_ok(entries))
}

#[handler]
pub async fn metadata(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Query(query): Query<PathQuery>,
) -> poem::Result<Response> {
    let path = sanitize_path(query.path.as_deref().unwrap_or("")).map_err(ShellgateError::from)?;
    let lease = borrow_channel(services, &user, &session_id).await?;
    let entry = lease
        .client()
        .metadata(&path)
        .await
        .map_err(ShellgateError::from)?;
    Ok(api_ok(entry))
}

#[derive(Deserialize)]
struct ReadQuery {
    path: String,
    offset: Option<u64>,
    length: Option<u64>,
}

#[handler]
pub async fn read(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Query(query): Query<ReadQuery>,
) -> poem::Result<Response> {
    let path = sanitize_path(&query.path).map_err(ShellgateError::from)?;
    let length = query.length.unwrap_or(MAX_READ_BYTES);
    if length > MAX_READ_BYTES {
        return Err(ShellgateError::from(SftpError::FileTooLarge).into());
    }

    let lease = borrow_channel(services, &user, &session_id).await?;
    let entry = lease
        .client()
        .metadata(&path)
        .await
        .map_err(ShellgateError::from)?;
    let offset = query.offset.unwrap_or(0);
    if offset > entry.size {
        return Err(ShellgateError::from(SftpError::RangeInvalid).into());
    }
    if query.length.is_none() && entry.size > MAX_READ_BYTES {
        return Err(ShellgateError::from(SftpError::FileTooLarge).into());
    }

    let data = lease
        .client()
        .read(&path, offset, length)
        .await
        .map_err(ShellgateError::from)?;
    Ok(api_ok(json!({
        "path": path,
        "offset": offset,
        "size": entry.size,
        "content": String::from_utf8_lossy(&data),
    })))
}

#[derive(Deserialize)]
struct SaveRequest {
    path: String,
    content: String,
}

#[handler]
pub async fn save(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Json(body): Json<SaveRequest>,
) -> poem::Result<Response> {
    let path = sanitize_path(&body.path).map_err(ShellgateError::from)?;
    if body.content.len() > MAX_UPLOAD_CHUNK {
        return Err(ShellgateError::from(SftpError::UploadTooLarge).into());
    }
    let lease = borrow_channel(services, &user, &session_id).await?;
    let written = lease
        .client()
        .write(&path, 0, Bytes::from(body.content.into_bytes()))
        .await
        .map_err(ShellgateError::from)?;
    Ok(api_ok(json!({"path": path, "size": written})))
}

#[derive(Deserialize)]
struct UploadQuery {
    path: String,
}

/// Resumable upload: the raw request body is written at the offset given
/// in the `Upload-Offset` header; the response carries the next offset.
#[handler]
pub async fn upload(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Query(query): Query<UploadQuery>,
    body: Body,
    req: &poem::Request,
) -> poem::Result<Response> {
    let path = sanitize_path(&query.path).map_err(ShellgateError::from)?;
    let offset: u64 = req
        .headers()
        .get(UPLOAD_OFFSET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.parse())
        .transpose()
        .map_err(|_| ShellgateError::BadRequest("invalid Upload-Offset".into()))?
        .unwrap_or(0);

    let data = body
        .into_bytes_limit(MAX_UPLOAD_CHUNK)
        .await
        .map_err(|_| ShellgateError::from(SftpError::UploadTooLarge))?;

    let lease = borrow_channel(services, &user, &session_id).await?;
    let written = lease
        .client()
        .write(&path, offset, data)
        .await
        .map_err(ShellgateError::from)?;

    services
        .hub
        .broadcast(
            STREAM_SFTP_TRANSFERS,
            "upload_progress",
            json!({"session_id": session_id, "path": path, "offset": written}),
        )
        .await;

    Ok(Response::builder()
        .status(poem::http::StatusCode::CREATED)
        .header(UPLOAD_OFFSET_HEADER, written)
        .content_type("application/json")
        .body(
            json!({"success": true, "data": {"path": path, "bytes_written": written}})
                .to_string(),
        ))
}

#[handler]
pub async fn download(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Query(query): Query<ReadQuery>,
) -> poem::Result<Response> {
    let path = sanitize_path(&query.path).map_err(ShellgateError::from)?;
    let lease = borrow_channel(services, &user, &session_id).await?;
    let entry = lease
        .client()
        .metadata(&path)
        .await
        .map_err(ShellgateError::from)?;
    if entry.is_dir {
        return Err(ShellgateError::BadRequest("cannot download a directory".into()).into());
    }
    if entry.size > MAX_DOWNLOAD_BYTES {
        return Err(ShellgateError::from(SftpError::FileTooLarge).into());
    }

    let data = lease
        .client()
        .read(&path, 0, entry.size.max(1))
        .await
        .map_err(ShellgateError::from)?;

    services
        .hub
        .broadcast(
            STREAM_SFTP_TRANSFERS,
            "download",
            json!({"session_id": session_id, "path": path, "size": data.len()}),
        )
        .await;

    Ok(Response::builder()
        .header(http::header::CONTENT_TYPE, "application/octet-stream")
        .header(
            http::header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", entry.name),
        )
        .body(Body::from(data.to_vec())))
}

#[derive(Deserialize)]
struct RenameRequest {
    from: String,
    to: String,
}

#[handler]
pub async fn rename(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Json(body): Json<RenameRequest>,
) -> poem::Result<Response> {
    let from = sanitize_path(&body.from).map_err(ShellgateError::from)?;
    let to = sanitize_path(&body.to).map_err(ShellgateError::from)?;
    let lease = borrow_channel(services, &user, &session_id).await?;
    lease
        .client()
        .rename(&from, &to)
        .await
        .map_err(ShellgateError::from)?;
    Ok(api_ok(json!({"from": from, "to": to})))
}

#[handler]
pub async fn delete_file(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Query(query): Query<PathQuery>,
) -> poem::Result<Response> {
    let path = sanitize_path(query.path.as_deref().unwrap_or("")).map_err(ShellgateError::from)?;
    let lease = borrow_channel(services, &user, &session_id).await?;
    lease
        .client()
        .remove_file(&path)
        .await
        .map_err(ShellgateError::from)?;
    Ok(api_ok(json!({"deleted": path})))
}

#[derive(Deserialize)]
struct CreateDirRequest {
    path: String,
}

#[handler]
pub async fn create_dir(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Json(body): Json<CreateDirRequest>,
) -> poem::Result<Response> {
    let path = sanitize_path(&body.path).map_err(ShellgateError::from)?;
    let lease = borrow_channel(services, &user, &session_id).await?;
    lease
        .client()
        .create_dir(&path)
        .await
        .map_err(ShellgateError::from)?;
    Ok(api_created(json!({"created": path})))
}

#[handler]
pub async fn delete_dir(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Query(query): Query<PathQuery>,
) -> poem::Result<Response> {
    let path = sanitize_path(query.path.as_deref().unwrap_or("")).map_err(ShellgateError::from)?;
    let lease = borrow_channel(services, &user, &session_id).await?;
    lease
        .client()
        .remove_dir(&path)
        .await
        .map_err(ShellgateError::from)?;
    Ok(api_ok(json!({"deleted": path})))
}
