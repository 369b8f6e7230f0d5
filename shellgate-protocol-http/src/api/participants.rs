use chrono::Utc;
use poem::web::{Data, Json, Path};
use poem::{handler, Response};
use serde::Deserialize;
use shellgate_common::{AccessMode, ShellgateError};
use shellgate_core::permissions::{PERM_SESSION_SHARE, PERM_SSH_GRANT_WRITE};
use shellgate_core::{Participant, ParticipantSnapshot, Services};
use serde_json::json;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::common::display_name;
use crate::envelope::{api_created, api_ok};

async fn ensure_share_rights(
    services: &Services,
    session_id: &Uuid,
    caller: &CurrentUser,
) -> Result<(), ShellgateError> {
    let row = services
        .lifecycle
        .authorize_session_access(session_id, &caller.user_id)
        .await?;
    if row.owner_user_id == caller.user_id {
        return Ok(());
    }
    if services
        .permissions
        .user_has_permission(&caller.user_id, PERM_SESSION_SHARE)
        .await?
    {
        return Ok(());
    }
    Err(ShellgateError::PermissionDenied)
}

#[derive(Deserialize)]
struct AddParticipantRequest {
    user_id: Uuid,
    access_mode: Option<AccessMode>,
    consented_to_recording: Option<bool>,
}

#[handler]
pub async fn add(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    Json(body): Json<AddParticipantRequest>,
) -> poem::Result<Response> {
    ensure_share_rights(services, &session_id, &user).await?;

    let access_mode = body.access_mode.unwrap_or(AccessMode::Read);
    if access_mode == AccessMode::Write {
        let row = services
            .lifecycle
            .authorize_session_access(&session_id, &user.user_id)
            .await?;
        let may_grant = row.owner_user_id == user.user_id
            || services
                .permissions
                .user_has_resource_permission(
                    &user.user_id,
                    "connection",
                    &row.connection_id,
                    PERM_SSH_GRANT_WRITE,
                )
                .await?;
        if !may_grant {
            return Err(ShellgateError::PermissionDenied.into());
        }
    }

    let participant = services
        .lifecycle
        .add_participant(
            &session_id,
            Participant {
                user_id: body.user_id,
                display_name: display_name(services, &body.user_id).await,
                access_mode,
                joined_at: Utc::now(),
                consented_to_recording: body.consented_to_recording.unwrap_or(false),
                granted_by: Some(user.user_id),
            },
            &user.user_id,
        )
        .await?;
    Ok(api_created(ParticipantSnapshot::from(&participant)))
}

#[handler]
pub async fn remove(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path((session_id, target)): Path<(Uuid, Uuid)>,
) -> poem::Result<Response> {
    // Leaving is always allowed; removing someone else needs share
    // rights.
    if target != user.user_id {
        ensure_share_rights(services, &session_id, &user).await?;
    } else {
        services
            .lifecycle
            .authorize_session_access(&session_id, &user.user_id)
            .await?;
    }
    services
        .lifecycle
        .remove_participant(&session_id, &target, &user.user_id)
        .await?;
    Ok(api_ok(json!({"removed": true})))
}

#[handler]
pub async fn grant_write(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path((session_id, target)): Path<(Uuid, Uuid)>,
) -> poem::Result<Response> {
    let row = services
        .lifecycle
        .authorize_session_access(&session_id, &user.user_id)
        .await?;
    let may_grant = row.owner_user_id == user.user_id
        || services
            .permissions
            .user_has_resource_permission(
                &user.user_id,
                "connection",
                &row.connection_id,
                PERM_SSH_GRANT_WRITE,
            )
            .await?;
    if !may_grant {
        return Err(ShellgateError::PermissionDenied.into());
    }

    services
        .lifecycle
        .grant_write(&session_id, &target, &user.user_id)
        .await?;
    Ok(api_ok(json!({"write_holder": target})))
}

#[handler]
pub async fn relinquish_write(
    Data(services): Data<&Services>,
    user: CurrentUser,
    Path((session_id, target)): Path<(Uuid, Uuid)>,
) -> poem::Result<Response> {
    let row = services
        .lifecycle
        .authorize_session_access(&session_id, &user.user_id)
        .await?;
    // Only the holder themselves or the owner may force a release.
    if target != user.user_id && row.owner_user_id != user.user_id {
        return Err(ShellgateError::PermissionDenied.into());
    }

    let new_holder = services.lifecycle.relinquish_write(&session_id, &target).await?;
    Ok(api_ok(json!({"write_holder": new_holder})))
}
