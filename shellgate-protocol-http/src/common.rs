use sea_orm::EntityTrait;
use shellgate_common::protocols::TerminalSize;
use shellgate_common::{RecordingPolicySnapshot, SessionMetadata, ShellgateError};
use shellgate_core::permissions::PERM_CONNECTION_VIEW;
use shellgate_core::{MaterializedConfig, Services};
use shellgate_db_entities::{Connection, User};
use uuid::Uuid;

/// Loads a connection the user is allowed to see: their own, their
/// team's, or one they hold `connection.view` on.
pub async fn get_visible_connection(
    services: &Services,
    user_id: &Uuid,
    connection_id: &Uuid,
) -> Result<Connection::Model, ShellgateError> {
    let connection = {
        let db = services.db.lock().await;
        Connection::Entity::find_by_id(*connection_id)
            .one(&*db)
            .await?
            .ok_or(ShellgateError::ConnectionNotFound(*connection_id))?
    };

    if connection.owner_user_id == *user_id {
        return Ok(connection);
    }
    if let Some(team_id) = connection.team_id {
        if services.permissions.is_team_member(user_id, &team_id).await? {
            return Ok(connection);
        }
    }
    if services
        .permissions
        .user_has_resource_permission(user_id, "connection", connection_id, PERM_CONNECTION_VIEW)
        .await?
    {
        return Ok(connection);
    }
    // Do not leak existence to unauthorised callers.
    Err(ShellgateError::ConnectionNotFound(*connection_id))
}

/// Launch requires `connection.launch` and `protocol:ssh.connect` on the
/// connection resource; owners launch their own connections freely.
pub async fn ensure_launch_permissions(
    services: &Services,
    user_id: &Uuid,
    connection: &Connection::Model,
) -> Result<(), ShellgateError> {
    use shellgate_core::permissions::{PERM_CONNECTION_LAUNCH, PERM_SSH_CONNECT};

    if connection.owner_user_id == *user_id {
        return Ok(());
    }
    for permission in [PERM_CONNECTION_LAUNCH, PERM_SSH_CONNECT] {
        if !services
            .permissions
            .user_has_resource_permission(user_id, "connection", &connection.id, permission)
            .await?
        {
            return Err(ShellgateError::PermissionDenied);
        }
    }
    Ok(())
}

pub async fn load_user(
    services: &Services,
    user_id: &Uuid,
) -> Result<User::Model, ShellgateError> {
    let db = services.db.lock().await;
    User::Entity::find_by_id(*user_id)
        .one(&*db)
        .await?
        .ok_or(ShellgateError::Unauthorized)
}

pub async fn display_name(services: &Services, user_id: &Uuid) -> String {
    match load_user(services, user_id).await {
        Ok(user) if !user.display_name.is_empty() => user.display_name,
        Ok(user) => user.username,
        Err(_) => user_id.to_string(),
    }
}

/// Effective concurrent-session limit: the most permissive of the
/// per-connection setting, the per-user policy and the system default,
/// where 0 means unlimited.
pub fn effective_concurrent_limit(
    connection_limit: Option<i32>,
    user_limit: Option<i32>,
    system_default: u32,
) -> u32 {
    let mut sources = vec![system_default];
    if let Some(limit) = connection_limit {
        sources.push(limit.max(0) as u32);
    }
    if let Some(limit) = user_limit {
        sources.push(limit.max(0) as u32);
    }
    if sources.iter().any(|&l| l == 0) {
        return 0;
    }
    sources.into_iter().max().unwrap_or(0)
}

/// Freezes the launch-time session metadata: recording policy snapshot,
/// effective recording/SFTP switches, terminal size and the template
/// outcome.
pub async fn build_session_metadata(
    services: &Services,
    connection: &Connection::Model,
    config: &MaterializedConfig,
    recording_requested: bool,
    terminal: TerminalSize,
) -> SessionMetadata {
    let app_config = services.config.lock().await;
    let policy = RecordingPolicySnapshot::from(&app_config.recordings);
    let recording_enabled = policy.should_record(recording_requested);
    let sftp_enabled = connection
        .enable_sftp
        .unwrap_or(app_config.sessions.enable_sftp_default);
    let capabilities = services
        .drivers
        .capabilities(&connection.protocol_id)
        .map(|caps| {
            let mut out = vec![];
            if caps.terminal {
                out.push("terminal".to_owned());
            }
            if caps.file_transfer && sftp_enabled {
                out.push("file_transfer".to_owned());
            }
            if caps.session_recording {
                out.push("session_recording".to_owned());
            }
            out
        })
        .unwrap_or_default();

    SessionMetadata {
        recording_policy: policy,
        recording_enabled,
        sftp_enabled,
        terminal,
        template: config.template.clone(),
        capabilities,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_takes_maximum_of_sources() {
        assert_eq!(effective_concurrent_limit(Some(2), Some(5), 3), 5);
        assert_eq!(effective_concurrent_limit(None, None, 3), 3);
        assert_eq!(effective_concurrent_limit(Some(7), None, 3), 7);
    }

    #[test]
    fn zero_means_unlimited_and_wins() {
        assert_eq!(effective_concurrent_limit(Some(0), Some(5), 3), 0);
        assert_eq!(effective_concurrent_limit(None, Some(2), 0), 0);
        assert_eq!(effective_concurrent_limit(None, None, 0), 0);
    }

    #[test]
    fn negative_overrides_clamp_to_zero() {
        assert_eq!(effective_concurrent_limit(Some(-1), None, 3), 0);
    }
}
