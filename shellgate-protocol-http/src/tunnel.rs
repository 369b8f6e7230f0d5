use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use data_encoding::BASE64;
use futures::SinkExt;
use poem::web::websocket::{Message, WebSocketStream};
use serde::Deserialize;
use shellgate_common::protocols::{
    HandleError, LaunchParams, SessionHandle, SftpProvider, TerminalSize, PROTOCOL_SSH,
};
use shellgate_common::{SessionId, SessionMetadata, ShellgateError};
use shellgate_core::consts::{STREAM_CONNECTION_SESSIONS, STREAM_SSH_TERMINAL};
use shellgate_core::recordings::TerminalStream;
use shellgate_core::{CloseSessionParams, Services, StartSessionParams};
use shellgate_db_entities::ConnectionSession::SessionStatus;
use tokio::sync::mpsc::Receiver;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::*;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::bridge::{BridgeEvents, BridgeParams, BridgeStream, TerminalBridge};
use crate::common::{
    build_session_metadata, display_name, effective_concurrent_limit, ensure_launch_permissions,
    get_visible_connection, load_user,
};

const CLEANUP_STEP_TIMEOUT: Duration = Duration::from_secs(5);
const TAP_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
pub struct TunnelQuery {
    pub tunnel: Option<String>,
    pub connection_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub cols: Option<u32>,
    pub rows: Option<u32>,
    pub recording_enabled: Option<bool>,
    pub streams: Option<String>,
}

impl TunnelQuery {
    fn terminal_size(&self) -> TerminalSize {
        match (self.cols, self.rows) {
            (Some(cols), Some(rows)) if cols > 0 && rows > 0 => TerminalSize { cols, rows },
            _ => TerminalSize::default(),
        }
    }
}

pub struct PreparedTunnel {
    session_id: SessionId,
    connection_id: Uuid,
    user_id: Uuid,
    handle: Arc<GatedSessionHandle>,
    /// The launching tunnel owns driver teardown; participant tunnels
    /// only ever close their own socket.
    primary: bool,
}

/// Everything that must succeed before the HTTP request is upgraded:
/// authorization, credential resolution, session start and the driver
/// launch. Failures here surface as plain HTTP errors.
pub async fn prepare(
    services: &Services,
    user: &CurrentUser,
    query: &TunnelQuery,
) -> Result<PreparedTunnel, ShellgateError> {
    let user_id = user.user_id;

    // A pre-launched session id takes precedence; it must belong to the
    // caller or the caller must already be a participant.
    if let Some(session_id) = query.session_id {
        let row = services
            .lifecycle
            .authorize_session_access(&session_id, &user_id)
            .await?;
        if row.status.is_terminal() {
            return Err(ShellgateError::TunnelUnavailable);
        }
        if let Some(connection_id) = query.connection_id {
            if row.connection_id != connection_id {
                return Err(ShellgateError::BadRequest(
                    "session does not belong to this connection".into(),
                ));
            }
        }

        // A live handle means the session is already bridged; this
        // tunnel joins as a viewer/writer instead of launching again.
        if let Some(handle) = services.registry.peek_handle(&session_id).await {
            return prepare_secondary(services, user_id, session_id, row.connection_id, handle)
                .await;
        }

        if row.owner_user_id != user_id {
            return Err(ShellgateError::SessionAccessDenied);
        }
        let connection = get_visible_connection(services, &user_id, &row.connection_id).await?;
        let metadata: SessionMetadata = serde_json::from_value(row.metadata.clone())?;
        return prepare_primary(
            services,
            user_id,
            connection,
            metadata,
            Some(session_id),
        )
        .await;
    }

    let connection_id = query
        .connection_id
        .ok_or_else(|| ShellgateError::BadRequest("connection_id or session_id required".into()))?;
    let connection = get_visible_connection(services, &user_id, &connection_id).await?;
    let config = services.templates.materialize(&connection);
    let metadata = build_session_metadata(
        services,
        &connection,
        &config,
        query.recording_enabled.unwrap_or(false),
        query.terminal_size(),
    )
    .await;
    prepare_primary(services, user_id, connection, metadata, None).await
}

async fn prepare_primary(
    services: &Services,
    user_id: Uuid,
    connection: shellgate_db_entities::Connection::Model,
    metadata: SessionMetadata,
    pre_launched: Option<SessionId>,
) -> Result<PreparedTunnel, ShellgateError> {
    if connection.protocol_id != PROTOCOL_SSH {
        return Err(ShellgateError::HandleIncompatible);
    }

    ensure_launch_permissions(services, &user_id, &connection).await?;

    let config = services.templates.materialize(&connection);

    let identity_id = connection
        .identity_id
        .ok_or(ShellgateError::IdentityNotLinked(connection.id))?;
    let viewer = services.vault.resolve_viewer(user_id).await?;
    let secret = services.vault.load_identity_secret(&viewer, &identity_id).await?;

    let session_id = match pre_launched {
        Some(session_id) => {
            services.lifecycle.mark_active(&session_id).await?;
            session_id
        }
        None => {
            let owner = load_user(services, &user_id).await?;
            let app_config = services.config.lock().await;
            let concurrent_limit = effective_concurrent_limit(
                connection.concurrent_limit,
                owner.concurrent_limit,
                app_config.sessions.concurrent_limit_default,
            );
            let allow_duplicates = connection
                .allow_duplicate_sessions
                .unwrap_or(app_config.sessions.allow_duplicate_connections);
            drop(app_config);

            services
                .lifecycle
                .start_session(StartSessionParams {
                    session_id: None,
                    connection_id: connection.id,
                    protocol_id: connection.protocol_id.clone(),
                    owner_user_id: user_id,
                    owner_username: display_name(services, &user_id).await,
                    team_id: connection.team_id,
                    host: config.host.clone(),
                    port: config.port,
                    concurrent_limit,
                    allow_duplicates,
                    metadata: metadata.clone(),
                    status: SessionStatus::Active,
                })
                .await?
        }
    };

    let driver = services
        .drivers
        .get(PROTOCOL_SSH)
        .ok_or(ShellgateError::HandleIncompatible)?;
    let launcher = driver.launcher().ok_or(ShellgateError::HandleIncompatible)?;

    let launch = launcher
        .launch(LaunchParams {
            session_id,
            connection_id: connection.id,
            protocol_id: connection.protocol_id.clone(),
            user_id,
            host: config.host.clone(),
            port: config.port,
            settings: config.settings.clone(),
            secret,
            terminal: metadata.terminal,
        })
        .await;

    let handle = match launch {
        Ok(handle) => handle,
        Err(error) => {
            warn!(%error, session_id=%session_id, "Driver launch failed");
            let _ = services
                .lifecycle
                .close_session(CloseSessionParams {
                    session_id,
                    status: SessionStatus::Failed,
                    reason: error.to_string(),
                })
                .await;
            return Err(error.into());
        }
    };

    if metadata.sftp_enabled {
        if let Some(provider) = handle.sftp_provider() {
            services.sftp_channels.attach(session_id, provider).await;
        }
    }
    services.registry.attach_handle(&session_id, handle.clone()).await?;

    Ok(PreparedTunnel {
        session_id,
        connection_id: connection.id,
        user_id,
        handle: Arc::new(GatedSessionHandle::primary(
            handle,
            services.clone(),
            session_id,
            user_id,
        )),
        primary: true,
    })
}

async fn prepare_secondary(
    services: &Services,
    user_id: Uuid,
    session_id: SessionId,
    connection_id: Uuid,
    handle: Arc<dyn SessionHandle>,
) -> Result<PreparedTunnel, ShellgateError> {
    let active = services
        .registry
        .get_session(&session_id)
        .await
        .ok_or(ShellgateError::SessionNotFound(session_id))?;
    if !active.lock().await.is_participant(&user_id) {
        return Err(ShellgateError::SessionAccessDenied);
    }

    let (stdout, stderr) = spawn_hub_tap(services, session_id).await?;
    Ok(PreparedTunnel {
        session_id,
        connection_id,
        user_id,
        handle: Arc::new(GatedSessionHandle::secondary(
            handle,
            services.clone(),
            session_id,
            user_id,
            stdout,
            stderr,
        )),
        primary: false,
    })
}

/// Runs the bridged session over the upgraded socket, then releases
/// resources in strict order. Cleanup steps run under their own short
/// timeouts, never under the (already finished) request context.
pub async fn run(services: Services, prepared: PreparedTunnel, mut socket: WebSocketStream) {
    let session_id = prepared.session_id;

    let ready = serde_json::json!({
        "type": "ready",
        "session_id": session_id,
        "connection_id": prepared.connection_id,
    });
    if socket.send(Message::Text(ready.to_string())).await.is_err() {
        warn!(%session_id, "Client went away before ready");
    }
    services
        .hub
        .broadcast(
            STREAM_SSH_TERMINAL,
            "ready",
            serde_json::json!({
                "session_id": session_id,
                "connection_id": prepared.connection_id,
                "user_id": prepared.user_id,
            }),
        )
        .await;

    let events: Arc<dyn BridgeEvents> = if prepared.primary {
        Arc::new(PrimaryTunnelEvents {
            services: services.clone(),
            session_id,
        })
    } else {
        Arc::new(SecondaryTunnelEvents {
            services: services.clone(),
            session_id,
        })
    };

    let bridge = TerminalBridge::new(BridgeParams::default());
    let outcome = bridge
        .run(socket, prepared.handle.clone(), events, session_id)
        .await;

    if !prepared.primary {
        debug!(%session_id, user_id=%prepared.user_id, "Participant tunnel closed");
        return;
    }

    if outcome.failed {
        services
            .hub
            .broadcast(
                STREAM_SSH_TERMINAL,
                "error",
                serde_json::json!({"session_id": session_id, "message": outcome.reason}),
            )
            .await;
    }

    // The bridge has already closed the socket; now the handle, the SFTP
    // channel, and finally the lifecycle record.
    if timeout(CLEANUP_STEP_TIMEOUT, prepared.handle.close_inner())
        .await
        .is_err()
    {
        warn!(%session_id, "Handle close timed out");
    }
    if timeout(
        CLEANUP_STEP_TIMEOUT,
        services.sftp_channels.detach(&session_id),
    )
    .await
    .is_err()
    {
        warn!(%session_id, "SFTP detach timed out");
    }

    let (status, reason) = if outcome.failed {
        (SessionStatus::Failed, outcome.reason)
    } else {
        (SessionStatus::Closed, outcome.reason)
    };
    if let Err(error) = services
        .lifecycle
        .close_session(CloseSessionParams {
            session_id,
            status,
            reason,
        })
        .await
    {
        error!(%error, %session_id, "Failed to close session");
    }
}

/// Session handle wrapper enforcing single-writer semantics: stdin and
/// resize pass through only while the tunnel's user holds write access.
/// Participant tunnels read the terminal from the realtime stream
/// instead of the (single-consumer) driver pipes.
struct GatedSessionHandle {
    inner: Arc<dyn SessionHandle>,
    services: Services,
    session_id: SessionId,
    user_id: Uuid,
    primary: bool,
    tap_stdout: Mutex<Option<Receiver<Bytes>>>,
    tap_stderr: Mutex<Option<Receiver<Bytes>>>,
}

impl GatedSessionHandle {
    fn primary(
        inner: Arc<dyn SessionHandle>,
        services: Services,
        session_id: SessionId,
        user_id: Uuid,
    ) -> Self {
        GatedSessionHandle {
            inner,
            services,
            session_id,
            user_id,
            primary: true,
            tap_stdout: Mutex::new(None),
            tap_stderr: Mutex::new(None),
        }
    }

    fn secondary(
        inner: Arc<dyn SessionHandle>,
        services: Services,
        session_id: SessionId,
        user_id: Uuid,
        tap_stdout: Receiver<Bytes>,
        tap_stderr: Receiver<Bytes>,
    ) -> Self {
        GatedSessionHandle {
            inner,
            services,
            session_id,
            user_id,
            primary: false,
            tap_stdout: Mutex::new(Some(tap_stdout)),
            tap_stderr: Mutex::new(Some(tap_stderr)),
        }
    }

    async fn holds_write(&self) -> bool {
        match self.services.registry.get_session(&self.session_id).await {
            Some(session) => session.lock().await.holds_write(&self.user_id),
            None => false,
        }
    }

    async fn close_inner(&self) {
        self.inner.close().await;
    }
}

#[async_trait]
impl SessionHandle for GatedSessionHandle {
    fn id(&self) -> SessionId {
        self.session_id
    }

    async fn write_stdin(&self, data: Bytes) -> Result<(), HandleError> {
        if !self.holds_write().await {
            // Keystrokes from readers are dropped, not an error.
            return Ok(());
        }
        self.inner.write_stdin(data).await
    }

    async fn take_stdout(&self) -> Option<Receiver<Bytes>> {
        if self.primary {
            self.inner.take_stdout().await
        } else {
            self.tap_stdout.lock().await.take()
        }
    }

    async fn take_stderr(&self) -> Option<Receiver<Bytes>> {
        if self.primary {
            self.inner.take_stderr().await
        } else {
            self.tap_stderr.lock().await.take()
        }
    }

    async fn resize(&self, size: TerminalSize) -> Result<(), HandleError> {
        if !self.holds_write().await {
            return Ok(());
        }
        self.inner.resize(size).await
    }

    async fn close(&self) {
        // Teardown of the driver session belongs to the primary tunnel's
        // cleanup; a participant closing their socket must not kill it.
        if self.primary {
            self.inner.close().await;
        }
    }

    fn sftp_provider(&self) -> Option<Arc<dyn SftpProvider>> {
        self.inner.sftp_provider()
    }
}

/// Feeds a participant tunnel from the realtime terminal stream, ending
/// when the session closes.
async fn spawn_hub_tap(
    services: &Services,
    session_id: SessionId,
) -> Result<(Receiver<Bytes>, Receiver<Bytes>), ShellgateError> {
    let subscription = services
        .hub
        .subscribe(
            // Tap subscriptions are internal; keyed by session.
            session_id,
            vec![
                STREAM_SSH_TERMINAL.to_owned(),
                STREAM_CONNECTION_SESSIONS.to_owned(),
            ],
        )
        .await?;
    let (stdout_tx, stdout_rx) = mpsc::channel(TAP_CHANNEL_CAPACITY);
    let (stderr_tx, stderr_rx) = mpsc::channel(TAP_CHANNEL_CAPACITY);

    let hub = services.hub.clone();
    tokio::spawn(async move {
        let conn_id = subscription.conn_id;
        let mut receiver = subscription.receiver;
        let wanted = serde_json::json!(session_id);
        while let Some(message) = receiver.recv().await {
            if message.data.get("session_id") != Some(&wanted) {
                continue;
            }
            match (message.stream.as_str(), message.event.as_str()) {
                (STREAM_SSH_TERMINAL, "stdout") | (STREAM_SSH_TERMINAL, "stderr") => {
                    let Some(encoded) = message.data.get("data").and_then(|d| d.as_str()) else {
                        continue;
                    };
                    let Ok(chunk) = BASE64.decode(encoded.as_bytes()) else {
                        continue;
                    };
                    let target = if message.event == "stdout" {
                        &stdout_tx
                    } else {
                        &stderr_tx
                    };
                    if target.send(Bytes::from(chunk)).await.is_err() {
                        break;
                    }
                }
                (STREAM_CONNECTION_SESSIONS, "session.closed") => break,
                _ => (),
            }
        }
        hub.disconnect(conn_id).await;
    });

    Ok((stdout_rx, stderr_rx))
}

struct PrimaryTunnelEvents {
    services: Services,
    session_id: SessionId,
}

#[async_trait]
impl BridgeEvents for PrimaryTunnelEvents {
    async fn on_heartbeat(&self) {
        self.services.lifecycle.heartbeat(&self.session_id).await;
    }

    async fn on_event(&self, stream: BridgeStream, chunk: &[u8]) {
        let terminal_stream = match stream {
            BridgeStream::Stdout => TerminalStream::Output,
            BridgeStream::Stderr => TerminalStream::Error,
        };
        self.services
            .recordings
            .record_stream(&self.session_id, terminal_stream, chunk)
            .await;
        self.services
            .hub
            .broadcast(
                STREAM_SSH_TERMINAL,
                match stream {
                    BridgeStream::Stdout => "stdout",
                    BridgeStream::Stderr => "stderr",
                },
                serde_json::json!({
                    "session_id": self.session_id,
                    "data": BASE64.encode(chunk),
                }),
            )
            .await;
    }
}

struct SecondaryTunnelEvents {
    services: Services,
    session_id: SessionId,
}

#[async_trait]
impl BridgeEvents for SecondaryTunnelEvents {
    async fn on_heartbeat(&self) {
        self.services.lifecycle.heartbeat(&self.session_id).await;
    }

    async fn on_event(&self, _stream: BridgeStream, _chunk: &[u8]) {
        // Chunks already came off the realtime stream; re-emitting them
        // would loop.
    }
}
