use chrono::{DateTime, Utc};
use serde::Serialize;
use shellgate_common::{AccessMode, SessionId, SessionMetadata};
use shellgate_db_entities::ConnectionSession::{self, SessionStatus};
use shellgate_db_entities::{ChatMessage, Connection};
use uuid::Uuid;

use crate::state::{ActiveSession, ChatEntry, Participant};

#[derive(Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub connection_id: Uuid,
    pub protocol_id: String,
    pub owner_user_id: Uuid,
    pub team_id: Option<Uuid>,
    pub host: String,
    pub port: u16,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub metadata: serde_json::Value,
}

impl From<ConnectionSession::Model> for SessionSnapshot {
    fn from(model: ConnectionSession::Model) -> Self {
        Self {
            id: model.id,
            connection_id: model.connection_id,
            protocol_id: model.protocol_id,
            owner_user_id: model.owner_user_id,
            team_id: model.team_id,
            host: model.host,
            port: model.port as u16,
            status: model.status,
            started_at: model.started_at,
            last_heartbeat_at: model.last_heartbeat_at,
            closed_at: model.closed_at,
            close_reason: model.close_reason,
            metadata: model.metadata,
        }
    }
}

#[derive(Serialize)]
pub struct ParticipantSnapshot {
    pub user_id: Uuid,
    pub display_name: String,
    pub access_mode: AccessMode,
    pub joined_at: DateTime<Utc>,
    pub consented_to_recording: bool,
    pub granted_by: Option<Uuid>,
}

impl From<&Participant> for ParticipantSnapshot {
    fn from(p: &Participant) -> Self {
        Self {
            user_id: p.user_id,
            display_name: p.display_name.clone(),
            access_mode: p.access_mode,
            joined_at: p.joined_at,
            consented_to_recording: p.consented_to_recording,
            granted_by: p.granted_by,
        }
    }
}

#[derive(Serialize)]
pub struct ActiveSessionSnapshot {
    pub id: SessionId,
    pub connection_id: Uuid,
    pub owner_user_id: Uuid,
    pub owner_username: String,
    pub protocol_id: String,
    pub team_id: Option<Uuid>,
    pub host: String,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub write_holder: Uuid,
    pub participants: Vec<ParticipantSnapshot>,
    pub metadata: SessionMetadata,
}

impl From<&ActiveSession> for ActiveSessionSnapshot {
    fn from(session: &ActiveSession) -> Self {
        let mut participants: Vec<ParticipantSnapshot> =
            session.participants().map(Into::into).collect();
        participants.sort_by_key(|p| p.joined_at);
        Self {
            id: session.id,
            connection_id: session.connection_id,
            owner_user_id: session.owner_user_id,
            owner_username: session.owner_username.clone(),
            protocol_id: session.protocol_id.clone(),
            team_id: session.team_id,
            host: session.host.clone(),
            port: session.port,
            started_at: session.started_at,
            last_heartbeat_at: session.last_heartbeat_at,
            write_holder: session.write_holder(),
            participants,
            metadata: session.metadata.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct ChatMessageSnapshot {
    pub id: Uuid,
    pub session_id: SessionId,
    pub author_user_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<ChatMessage::Model> for ChatMessageSnapshot {
    fn from(model: ChatMessage::Model) -> Self {
        Self {
            id: model.id,
            session_id: model.session_id,
            author_user_id: model.author_user_id,
            content: model.content,
            created_at: model.created_at,
        }
    }
}

impl ChatMessageSnapshot {
    pub fn from_entry(session_id: SessionId, entry: &ChatEntry) -> Self {
        Self {
            id: entry.id,
            session_id,
            author_user_id: entry.author_user_id,
            content: entry.content.clone(),
            created_at: entry.created_at,
        }
    }
}

#[derive(Serialize)]
pub struct ConnectionSnapshot {
    pub id: Uuid,
    pub name: String,
    pub protocol_id: String,
    pub owner_user_id: Uuid,
    pub team_id: Option<Uuid>,
    pub host: String,
    pub port: u16,
    pub identity_id: Option<Uuid>,
    pub template_id: Option<String>,
}

impl From<Connection::Model> for ConnectionSnapshot {
    fn from(model: Connection::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            protocol_id: model.protocol_id,
            owner_user_id: model.owner_user_id,
            team_id: model.team_id,
            host: model.host,
            port: model.port as u16,
            identity_id: model.identity_id,
            template_id: model.template_id,
        }
    }
}
