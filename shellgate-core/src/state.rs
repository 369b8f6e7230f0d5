use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use shellgate_common::protocols::SessionHandle;
use shellgate_common::{AccessMode, SessionId, SessionMetadata, ShellgateError};
use tokio::sync::Mutex;
use tracing::*;
use uuid::Uuid;

use crate::consts::{CHAT_RING_CAPACITY, STREAM_CONNECTION_SESSIONS};
use crate::hub::RealtimeHub;

#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: Uuid,
    pub display_name: String,
    pub access_mode: AccessMode,
    pub joined_at: DateTime<Utc>,
    pub consented_to_recording: bool,
    pub granted_by: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ChatEntry {
    pub id: Uuid,
    pub author_user_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// In-memory record of one live session. Owned by the registry, locked
/// per session; the registry map itself is under its own mutex.
pub struct ActiveSession {
    pub id: SessionId,
    pub connection_id: Uuid,
    pub owner_user_id: Uuid,
    pub owner_username: String,
    pub protocol_id: String,
    pub team_id: Option<Uuid>,
    pub host: String,
    pub port: u16,
    pub concurrent_limit: u32,
    pub metadata: SessionMetadata,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    participants: HashMap<Uuid, Participant>,
    write_holder: Uuid,
    chat: VecDeque<ChatEntry>,
    last_chat_at: Option<DateTime<Utc>>,
    handle: Option<Arc<dyn SessionHandle>>,
}

impl ActiveSession {
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn participant(&self, user_id: &Uuid) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    pub fn is_participant(&self, user_id: &Uuid) -> bool {
        self.participants.contains_key(user_id)
    }

    pub fn write_holder(&self) -> Uuid {
        self.write_holder
    }

    pub fn holds_write(&self, user_id: &Uuid) -> bool {
        self.write_holder == *user_id
    }

    pub fn chat_tail(&self, limit: usize) -> Vec<ChatEntry> {
        let skip = self.chat.len().saturating_sub(limit);
        self.chat.iter().skip(skip).cloned().collect()
    }

    pub fn handle(&self) -> Option<Arc<dyn SessionHandle>> {
        self.handle.clone()
    }

    /// Next write holder after `leaving` gives up write access: the owner
    /// when still present, otherwise the earliest-joined remaining
    /// participant.
    fn promotion_candidate(&self, leaving: &Uuid) -> Option<Uuid> {
        if self.participants.contains_key(&self.owner_user_id) && self.owner_user_id != *leaving {
            return Some(self.owner_user_id);
        }
        self.participants
            .values()
            .filter(|p| p.user_id != *leaving)
            .min_by_key(|p| p.joined_at)
            .map(|p| p.user_id)
    }
}

pub struct RegisterSessionParams {
    pub id: SessionId,
    pub connection_id: Uuid,
    pub owner_user_id: Uuid,
    pub owner_username: String,
    pub protocol_id: String,
    pub team_id: Option<Uuid>,
    pub host: String,
    pub port: u16,
    pub concurrent_limit: u32,
    pub allow_duplicates: bool,
    pub metadata: SessionMetadata,
}

pub struct ListActiveOptions {
    pub user_id: Uuid,
    pub include_all: bool,
    pub include_teams: bool,
    pub team_ids: Vec<Uuid>,
}

/// Thread-safe map of live sessions. Every participant or write-holder
/// mutation commits under the per-session lock before its event is
/// broadcast on `connection_sessions`.
pub struct ActiveSessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Mutex<ActiveSession>>>>,
    hub: Arc<RealtimeHub>,
}

impl ActiveSessionRegistry {
    pub fn new(hub: Arc<RealtimeHub>) -> Self {
        ActiveSessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            hub,
        }
    }

    pub async fn register_session(
        &self,
        params: RegisterSessionParams,
    ) -> Result<Arc<Mutex<ActiveSession>>, ShellgateError> {
        let mut sessions = self.sessions.lock().await;

        let mut owned = 0u32;
        for session in sessions.values() {
            let session = session.lock().await;
            if session.owner_user_id == params.owner_user_id {
                owned += 1;
                if session.connection_id == params.connection_id && !params.allow_duplicates {
                    return Err(ShellgateError::ActiveSessionExists);
                }
            }
        }
        if params.concurrent_limit > 0 && owned >= params.concurrent_limit {
            return Err(ShellgateError::ConcurrentLimit(params.concurrent_limit));
        }

        let now = Utc::now();
        let owner = Participant {
            user_id: params.owner_user_id,
            display_name: params.owner_username.clone(),
            access_mode: AccessMode::Write,
            joined_at: now,
            consented_to_recording: !params.metadata.recording_policy.require_consent
                || params.metadata.recording_enabled,
            granted_by: None,
        };

        let session = ActiveSession {
            id: params.id,
            connection_id: params.connection_id,
            owner_user_id: params.owner_user_id,
            owner_username: params.owner_username,
            protocol_id: params.protocol_id,
            team_id: params.team_id,
            host: params.host,
            port: params.port,
            concurrent_limit: params.concurrent_limit,
            metadata: params.metadata,
            started_at: now,
            last_heartbeat_at: now,
            participants: HashMap::from([(owner.user_id, owner)]),
            write_holder: params.owner_user_id,
            chat: VecDeque::with_capacity(CHAT_RING_CAPACITY),
            last_chat_at: None,
            handle: None,
        };

        let session = Arc::new(Mutex::new(session));
        sessions.insert(params.id, session.clone());
        Ok(session)
    }

    pub async fn remove_session(&self, id: &SessionId) -> Option<Arc<Mutex<ActiveSession>>> {
        self.sessions.lock().await.remove(id)
    }

    pub async fn get_session(&self, id: &SessionId) -> Option<Arc<Mutex<ActiveSession>>> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn count_active_for_user(&self, user_id: &Uuid) -> u32 {
        let sessions = self.sessions.lock().await;
        let mut count = 0;
        for session in sessions.values() {
            if session.lock().await.owner_user_id == *user_id {
                count += 1;
            }
        }
        count
    }

    pub async fn list_active(&self, options: &ListActiveOptions) -> Vec<Arc<Mutex<ActiveSession>>> {
        let sessions = self.sessions.lock().await;
        let mut out = vec![];
        for session in sessions.values() {
            let guard = session.lock().await;
            let visible = options.include_all
                || guard.owner_user_id == options.user_id
                || guard.is_participant(&options.user_id)
                || (options.include_teams
                    && guard
                        .team_id
                        .map(|t| options.team_ids.contains(&t))
                        .unwrap_or(false));
            if visible {
                out.push(session.clone());
            }
        }
        out
    }

    pub async fn heartbeat(&self, id: &SessionId) {
        if let Some(session) = self.get_session(id).await {
            let mut session = session.lock().await;
            let now = Utc::now();
            if now > session.last_heartbeat_at {
                session.last_heartbeat_at = now;
            }
        }
    }

    pub async fn attach_handle(
        &self,
        id: &SessionId,
        handle: Arc<dyn SessionHandle>,
    ) -> Result<(), ShellgateError> {
        let session = self
            .get_session(id)
            .await
            .ok_or(ShellgateError::SessionNotFound(*id))?;
        session.lock().await.handle = Some(handle);
        Ok(())
    }

    pub async fn peek_handle(&self, id: &SessionId) -> Option<Arc<dyn SessionHandle>> {
        match self.get_session(id).await {
            Some(session) => session.lock().await.handle(),
            None => None,
        }
    }

    pub async fn detach_handle(&self, id: &SessionId) {
        if let Some(session) = self.get_session(id).await {
            session.lock().await.handle = None;
        }
    }

    pub async fn add_participant(
        &self,
        id: &SessionId,
        mut participant: Participant,
    ) -> Result<Participant, ShellgateError> {
        let session = self
            .get_session(id)
            .await
            .ok_or(ShellgateError::SessionNotFound(*id))?;

        let event_data;
        {
            let mut session = session.lock().await;
            // Joining with write access demotes the current holder.
            if participant.access_mode == AccessMode::Write {
                let holder = session.write_holder;
                if let Some(p) = session.participants.get_mut(&holder) {
                    p.access_mode = AccessMode::Read;
                }
                session.write_holder = participant.user_id;
            }
            participant.joined_at = Utc::now();
            session
                .participants
                .insert(participant.user_id, participant.clone());
            event_data = serde_json::json!({
                "session_id": session.id,
                "user_id": participant.user_id,
                "display_name": participant.display_name,
                "access_mode": participant.access_mode,
            });
        }
        self.hub
            .broadcast(STREAM_CONNECTION_SESSIONS, "participant_joined", event_data)
            .await;
        Ok(participant)
    }

    /// Removes a participant. If they held write access the owner (or the
    /// earliest-joined remaining participant) is promoted.
    pub async fn remove_participant(
        &self,
        id: &SessionId,
        user_id: &Uuid,
    ) -> Result<(), ShellgateError> {
        let session = self
            .get_session(id)
            .await
            .ok_or(ShellgateError::SessionNotFound(*id))?;

        let mut events = vec![];
        {
            let mut session = session.lock().await;
            if session.participants.remove(user_id).is_none() {
                return Err(ShellgateError::NotFound("participant".into()));
            }
            events.push((
                "participant_left",
                serde_json::json!({"session_id": session.id, "user_id": user_id}),
            ));
            if session.write_holder == *user_id {
                if let Some(next) = session.promotion_candidate(user_id) {
                    session.write_holder = next;
                    if let Some(p) = session.participants.get_mut(&next) {
                        p.access_mode = AccessMode::Write;
                    }
                    events.push((
                        "write_granted",
                        serde_json::json!({"session_id": session.id, "user_id": next}),
                    ));
                }
            }
        }
        for (event, data) in events {
            self.hub
                .broadcast(STREAM_CONNECTION_SESSIONS, event, data)
                .await;
        }
        Ok(())
    }

    /// Atomically demotes the current holder and promotes `user_id`.
    pub async fn grant_write_access(
        &self,
        id: &SessionId,
        user_id: &Uuid,
        granted_by: &Uuid,
    ) -> Result<(), ShellgateError> {
        let session = self
            .get_session(id)
            .await
            .ok_or(ShellgateError::SessionNotFound(*id))?;

        let mut events = vec![];
        {
            let mut session = session.lock().await;
            if !session.participants.contains_key(user_id) {
                return Err(ShellgateError::NotFound("participant".into()));
            }
            let previous = session.write_holder;
            if previous == *user_id {
                return Ok(());
            }
            if let Some(p) = session.participants.get_mut(&previous) {
                p.access_mode = AccessMode::Read;
            }
            events.push((
                "write_released",
                serde_json::json!({"session_id": session.id, "user_id": previous}),
            ));
            session.write_holder = *user_id;
            if let Some(p) = session.participants.get_mut(user_id) {
                p.access_mode = AccessMode::Write;
                p.granted_by = Some(*granted_by);
            }
            events.push((
                "write_granted",
                serde_json::json!({"session_id": session.id, "user_id": user_id}),
            ));
        }
        for (event, data) in events {
            self.hub
                .broadcast(STREAM_CONNECTION_SESSIONS, event, data)
                .await;
        }
        Ok(())
    }

    /// Gives up write access. Returns the new holder, or `None` when no
    /// other participant could take over (the caller keeps write so the
    /// session never goes writer-less).
    pub async fn relinquish_write_access(
        &self,
        id: &SessionId,
        user_id: &Uuid,
    ) -> Result<Option<Uuid>, ShellgateError> {
        let session = self
            .get_session(id)
            .await
            .ok_or(ShellgateError::SessionNotFound(*id))?;

        let mut events = vec![];
        let new_holder;
        {
            let mut session = session.lock().await;
            if session.write_holder != *user_id {
                return Err(ShellgateError::BadRequest(
                    "caller does not hold write access".into(),
                ));
            }
            new_holder = session.promotion_candidate(user_id);
            if let Some(next) = new_holder {
                if let Some(p) = session.participants.get_mut(user_id) {
                    p.access_mode = AccessMode::Read;
                }
                events.push((
                    "write_released",
                    serde_json::json!({"session_id": session.id, "user_id": user_id}),
                ));
                session.write_holder = next;
                if let Some(p) = session.participants.get_mut(&next) {
                    p.access_mode = AccessMode::Write;
                }
                events.push((
                    "write_granted",
                    serde_json::json!({"session_id": session.id, "user_id": next}),
                ));
            }
        }
        for (event, data) in events {
            self.hub
                .broadcast(STREAM_CONNECTION_SESSIONS, event, data)
                .await;
        }
        Ok(new_holder)
    }

    /// Appends to the bounded live buffer (oldest entry evicted) and
    /// broadcasts `chat_posted`. The caller persists the message row.
    pub async fn append_chat_message(
        &self,
        id: &SessionId,
        author_user_id: Uuid,
        content: String,
    ) -> Result<ChatEntry, ShellgateError> {
        let session = self
            .get_session(id)
            .await
            .ok_or(ShellgateError::SessionNotFound(*id))?;

        let entry;
        {
            let mut session = session.lock().await;
            // Server timestamps are monotonic per session.
            let mut now = Utc::now();
            if let Some(last) = session.last_chat_at {
                if now <= last {
                    now = last + Duration::microseconds(1);
                }
            }
            session.last_chat_at = Some(now);
            entry = ChatEntry {
                id: Uuid::new_v4(),
                author_user_id,
                content,
                created_at: now,
            };
            if session.chat.len() >= CHAT_RING_CAPACITY {
                session.chat.pop_front();
            }
            session.chat.push_back(entry.clone());
        }
        self.hub
            .broadcast(
                STREAM_CONNECTION_SESSIONS,
                "chat_posted",
                serde_json::json!({
                    "session_id": id,
                    "id": entry.id,
                    "author_user_id": entry.author_user_id,
                    "content": entry.content,
                    "created_at": entry.created_at,
                }),
            )
            .await;
        Ok(entry)
    }

    /// Sessions whose last heartbeat is older than `stale_after`.
    pub async fn stale_sessions(&self, stale_after: Duration) -> Vec<SessionId> {
        let cutoff = Utc::now() - stale_after;
        let sessions = self.sessions.lock().await;
        let mut out = vec![];
        for (id, session) in sessions.iter() {
            if session.lock().await.last_heartbeat_at < cutoff {
                out.push(*id);
            }
        }
        out
    }

    pub async fn all_session_ids(&self) -> Vec<SessionId> {
        self.sessions.lock().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use shellgate_common::protocols::TerminalSize;
    use shellgate_common::{
        RecordingMode, RecordingPolicySnapshot, RecordingStorageKind, TemplateSnapshot,
    };

    use super::*;

    fn metadata() -> SessionMetadata {
        SessionMetadata {
            recording_policy: RecordingPolicySnapshot {
                mode: RecordingMode::Disabled,
                storage: RecordingStorageKind::Filesystem,
                retention_days: 0,
                require_consent: false,
            },
            recording_enabled: false,
            sftp_enabled: true,
            terminal: TerminalSize::default(),
            template: TemplateSnapshot::default(),
            capabilities: vec![],
        }
    }

    fn params(owner: Uuid, connection: Uuid, limit: u32) -> RegisterSessionParams {
        RegisterSessionParams {
            id: Uuid::new_v4(),
            connection_id: connection,
            owner_user_id: owner,
            owner_username: "owner".into(),
            protocol_id: "ssh".into(),
            team_id: None,
            host: "host.internal".into(),
            port: 22,
            concurrent_limit: limit,
            allow_duplicates: true,
            metadata: metadata(),
        }
    }

    fn registry() -> ActiveSessionRegistry {
        ActiveSessionRegistry::new(Arc::new(RealtimeHub::new()))
    }

    async fn writer_count(session: &Arc<Mutex<ActiveSession>>) -> usize {
        session
            .lock()
            .await
            .participants()
            .filter(|p| p.access_mode == AccessMode::Write)
            .count()
    }

    #[tokio::test]
    async fn owner_starts_as_sole_writer() {
        let registry = registry();
        let owner = Uuid::new_v4();
        let session = registry
            .register_session(params(owner, Uuid::new_v4(), 0))
            .await
            .unwrap();
        assert_eq!(writer_count(&session).await, 1);
        assert!(session.lock().await.holds_write(&owner));
    }

    #[tokio::test]
    async fn concurrent_limit_is_enforced() {
        let registry = registry();
        let owner = Uuid::new_v4();
        registry
            .register_session(params(owner, Uuid::new_v4(), 2))
            .await
            .unwrap();
        registry
            .register_session(params(owner, Uuid::new_v4(), 2))
            .await
            .unwrap();
        let third = registry
            .register_session(params(owner, Uuid::new_v4(), 2))
            .await;
        assert!(matches!(third, Err(ShellgateError::ConcurrentLimit(2))));
    }

    #[tokio::test]
    async fn limit_frees_up_after_close() {
        let registry = registry();
        let owner = Uuid::new_v4();
        let first = registry
            .register_session(params(owner, Uuid::new_v4(), 1))
            .await
            .unwrap();
        let id = first.lock().await.id;
        assert!(registry
            .register_session(params(owner, Uuid::new_v4(), 1))
            .await
            .is_err());
        registry.remove_session(&id).await;
        assert!(registry
            .register_session(params(owner, Uuid::new_v4(), 1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn duplicate_connection_rejected_when_disallowed() {
        let registry = registry();
        let owner = Uuid::new_v4();
        let connection = Uuid::new_v4();
        let mut p = params(owner, connection, 0);
        p.allow_duplicates = false;
        registry.register_session(p).await.unwrap();
        let mut p2 = params(owner, connection, 0);
        p2.allow_duplicates = false;
        assert!(matches!(
            registry.register_session(p2).await,
            Err(ShellgateError::ActiveSessionExists)
        ));

        // A different user may still open the same connection.
        let mut p3 = params(Uuid::new_v4(), connection, 0);
        p3.allow_duplicates = false;
        assert!(registry.register_session(p3).await.is_ok());
    }

    #[tokio::test]
    async fn exactly_one_writer_through_grant_and_relinquish() {
        let registry = registry();
        let owner = Uuid::new_v4();
        let guest = Uuid::new_v4();
        let session = registry
            .register_session(params(owner, Uuid::new_v4(), 0))
            .await
            .unwrap();
        let id = session.lock().await.id;

        registry
            .add_participant(
                &id,
                Participant {
                    user_id: guest,
                    display_name: "guest".into(),
                    access_mode: AccessMode::Read,
                    joined_at: Utc::now(),
                    consented_to_recording: true,
                    granted_by: Some(owner),
                },
            )
            .await
            .unwrap();
        assert_eq!(writer_count(&session).await, 1);

        registry.grant_write_access(&id, &guest, &owner).await.unwrap();
        assert_eq!(writer_count(&session).await, 1);
        assert!(session.lock().await.holds_write(&guest));

        let new_holder = registry.relinquish_write_access(&id, &guest).await.unwrap();
        assert_eq!(new_holder, Some(owner));
        assert_eq!(writer_count(&session).await, 1);
        assert!(session.lock().await.holds_write(&owner));
    }

    #[tokio::test]
    async fn relinquish_prefers_owner_over_earlier_joiner() {
        let registry = registry();
        let owner = Uuid::new_v4();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let session = registry
            .register_session(params(owner, Uuid::new_v4(), 0))
            .await
            .unwrap();
        let id = session.lock().await.id;

        for user in [u1, u2] {
            registry
                .add_participant(
                    &id,
                    Participant {
                        user_id: user,
                        display_name: "u".into(),
                        access_mode: AccessMode::Read,
                        joined_at: Utc::now(),
                        consented_to_recording: true,
                        granted_by: Some(owner),
                    },
                )
                .await
                .unwrap();
        }
        registry.grant_write_access(&id, &u1, &owner).await.unwrap();
        let next = registry.relinquish_write_access(&id, &u1).await.unwrap();
        assert_eq!(next, Some(owner));
    }

    #[tokio::test]
    async fn writer_leaving_promotes_earliest_joined_when_owner_gone() {
        let registry = registry();
        let owner = Uuid::new_v4();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let session = registry
            .register_session(params(owner, Uuid::new_v4(), 0))
            .await
            .unwrap();
        let id = session.lock().await.id;

        for user in [u1, u2] {
            registry
                .add_participant(
                    &id,
                    Participant {
                        user_id: user,
                        display_name: "u".into(),
                        access_mode: AccessMode::Read,
                        joined_at: Utc::now(),
                        consented_to_recording: true,
                        granted_by: Some(owner),
                    },
                )
                .await
                .unwrap();
        }
        // Owner leaves first, then the write holder.
        registry.grant_write_access(&id, &owner, &owner).await.unwrap();
        registry.remove_participant(&id, &owner).await.unwrap();
        let holder = session.lock().await.write_holder();
        assert_eq!(holder, u1);
        registry.remove_participant(&id, &u1).await.unwrap();
        assert_eq!(session.lock().await.write_holder(), u2);
        assert_eq!(writer_count(&session).await, 1);
    }

    #[tokio::test]
    async fn sole_writer_relinquish_keeps_write() {
        let registry = registry();
        let owner = Uuid::new_v4();
        let session = registry
            .register_session(params(owner, Uuid::new_v4(), 0))
            .await
            .unwrap();
        let id = session.lock().await.id;
        let next = registry.relinquish_write_access(&id, &owner).await.unwrap();
        // Nobody else can take over; the session never goes writer-less.
        assert_eq!(next, None);
        assert!(session.lock().await.holds_write(&owner));
        assert_eq!(writer_count(&session).await, 1);
    }

    #[tokio::test]
    async fn chat_ring_evicts_oldest() {
        let registry = registry();
        let owner = Uuid::new_v4();
        let session = registry
            .register_session(params(owner, Uuid::new_v4(), 0))
            .await
            .unwrap();
        let id = session.lock().await.id;

        for i in 0..(CHAT_RING_CAPACITY + 10) {
            registry
                .append_chat_message(&id, owner, format!("msg {i}"))
                .await
                .unwrap();
        }
        let tail = session.lock().await.chat_tail(CHAT_RING_CAPACITY + 10);
        assert_eq!(tail.len(), CHAT_RING_CAPACITY);
        assert_eq!(tail.first().unwrap().content, "msg 10");
    }

    #[tokio::test]
    async fn chat_timestamps_are_monotonic() {
        let registry = registry();
        let owner = Uuid::new_v4();
        let session = registry
            .register_session(params(owner, Uuid::new_v4(), 0))
            .await
            .unwrap();
        let id = session.lock().await.id;

        let mut last = None;
        for _ in 0..50 {
            let entry = registry
                .append_chat_message(&id, owner, "x".into())
                .await
                .unwrap();
            if let Some(last) = last {
                assert!(entry.created_at > last);
            }
            last = Some(entry.created_at);
        }
    }
}
