use std::collections::{HashMap, HashSet};

use serde::Serialize;
use shellgate_common::ShellgateError;
use tokio::sync::{mpsc, Mutex};
use tracing::*;
use uuid::Uuid;

use crate::consts::WELL_KNOWN_STREAMS;

const CONNECTION_QUEUE_CAPACITY: usize = 64;

/// One fan-out message: `{stream, event, data}`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamMessage {
    pub stream: String,
    pub event: String,
    pub data: serde_json::Value,
}

struct HubConnection {
    user_id: Uuid,
    streams: HashSet<String>,
    sender: mpsc::Sender<StreamMessage>,
}

struct HubInner {
    next_conn_id: u64,
    connections: HashMap<u64, HubConnection>,
}

/// Best-effort realtime fan-out. Business state is always committed before
/// its broadcast is emitted; subscribers that cannot keep up are
/// disconnected rather than allowed to block the rest (their receiver
/// simply ends, which the WebSocket layer turns into a policy-violation
/// close).
pub struct RealtimeHub {
    inner: Mutex<HubInner>,
}

pub struct HubSubscription {
    pub conn_id: u64,
    pub receiver: mpsc::Receiver<StreamMessage>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        RealtimeHub {
            inner: Mutex::new(HubInner {
                next_conn_id: 0,
                connections: HashMap::new(),
            }),
        }
    }

    /// Subscribes a connection to one or more named streams. Unknown
    /// stream names are rejected.
    pub async fn subscribe(
        &self,
        user_id: Uuid,
        streams: Vec<String>,
    ) -> Result<HubSubscription, ShellgateError> {
        if streams.is_empty() {
            return Err(ShellgateError::BadRequest("no streams requested".into()));
        }
        for name in &streams {
            if !WELL_KNOWN_STREAMS.contains(&name.as_str()) {
                return Err(ShellgateError::NotFound(format!("stream {name}")));
            }
        }

        let (sender, receiver) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        let mut inner = self.inner.lock().await;
        let conn_id = inner.next_conn_id;
        inner.next_conn_id += 1;
        inner.connections.insert(
            conn_id,
            HubConnection {
                user_id,
                streams: streams.into_iter().collect(),
                sender,
            },
        );
        debug!(%user_id, conn_id, "Hub connection subscribed");
        Ok(HubSubscription { conn_id, receiver })
    }

    pub async fn disconnect(&self, conn_id: u64) {
        let mut inner = self.inner.lock().await;
        inner.connections.remove(&conn_id);
    }

    /// Fans `event`/`data` out to every connection subscribed to
    /// `stream`. Connections with a full queue are dropped.
    pub async fn broadcast(&self, stream: &str, event: &str, data: serde_json::Value) {
        let message = StreamMessage {
            stream: stream.to_owned(),
            event: event.to_owned(),
            data,
        };

        let mut inner = self.inner.lock().await;
        let mut stalled = vec![];
        for (conn_id, conn) in inner.connections.iter() {
            if !conn.streams.contains(stream) {
                continue;
            }
            match conn.sender.try_send(message.clone()) {
                Ok(()) => (),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn_id, user_id=%conn.user_id, stream, "Hub connection stalled, dropping it");
                    stalled.push(*conn_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    stalled.push(*conn_id);
                }
            }
        }
        for conn_id in stalled {
            inner.connections.remove(&conn_id);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::STREAM_CONNECTION_SESSIONS;

    #[tokio::test]
    async fn unknown_stream_is_rejected() {
        let hub = RealtimeHub::new();
        let result = hub
            .subscribe(Uuid::new_v4(), vec!["bogus".to_owned()])
            .await;
        assert!(matches!(result, Err(ShellgateError::NotFound(_))));
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribed_streams_only() {
        let hub = RealtimeHub::new();
        let user = Uuid::new_v4();
        let mut sessions_sub = hub
            .subscribe(user, vec![STREAM_CONNECTION_SESSIONS.to_owned()])
            .await
            .unwrap();
        let mut notif_sub = hub
            .subscribe(user, vec!["notifications".to_owned()])
            .await
            .unwrap();

        hub.broadcast(
            STREAM_CONNECTION_SESSIONS,
            "session.opened",
            serde_json::json!({"id": "x"}),
        )
        .await;

        let msg = sessions_sub.receiver.recv().await.unwrap();
        assert_eq!(msg.event, "session.opened");
        assert!(notif_sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn stalled_connection_is_dropped() {
        let hub = RealtimeHub::new();
        let user = Uuid::new_v4();
        let sub = hub
            .subscribe(user, vec![STREAM_CONNECTION_SESSIONS.to_owned()])
            .await
            .unwrap();

        // Never drain the receiver; overflow the queue.
        for _ in 0..=CONNECTION_QUEUE_CAPACITY {
            hub.broadcast(STREAM_CONNECTION_SESSIONS, "tick", serde_json::Value::Null)
                .await;
        }
        assert_eq!(hub.connection_count().await, 0);
        drop(sub);
    }
}
