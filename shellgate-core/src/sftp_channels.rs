use std::collections::HashMap;
use std::sync::Arc;

use shellgate_common::protocols::{SftpClient, SftpError, SftpProvider};
use shellgate_common::SessionId;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::*;

struct SftpChannel {
    provider: Arc<dyn SftpProvider>,
    // Capacity 1: one file operation owns the channel at a time.
    semaphore: Arc<Semaphore>,
    client: Mutex<Option<Arc<dyn SftpClient>>>,
}

/// Lends the per-session SFTP subclient to HTTP file-operation handlers.
/// Borrows serialise on a per-session semaphore; a detached session
/// rejects further borrows.
pub struct SftpChannelRegistry {
    channels: Mutex<HashMap<SessionId, Arc<SftpChannel>>>,
}

/// Exclusive use of the session's SFTP client for one operation; the
/// permit is released on drop.
pub struct SftpLease {
    client: Arc<dyn SftpClient>,
    _permit: OwnedSemaphorePermit,
}

impl SftpLease {
    pub fn client(&self) -> &Arc<dyn SftpClient> {
        &self.client
    }
}

impl SftpChannelRegistry {
    pub fn new() -> Self {
        SftpChannelRegistry {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub async fn attach(&self, session_id: SessionId, provider: Arc<dyn SftpProvider>) {
        let mut channels = self.channels.lock().await;
        channels.insert(
            session_id,
            Arc::new(SftpChannel {
                provider,
                semaphore: Arc::new(Semaphore::new(1)),
                client: Mutex::new(None),
            }),
        );
        debug!(%session_id, "SFTP channel attached");
    }

    pub async fn borrow(&self, session_id: &SessionId) -> Result<SftpLease, SftpError> {
        let channel = {
            let channels = self.channels.lock().await;
            channels
                .get(session_id)
                .cloned()
                .ok_or(SftpError::SessionNotFound)?
        };

        let permit = channel
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SftpError::SessionNotFound)?;

        // The subclient is opened lazily on first borrow and reused.
        let client = {
            let mut slot = channel.client.lock().await;
            match slot.as_ref() {
                Some(client) => client.clone(),
                None => {
                    let client = channel.provider.open().await?;
                    *slot = Some(client.clone());
                    client
                }
            }
        };

        Ok(SftpLease {
            client,
            _permit: permit,
        })
    }

    pub async fn detach(&self, session_id: &SessionId) {
        let channel = {
            let mut channels = self.channels.lock().await;
            channels.remove(session_id)
        };
        if let Some(channel) = channel {
            channel.semaphore.close();
            let client = channel.client.lock().await.take();
            if let Some(client) = client {
                client.close().await;
            }
            debug!(%session_id, "SFTP channel detached");
        }
    }

    pub async fn is_attached(&self, session_id: &SessionId) -> bool {
        self.channels.lock().await.contains_key(session_id)
    }
}

impl Default for SftpChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use shellgate_common::protocols::SftpEntry;
    use uuid::Uuid;

    use super::*;

    struct FakeClient;

    #[async_trait]
    impl SftpClient for FakeClient {
        async fn read_dir(&self, _path: &str) -> Result<Vec<SftpEntry>, SftpError> {
            Ok(vec![])
        }
        async fn metadata(&self, path: &str) -> Result<SftpEntry, SftpError> {
            Err(SftpError::NotFound(path.into()))
        }
        async fn read(&self, _path: &str, _offset: u64, _limit: u64) -> Result<Bytes, SftpError> {
            Ok(Bytes::new())
        }
        async fn write(&self, _path: &str, offset: u64, data: Bytes) -> Result<u64, SftpError> {
            Ok(offset + data.len() as u64)
        }
        async fn rename(&self, _from: &str, _to: &str) -> Result<(), SftpError> {
            Ok(())
        }
        async fn remove_file(&self, _path: &str) -> Result<(), SftpError> {
            Ok(())
        }
        async fn remove_dir(&self, _path: &str) -> Result<(), SftpError> {
            Ok(())
        }
        async fn create_dir(&self, _path: &str) -> Result<(), SftpError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    struct FakeProvider;

    #[async_trait]
    impl SftpProvider for FakeProvider {
        async fn open(&self) -> Result<Arc<dyn SftpClient>, SftpError> {
            Ok(Arc::new(FakeClient))
        }
    }

    #[tokio::test]
    async fn borrow_without_attach_fails() {
        let registry = SftpChannelRegistry::new();
        let result = registry.borrow(&Uuid::new_v4()).await;
        assert!(matches!(result, Err(SftpError::SessionNotFound)));
    }

    #[tokio::test]
    async fn borrows_serialise_on_the_channel() {
        let registry = SftpChannelRegistry::new();
        let session = Uuid::new_v4();
        registry.attach(session, Arc::new(FakeProvider)).await;

        let first = registry.borrow(&session).await.unwrap();
        // A second borrow must wait for the first lease to drop.
        let registry = Arc::new(registry);
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.borrow(&session).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(first);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn detach_rejects_future_borrows() {
        let registry = SftpChannelRegistry::new();
        let session = Uuid::new_v4();
        registry.attach(session, Arc::new(FakeProvider)).await;
        let lease = registry.borrow(&session).await.unwrap();
        drop(lease);
        registry.detach(&session).await;
        assert!(matches!(
            registry.borrow(&session).await,
            Err(SftpError::SessionNotFound)
        ));
    }
}
