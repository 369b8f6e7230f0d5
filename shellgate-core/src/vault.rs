use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use data_encoding::BASE64;
use governor::{DefaultDirectRateLimiter, Quota};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use shellgate_common::{Secret, ShellgateError, VaultConfig};
use shellgate_db_entities::Identity::{self, IdentityScope};
use shellgate_db_entities::IdentityShare::{self, ShareLevel};
use tokio::sync::Mutex;
use tracing::*;
use uuid::Uuid;

use crate::consts::VAULT_DECRYPTS_PER_MINUTE;
use crate::permissions::{PermissionChecker, PERM_IDENTITY_USE};

const NONCE_LEN: usize = 12;

/// The decryption capability for one caller. Root bypasses scope checks.
#[derive(Debug, Clone, Copy)]
pub struct Viewer {
    pub user_id: Uuid,
    pub is_root: bool,
}

/// Decrypts identity payloads into secret maps, enforcing viewer scope
/// and a per-(user, identity) decryption ceiling. Every successful
/// decrypt is audited.
pub struct VaultResolver {
    db: Arc<Mutex<DatabaseConnection>>,
    checker: Arc<PermissionChecker>,
    cipher: Aes256Gcm,
    limiters: Mutex<HashMap<(Uuid, Uuid), Arc<DefaultDirectRateLimiter>>>,
}

impl VaultResolver {
    pub fn new(
        db: Arc<Mutex<DatabaseConnection>>,
        checker: Arc<PermissionChecker>,
        config: &VaultConfig,
    ) -> Result<Self, ShellgateError> {
        let key = BASE64
            .decode(config.master_key.expose_secret().as_bytes())
            .map_err(|e| ShellgateError::BadRequest(format!("invalid vault master key: {e}")))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| ShellgateError::BadRequest("vault master key must be 32 bytes".into()))?;
        Ok(VaultResolver {
            db,
            checker,
            cipher,
            limiters: Mutex::new(HashMap::new()),
        })
    }

    pub async fn resolve_viewer(&self, user_id: Uuid) -> Result<Viewer, ShellgateError> {
        let is_root = self.checker.is_root(&user_id).await?;
        Ok(Viewer { user_id, is_root })
    }

    /// Decrypts and returns the secret map for `identity_id`, if the
    /// viewer may use it.
    pub async fn load_identity_secret(
        &self,
        viewer: &Viewer,
        identity_id: &Uuid,
    ) -> Result<Secret<HashMap<String, String>>, ShellgateError> {
        self.check_rate(viewer.user_id, *identity_id).await?;

        let identity = {
            let db = self.db.lock().await;
            Identity::Entity::find_by_id(*identity_id)
                .one(&*db)
                .await?
                .ok_or(ShellgateError::IdentityNotFound(*identity_id))?
        };

        if !viewer.is_root && !self.viewer_in_scope(viewer, &identity).await? {
            return Err(ShellgateError::PermissionDenied);
        }

        let secret = self.decrypt_payload(&identity.payload)?;
        info!(
            user_id=%viewer.user_id,
            identity_id=%identity.id,
            identity=%identity.name,
            "Identity secret decrypted"
        );
        Ok(Secret::new(secret))
    }

    /// Non-root access requires ownership, a share of at least `use`
    /// level, a team share for one of the viewer's teams, or an explicit
    /// identity permission grant.
    async fn viewer_in_scope(
        &self,
        viewer: &Viewer,
        identity: &Identity::Model,
    ) -> Result<bool, ShellgateError> {
        if identity.owner_user_id == Some(viewer.user_id) {
            return Ok(true);
        }

        let shares = {
            let db = self.db.lock().await;
            IdentityShare::Entity::find()
                .filter(IdentityShare::Column::IdentityId.eq(identity.id))
                .all(&*db)
                .await?
        };
        let teams = self.checker.team_ids_for_user(&viewer.user_id).await?;
        for share in &shares {
            if share.level < ShareLevel::Use {
                continue;
            }
            if share.user_id == Some(viewer.user_id) {
                return Ok(true);
            }
            if let Some(team) = share.team_id {
                if teams.contains(&team) {
                    return Ok(true);
                }
            }
        }

        // Team-scoped identities are usable by all team members.
        if identity.scope == IdentityScope::Team {
            if let Some(team) = identity.team_id {
                if teams.contains(&team) {
                    return Ok(true);
                }
            }
        }

        self.checker
            .user_has_resource_permission(&viewer.user_id, "identity", &identity.id, PERM_IDENTITY_USE)
            .await
    }

    async fn check_rate(&self, user_id: Uuid, identity_id: Uuid) -> Result<(), ShellgateError> {
        let limiter = {
            let mut limiters = self.limiters.lock().await;
            limiters
                .entry((user_id, identity_id))
                .or_insert_with(|| {
                    #[allow(clippy::unwrap_used)]
                    let quota =
                        Quota::per_minute(NonZeroU32::new(VAULT_DECRYPTS_PER_MINUTE).unwrap());
                    Arc::new(DefaultDirectRateLimiter::direct(quota))
                })
                .clone()
        };
        limiter
            .check()
            .map_err(|_| ShellgateError::VaultRateLimited)
    }

    fn decrypt_payload(&self, payload: &str) -> Result<HashMap<String, String>, ShellgateError> {
        let raw = BASE64
            .decode(payload.as_bytes())
            .map_err(|_| ShellgateError::VaultDecryptionFailed)?;
        if raw.len() <= NONCE_LEN {
            return Err(ShellgateError::VaultDecryptionFailed);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ShellgateError::VaultDecryptionFailed)?;
        serde_json::from_slice(&plaintext).map_err(|_| ShellgateError::VaultDecryptionFailed)
    }

    /// Seals a secret map into the stored payload form
    /// (`base64(nonce || ciphertext)`).
    pub fn encrypt_payload(
        &self,
        secret: &HashMap<String, String>,
    ) -> Result<String, ShellgateError> {
        let plaintext = serde_json::to_vec(secret)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| ShellgateError::VaultDecryptionFailed)?;
        let mut raw = nonce.to_vec();
        raw.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> VaultResolver {
        let db = Arc::new(Mutex::new(DatabaseConnection::default()));
        let checker = Arc::new(PermissionChecker::new(db.clone()));
        let config = VaultConfig {
            master_key: Secret::new(BASE64.encode(&[7u8; 32])),
        };
        VaultResolver::new(db, checker, &config).unwrap()
    }

    #[test]
    fn payload_round_trip() {
        let vault = resolver();
        let mut secret = HashMap::new();
        secret.insert("password".to_owned(), "hunter2".to_owned());
        secret.insert("username".to_owned(), "root".to_owned());

        let sealed = vault.encrypt_payload(&secret).unwrap();
        let opened = vault.decrypt_payload(&sealed).unwrap();
        assert_eq!(opened, secret);
    }

    #[test]
    fn tampered_payload_fails() {
        let vault = resolver();
        let mut secret = HashMap::new();
        secret.insert("password".to_owned(), "hunter2".to_owned());
        let sealed = vault.encrypt_payload(&secret).unwrap();

        let mut raw = BASE64.decode(sealed.as_bytes()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = BASE64.encode(&raw);
        assert!(matches!(
            vault.decrypt_payload(&tampered),
            Err(ShellgateError::VaultDecryptionFailed)
        ));
    }

    #[test]
    fn short_payload_fails() {
        let vault = resolver();
        assert!(matches!(
            vault.decrypt_payload(&BASE64.encode(&[0u8; 4])),
            Err(ShellgateError::VaultDecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn decrypt_rate_is_capped() {
        let vault = resolver();
        let user = Uuid::new_v4();
        let identity = Uuid::new_v4();
        for _ in 0..VAULT_DECRYPTS_PER_MINUTE {
            vault.check_rate(user, identity).await.unwrap();
        }
        assert!(matches!(
            vault.check_rate(user, identity).await,
            Err(ShellgateError::VaultRateLimited)
        ));
        // A different identity has its own budget.
        assert!(vault.check_rate(user, Uuid::new_v4()).await.is_ok());
    }
}
