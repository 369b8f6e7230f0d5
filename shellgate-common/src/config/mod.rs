mod defaults;

use std::path::PathBuf;
use std::time::Duration;

use defaults::*;
use serde::{Deserialize, Serialize};

use crate::Secret;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    #[default]
    Disabled,
    Optional,
    Forced,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStorageKind {
    #[default]
    Filesystem,
    S3,
}

/// Recording policy as configured. A snapshot of the effective policy is
/// copied into session metadata at launch; later config changes do not
/// affect live sessions.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecordingsConfig {
    #[serde(default)]
    pub mode: RecordingMode,

    #[serde(default)]
    pub storage: RecordingStorageKind,

    #[serde(default = "_default_recordings_path")]
    pub path: String,

    #[serde(default = "_default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "_default_false")]
    pub require_consent: bool,
}

impl Default for RecordingsConfig {
    fn default() -> Self {
        RecordingsConfig {
            mode: RecordingMode::default(),
            storage: RecordingStorageKind::default(),
            path: _default_recordings_path(),
            retention_days: _default_retention_days(),
            require_consent: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionPolicyConfig {
    /// 0 means unlimited.
    #[serde(default = "_default_concurrent_limit")]
    pub concurrent_limit_default: u32,

    #[serde(default = "_default_true")]
    pub enable_sftp_default: bool,

    /// Whether one user may hold several open sessions to the same
    /// connection.
    #[serde(default = "_default_true")]
    pub allow_duplicate_connections: bool,
}

impl Default for SessionPolicyConfig {
    fn default() -> Self {
        SessionPolicyConfig {
            concurrent_limit_default: 0,
            enable_sftp_default: true,
            allow_duplicate_connections: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "_default_http_listen")]
    pub listen: String,

    /// Extra origins accepted for WebSocket upgrades beside same-host and
    /// loopback.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            listen: _default_http_listen(),
            allowed_origins: vec![],
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct JwtConfig {
    pub secret: Secret<String>,

    #[serde(default = "_default_jwt_issuer")]
    pub issuer: String,

    #[serde(default = "_default_access_ttl", with = "humantime_serde")]
    pub access_ttl: Duration,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SshDriverConfig {
    #[serde(default = "_default_true")]
    pub enable: bool,

    #[serde(default = "_default_ssh_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(default = "_default_terminal_type")]
    pub terminal_type: String,
}

impl Default for SshDriverConfig {
    fn default() -> Self {
        SshDriverConfig {
            enable: true,
            connect_timeout: _default_ssh_connect_timeout(),
            terminal_type: _default_terminal_type(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VaultConfig {
    /// Base64-encoded 256-bit AEAD key for identity payloads.
    pub master_key: Secret<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ShellgateConfig {
    #[serde(default = "_default_database_url")]
    pub database_url: Secret<String>,

    #[serde(default)]
    pub http: HttpConfig,

    pub jwt: JwtConfig,

    #[serde(default)]
    pub recordings: RecordingsConfig,

    #[serde(default)]
    pub sessions: SessionPolicyConfig,

    #[serde(default)]
    pub ssh: SshDriverConfig,

    pub vault: VaultConfig,

    #[serde(skip)]
    pub paths_relative_to: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let yaml = r#"
jwt:
  secret: test-secret
vault:
  master_key: AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=
"#;
        let config: ShellgateConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.recordings.mode, RecordingMode::Disabled);
        assert_eq!(config.sessions.concurrent_limit_default, 0);
        assert!(config.sessions.enable_sftp_default);
        assert_eq!(config.http.listen, "0.0.0.0:8888");
        assert_eq!(config.jwt.issuer, "shellgate");
    }

    #[test]
    fn recording_mode_round_trips() {
        let yaml = "mode: forced\nstorage: s3\nretention_days: 30\nrequire_consent: true\n";
        let config: RecordingsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mode, RecordingMode::Forced);
        assert_eq!(config.storage, RecordingStorageKind::S3);
        assert_eq!(config.retention_days, 30);
        assert!(config.require_consent);
    }
}
