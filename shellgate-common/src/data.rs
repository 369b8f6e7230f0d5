use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::protocols::TerminalSize;
use crate::{RecordingMode, RecordingStorageKind, RecordingsConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
}

/// Effective recording policy frozen into session metadata at launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingPolicySnapshot {
    pub mode: RecordingMode,
    pub storage: RecordingStorageKind,
    pub retention_days: u32,
    pub require_consent: bool,
}

impl From<&RecordingsConfig> for RecordingPolicySnapshot {
    fn from(config: &RecordingsConfig) -> Self {
        RecordingPolicySnapshot {
            mode: config.mode,
            storage: config.storage,
            retention_days: config.retention_days,
            require_consent: config.require_consent,
        }
    }
}

impl RecordingPolicySnapshot {
    /// `forced` always records, `disabled` never does, `optional` follows
    /// the launch request.
    pub fn should_record(&self, requested: bool) -> bool {
        match self.mode {
            RecordingMode::Forced => true,
            RecordingMode::Disabled => false,
            RecordingMode::Optional => requested,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemplateSnapshot {
    pub id: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub version_mismatch: bool,
}

/// Per-session metadata blob persisted alongside the session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub recording_policy: RecordingPolicySnapshot,
    pub recording_enabled: bool,
    pub sftp_enabled: bool,
    pub terminal: TerminalSize,
    #[serde(default)]
    pub template: TemplateSnapshot,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Returned by the launch endpoint: everything the client needs to open
/// the WebSocket tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    pub url: String,
    pub token: String,
    pub protocol: String,
    pub params: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_policy_always_records() {
        let snapshot = RecordingPolicySnapshot {
            mode: RecordingMode::Forced,
            storage: RecordingStorageKind::Filesystem,
            retention_days: 0,
            require_consent: false,
        };
        assert!(snapshot.should_record(false));
        assert!(snapshot.should_record(true));
    }

    #[test]
    fn optional_policy_follows_request() {
        let snapshot = RecordingPolicySnapshot {
            mode: RecordingMode::Optional,
            storage: RecordingStorageKind::Filesystem,
            retention_days: 0,
            require_consent: false,
        };
        assert!(!snapshot.should_record(false));
        assert!(snapshot.should_record(true));
    }

    #[test]
    fn disabled_policy_never_records() {
        let snapshot = RecordingPolicySnapshot {
            mode: RecordingMode::Disabled,
            storage: RecordingStorageKind::Filesystem,
            retention_days: 7,
            require_consent: true,
        };
        assert!(!snapshot.should_record(true));
    }
}
