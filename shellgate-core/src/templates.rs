use std::collections::HashMap;

use serde_json::Value;
use shellgate_common::TemplateSnapshot;
use shellgate_db_entities::Connection;

/// A version-tagged mapping from a connection's stored fields to driver
/// configuration defaults.
#[derive(Debug, Clone)]
pub struct TemplateDef {
    pub version: String,
    pub defaults: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: HashMap<String, TemplateDef>,
}

#[derive(Debug, Clone)]
pub struct MaterializedConfig {
    pub host: String,
    pub port: u16,
    pub settings: HashMap<String, Value>,
    pub template: TemplateSnapshot,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, id: &str, def: TemplateDef) -> Self {
        self.templates.insert(id.to_owned(), def);
        self
    }

    pub fn get(&self, id: &str) -> Option<&TemplateDef> {
        self.templates.get(id)
    }

    /// Deterministically fills target host/port and settings: template
    /// defaults first, overlaid by the connection's stored settings.
    /// A fingerprint differing from the current template version raises
    /// the mismatch flag without blocking the launch; a connection with
    /// no matching template falls back to its stored fields alone.
    pub fn materialize(&self, connection: &Connection::Model) -> MaterializedConfig {
        let stored: HashMap<String, Value> = connection
            .settings
            .as_object()
            .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let template_def = connection
            .template_id
            .as_deref()
            .and_then(|id| self.get(id));

        let (settings, template) = match template_def {
            Some(def) => {
                let mut settings = def.defaults.clone();
                settings.extend(stored);
                let mismatch = connection
                    .template_fingerprint
                    .as_deref()
                    .map(|fp| fp != def.version)
                    .unwrap_or(false);
                (
                    settings,
                    TemplateSnapshot {
                        id: connection.template_id.clone(),
                        version: Some(def.version.clone()),
                        version_mismatch: mismatch,
                    },
                )
            }
            None => (
                stored,
                TemplateSnapshot {
                    id: connection.template_id.clone(),
                    version: None,
                    version_mismatch: false,
                },
            ),
        };

        let host = settings
            .get("host")
            .and_then(|v| v.as_str())
            .unwrap_or(&connection.host)
            .to_owned();
        let port = settings
            .get("port")
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(connection.port as u16);

        MaterializedConfig {
            host,
            port,
            settings,
            template,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn connection(template_id: Option<&str>, fingerprint: Option<&str>) -> Connection::Model {
        Connection::Model {
            id: Uuid::new_v4(),
            name: "box".into(),
            protocol_id: "ssh".into(),
            owner_user_id: Uuid::new_v4(),
            team_id: None,
            host: "stored.internal".into(),
            port: 2222,
            settings: serde_json::json!({"keepalive": true}),
            identity_id: None,
            template_id: template_id.map(|s| s.to_owned()),
            template_fingerprint: fingerprint.map(|s| s.to_owned()),
            concurrent_limit: None,
            allow_duplicate_sessions: None,
            enable_sftp: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn catalog() -> TemplateCatalog {
        TemplateCatalog::new().with_template(
            "ssh-default",
            TemplateDef {
                version: "2024-06-01".into(),
                defaults: HashMap::from([
                    ("port".to_owned(), serde_json::json!(22)),
                    ("strict_host_keys".to_owned(), serde_json::json!(false)),
                ]),
            },
        )
    }

    #[test]
    fn stored_settings_override_template_defaults() {
        let catalog = catalog();
        let mut conn = connection(Some("ssh-default"), Some("2024-06-01"));
        conn.settings = serde_json::json!({"port": 2200});
        let config = catalog.materialize(&conn);
        assert_eq!(config.port, 2200);
        assert_eq!(config.settings["strict_host_keys"], serde_json::json!(false));
        assert!(!config.template.version_mismatch);
    }

    #[test]
    fn fingerprint_mismatch_raises_flag_but_still_materializes() {
        let catalog = catalog();
        let conn = connection(Some("ssh-default"), Some("2024-01-01"));
        let config = catalog.materialize(&conn);
        assert!(config.template.version_mismatch);
        assert_eq!(config.host, "stored.internal");
    }

    #[test]
    fn unknown_template_falls_back_to_stored_fields() {
        let catalog = catalog();
        let conn = connection(Some("missing"), Some("v1"));
        let config = catalog.materialize(&conn);
        assert_eq!(config.host, "stored.internal");
        assert_eq!(config.port, 2222);
        assert!(config.template.version.is_none());
        assert!(!config.template.version_mismatch);
    }

    #[test]
    fn materialization_is_deterministic() {
        let catalog = catalog();
        let conn = connection(Some("ssh-default"), Some("2024-06-01"));
        let a = catalog.materialize(&conn);
        let b = catalog.materialize(&conn);
        assert_eq!(a.host, b.host);
        assert_eq!(a.port, b.port);
        assert_eq!(a.settings, b.settings);
    }
}
