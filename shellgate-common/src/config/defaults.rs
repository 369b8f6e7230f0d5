use std::time::Duration;

use crate::Secret;

pub(crate) fn _default_database_url() -> Secret<String> {
    Secret::new("sqlite:data".to_owned())
}

pub(crate) fn _default_true() -> bool {
    true
}

pub(crate) fn _default_false() -> bool {
    false
}

pub(crate) fn _default_http_listen() -> String {
    "0.0.0.0:8888".to_owned()
}

pub(crate) fn _default_jwt_issuer() -> String {
    "shellgate".to_owned()
}

pub(crate) fn _default_access_ttl() -> Duration {
    Duration::from_secs(3600 * 8)
}

pub(crate) fn _default_recordings_path() -> String {
    "recordings".to_owned()
}

pub(crate) fn _default_retention_days() -> u32 {
    0
}

pub(crate) fn _default_concurrent_limit() -> u32 {
    0
}

pub(crate) fn _default_ssh_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

pub(crate) fn _default_terminal_type() -> String {
    "xterm-256color".to_owned()
}
