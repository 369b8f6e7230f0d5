/// Named realtime streams clients may subscribe to.
pub const STREAM_NOTIFICATIONS: &str = "notifications";
pub const STREAM_CONNECTION_SESSIONS: &str = "connection_sessions";
pub const STREAM_SSH_TERMINAL: &str = "ssh_terminal";
pub const STREAM_SFTP_TRANSFERS: &str = "sftp_transfers";

pub const WELL_KNOWN_STREAMS: &[&str] = &[
    STREAM_NOTIFICATIONS,
    STREAM_CONNECTION_SESSIONS,
    STREAM_SSH_TERMINAL,
    STREAM_SFTP_TRANSFERS,
];

/// Live chat messages kept in memory per session; older entries are read
/// back from the database.
pub const CHAT_RING_CAPACITY: usize = 200;

/// Queued-but-unwritten recording bytes beyond this close the recording
/// instead of blocking the terminal bridge.
pub const RECORDING_BYTE_BUDGET: usize = 4 * 1024 * 1024;

/// Identity secret decryptions allowed per user and identity per minute.
pub const VAULT_DECRYPTS_PER_MINUTE: u32 = 5;

pub const BUILTIN_ADMIN_ROLE_NAME: &str = "shellgate:admin";
