use poem::error::ResponseError;
use poem::http::StatusCode;
use uuid::Uuid;

use crate::protocols::{DriverError, HandleError, SftpError};

/// Gateway-wide error type. Every variant carries a stable machine-readable
/// code that crosses the HTTP boundary unchanged.
#[derive(thiserror::Error, Debug)]
pub enum ShellgateError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    SerializeJson(#[from] serde_json::Error),
    #[error("failed to parse URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("authentication required")]
    Unauthorized,
    #[error("permission denied")]
    PermissionDenied,

    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("access to session denied")]
    SessionAccessDenied,
    #[error("concurrent session limit ({0}) reached")]
    ConcurrentLimit(u32),
    #[error("an active session for this connection already exists")]
    ActiveSessionExists,
    #[error("session tunnel unavailable")]
    TunnelUnavailable,
    #[error("session handle unavailable")]
    HandleUnavailable,
    #[error("session handle does not support this operation")]
    HandleIncompatible,
    #[error("session lifecycle service unavailable")]
    LifecycleUnavailable,

    #[error("connection {0} not found")]
    ConnectionNotFound(Uuid),
    #[error("no identity linked to connection {0}")]
    IdentityNotLinked(Uuid),
    #[error("identity {0} not found")]
    IdentityNotFound(Uuid),
    #[error("identity secret decryption rate limit exceeded")]
    VaultRateLimited,
    #[error("identity payload could not be decrypted")]
    VaultDecryptionFailed,

    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error(transparent)]
    Sftp(#[from] SftpError),

    #[error("recording is not available for this session")]
    RecordingUnavailable,
    #[error("recording stopped: writer queue overflow")]
    RecordingOverflow,

    #[error("{0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("requested range not satisfiable")]
    RangeInvalid,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ShellgateError {
    /// Stable error code surfaced in the API envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::PermissionDenied => "forbidden",
            Self::SessionNotFound(_) => "session.not_found",
            Self::SessionAccessDenied => "session.access_denied",
            Self::ConcurrentLimit(_) => "session.concurrent_limit",
            Self::ActiveSessionExists => "session.active_exists",
            Self::TunnelUnavailable => "session.tunnel_unavailable",
            Self::HandleUnavailable | Self::Handle(_) => "session.handle_unavailable",
            Self::HandleIncompatible => "session.handle_incompatible",
            Self::LifecycleUnavailable => "session.lifecycle_unavailable",
            Self::ConnectionNotFound(_) => "not_found",
            Self::IdentityNotLinked(_) => "bad_request",
            Self::IdentityNotFound(_) => "not_found",
            Self::VaultRateLimited => "vault.rate_limited",
            Self::VaultDecryptionFailed => "vault.decryption_failed",
            Self::Driver(e) => e.code(),
            Self::Sftp(e) => e.code(),
            Self::RecordingUnavailable => "recording.unavailable",
            Self::RecordingOverflow => "recording.overflow",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::RangeInvalid => "sftp.range_invalid",
            Self::Database(_)
            | Self::Io(_)
            | Self::SerializeJson(_)
            | Self::UrlParse(_)
            | Self::Anyhow(_) => "internal",
        }
    }
}

impl ResponseError for ShellgateError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied | Self::SessionAccessDenied => StatusCode::FORBIDDEN,
            Self::SessionNotFound(_)
            | Self::ConnectionNotFound(_)
            | Self::IdentityNotFound(_)
            | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ConcurrentLimit(_) | Self::VaultRateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::ActiveSessionExists | Self::HandleUnavailable | Self::Handle(_) => {
                StatusCode::CONFLICT
            }
            Self::HandleIncompatible | Self::RecordingUnavailable => StatusCode::NOT_IMPLEMENTED,
            Self::TunnelUnavailable | Self::Driver(_) => StatusCode::BAD_GATEWAY,
            Self::BadRequest(_) | Self::IdentityNotLinked(_) => StatusCode::BAD_REQUEST,
            Self::RangeInvalid => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Sftp(e) => match e {
                SftpError::NotFound(_) => StatusCode::NOT_FOUND,
                SftpError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                SftpError::FileTooLarge | SftpError::UploadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                SftpError::RangeInvalid => StatusCode::RANGE_NOT_SATISFIABLE,
                SftpError::SessionNotFound => StatusCode::NOT_FOUND,
                SftpError::InvalidPath(_) => StatusCode::BAD_REQUEST,
                SftpError::Other(_) => StatusCode::BAD_GATEWAY,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ShellgateError::ConcurrentLimit(2).code(), "session.concurrent_limit");
        assert_eq!(ShellgateError::ActiveSessionExists.code(), "session.active_exists");
        assert_eq!(ShellgateError::VaultRateLimited.code(), "vault.rate_limited");
        assert_eq!(
            ShellgateError::Driver(DriverError::AuthFailed).code(),
            "driver.auth_failed"
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            ShellgateError::ConcurrentLimit(1).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ShellgateError::ActiveSessionExists.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ShellgateError::RangeInvalid.status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
    }
}
