use shellgate_common::protocols::DriverError;

#[derive(Debug, thiserror::Error)]
pub enum SshClientError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Key(#[from] russh::keys::Error),

    #[error("could not resolve address")]
    Resolve,

    #[error("authentication failed")]
    Authentication,

    #[error("connection timed out")]
    Timeout,

    #[error("channel closed")]
    ChannelClosed,

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SshClientError> for DriverError {
    fn from(e: SshClientError) -> Self {
        match e {
            SshClientError::Authentication => DriverError::AuthFailed,
            SshClientError::Resolve => DriverError::Unreachable("could not resolve address".into()),
            SshClientError::Io(e) => DriverError::Unreachable(e.to_string()),
            SshClientError::Timeout => DriverError::Timeout,
            SshClientError::Ssh(e) => DriverError::Protocol(e.to_string()),
            SshClientError::Key(e) => DriverError::Protocol(e.to_string()),
            SshClientError::ChannelClosed => DriverError::Protocol("channel closed".into()),
        }
    }
}
