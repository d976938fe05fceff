use crate::channel::ChannelError;
use crate::launch::LaunchError;

/// Failures surfaced by lifecycle operations.
///
/// Stop failures never appear here: they are logged and swallowed so that a
/// stop always reaches the no-session state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No launch spec could be built (missing runtime, artifact, ...).
    #[error("cannot launch server: {0}")]
    Launch(#[from] LaunchError),
    /// The launch spec resolved but the channel failed to start.
    #[error("server failed to start: {0}")]
    Start(#[from] ChannelError),
    /// The controller has shut down and accepts no more operations.
    #[error("session controller is shut down")]
    QueueClosed,
    /// The operation panicked before reporting an outcome.
    #[error("lifecycle operation aborted")]
    Aborted,
}

impl SessionError {
    /// Whether `restart` is a sensible next step for the user.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Launch(_) | Self::Start(_))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_messages_include_cause() {
        let err = SessionError::from(LaunchError::MissingArtifact {
            path: PathBuf::from("/opt/server.jar"),
        });
        assert_eq!(
            err.to_string(),
            "cannot launch server: server artifact not found: /opt/server.jar"
        );

        let err = SessionError::from(ChannelError::Handshake("initialize timed out".into()));
        assert_eq!(
            err.to_string(),
            "server failed to start: server handshake failed: initialize timed out"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(SessionError::Start(ChannelError::Closed).is_retryable());
        assert!(!SessionError::QueueClosed.is_retryable());
        assert!(!SessionError::Aborted.is_retryable());
    }
}
