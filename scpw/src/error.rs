/// Why a transfer failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening, reading or writing the channel failed, or the remote command died.
    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),
    /// The peer sent something unexpected or rejected a line.
    #[error("protocol error: {0}")]
    Protocol(remote::protocol::Error),
    /// A local (or, reported by the remote, remote-side) filesystem operation failed.
    #[error("filesystem error: {0:#}")]
    Filesystem(anyhow::Error),
    #[error("transfer cancelled")]
    Cancelled,
    /// The request cannot be carried out; nothing was sent.
    #[error("{0}")]
    Validation(String),
}

impl Error {
    pub(crate) fn filesystem(action: &str, path: &std::path::Path, error: std::io::Error) -> Self {
        Error::Filesystem(anyhow::Error::new(error).context(format!("failed to {action} {path:?}")))
    }

    /// The channel went away, so the remote exit status likely says more.
    pub(crate) fn is_channel_loss(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Protocol(error) => error.is_channel(),
            _ => false,
        }
    }
}

impl From<remote::protocol::Error> for Error {
    fn from(error: remote::protocol::Error) -> Self {
        match error {
            remote::protocol::Error::Channel(source) => {
                Error::Transport(anyhow::Error::new(source).context("channel i/o failed"))
            }
            remote::protocol::Error::Local { .. } => Error::Filesystem(anyhow::Error::new(error)),
            error => Error::Protocol(error),
        }
    }
}

impl From<common::walk::Error> for Error {
    fn from(error: common::walk::Error) -> Self {
        match error {
            common::walk::Error::Cancelled => Error::Cancelled,
            common::walk::Error::Disconnected => {
                Error::Transport(anyhow::Error::new(error).context("upload stopped"))
            }
            error => Error::Filesystem(anyhow::Error::new(error)),
        }
    }
}

impl From<common::replace::Error> for Error {
    fn from(error: common::replace::Error) -> Self {
        Error::Filesystem(anyhow::Error::new(error))
    }
}

/// Combines the result of the protocol driver with the remote exit status.
///
/// The driver's error wins unless it only saw the channel disappear, in which case the exit
/// status (and the stderr it carries) is the better explanation.
pub(crate) fn settle<T>(driver: Result<T, Error>, process: anyhow::Result<()>) -> Result<T, Error> {
    match (driver, process) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(error), Err(exit)) if error.is_channel_loss() => {
            tracing::debug!("channel lost ({}), remote exit: {:#}", &error, &exit);
            Err(Error::Transport(exit))
        }
        (Err(error), _) => Err(error),
        (Ok(_), Err(exit)) => Err(Error::Transport(exit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_errors_are_routed_by_origin() {
        let error: Error = remote::protocol::Error::Channel(std::io::Error::from(
            std::io::ErrorKind::BrokenPipe,
        ))
        .into();
        assert!(matches!(error, Error::Transport(_)));
        let error: Error = remote::protocol::Error::Local {
            name: "a".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        }
        .into();
        assert!(matches!(error, Error::Filesystem(_)));
        let error: Error = remote::protocol::Error::Rejected {
            code: 1,
            message: "scp: /x: Permission denied".to_string(),
        }
        .into();
        assert_eq!(
            error.to_string(),
            "protocol error: scp: /x: Permission denied"
        );
    }

    #[test]
    fn cancellation_is_distinct() {
        let error: Error = common::walk::Error::Cancelled.into();
        assert!(matches!(error, Error::Cancelled));
        assert!(!error.is_channel_loss());
    }

    #[test]
    fn settle_prefers_exit_status_after_channel_loss() {
        let lost = Err::<(), _>(Error::Protocol(remote::protocol::Error::UnexpectedEof));
        let result = settle(lost, Err(anyhow::anyhow!("scp: command not found")));
        match result {
            Err(Error::Transport(error)) => assert!(error.to_string().contains("not found")),
            other => panic!("unexpected {other:?}"),
        }
        let rejected = Err::<(), _>(Error::Protocol(remote::protocol::Error::Rejected {
            code: 1,
            message: "nope".to_string(),
        }));
        let result = settle(rejected, Err(anyhow::anyhow!("exit 1")));
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(matches!(
            settle(Ok(5), Err(anyhow::anyhow!("exit 1"))),
            Err(Error::Transport(_))
        ));
        assert_eq!(settle(Ok(5), Ok(())).unwrap(), 5);
    }
}
