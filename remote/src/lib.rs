//! Remote side of `scpw`: running `scp` on the remote host and speaking its wire protocol.
//!
//! [`Transport`] is the narrow seam to the authenticated connection: it runs one command and hands
//! back its byte streams. [`Session`] pairs a shared transport with the time-preservation setting
//! and knows how to spawn the four `scp` modes. [`ssh`] implements the transport on top of the
//! system OpenSSH client, [`password`] on top of an in-process client for password logins.

use anyhow::Context;

pub mod password;
pub mod protocol;
pub mod ssh;
pub mod streams;

pub use ssh::{Auth, Connection, SshTarget, SshTransport, connect};

/// Write half of a channel (remote stdin).
pub type BoxedWrite = Box<dyn tokio::io::AsyncWrite + Unpin + Send>;
/// Read half of a channel (remote stdout).
pub type BoxedRead = Box<dyn tokio::io::AsyncRead + Unpin + Send>;

/// A program and its arguments to run on the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub program: String,
    pub args: Vec<String>,
}

fn quote(arg: &str) -> std::borrow::Cow<'_, str> {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        return arg.into();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted.into()
}

impl std::fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

/// Handle on a running remote command.
pub trait RemoteProcess: Send {
    /// Waits for the command to exit; a non-zero exit status is an error.
    fn wait(self: Box<Self>) -> futures::future::BoxFuture<'static, anyhow::Result<()>>;
}

/// Duplex byte channel bound to one remote command. Dropping (or shutting down) `writer` closes
/// the command's input.
pub struct Channel {
    pub reader: BoxedRead,
    pub writer: BoxedWrite,
    pub process: Box<dyn RemoteProcess>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

/// Something that can run commands on the remote host, many at a time.
pub trait Transport: Send + Sync + 'static {
    fn open(
        &self,
        command: &RemoteCommand,
    ) -> impl std::future::Future<Output = anyhow::Result<Channel>> + Send;
}

/// Which end of the copy the remote `scp` plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScpMode {
    /// `scp -t`: the remote receives.
    Sink,
    /// `scp -f`: the remote sends.
    Source,
}

impl ScpMode {
    fn flag(self) -> char {
        match self {
            ScpMode::Sink => 't',
            ScpMode::Source => 'f',
        }
    }
}

/// A connection plus the time-preservation setting, shared by all transfers over it.
#[derive(Debug)]
pub struct Session<T> {
    transport: std::sync::Arc<T>,
    keep_time: bool,
}

impl<T> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            keep_time: self.keep_time,
        }
    }
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, keep_time: bool) -> Self {
        Self {
            transport: std::sync::Arc::new(transport),
            keep_time,
        }
    }

    pub fn keep_time(&self) -> bool {
        self.keep_time
    }

    /// `"p"` when times are preserved, empty otherwise.
    pub fn time_option(&self) -> &'static str {
        if self.keep_time { "p" } else { "" }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Gives the transport back once no other clone of the session holds it.
    pub fn into_transport(self) -> Option<T> {
        std::sync::Arc::try_unwrap(self.transport).ok()
    }

    /// `scp -[r]{t|f}[p] <path>`
    pub fn scp_command(&self, mode: ScpMode, recursive: bool, path: &str) -> RemoteCommand {
        let flags = format!(
            "-{}{}{}",
            if recursive { "r" } else { "" },
            mode.flag(),
            self.time_option()
        );
        RemoteCommand {
            program: "scp".to_string(),
            args: vec![flags, path.to_string()],
        }
    }

    /// Spawns the remote `scp` for one transfer.
    pub async fn open(&self, mode: ScpMode, recursive: bool, path: &str) -> anyhow::Result<Channel> {
        let command = self.scp_command(mode, recursive, path);
        tracing::debug!("starting remote `{}`", &command);
        self.transport
            .open(&command)
            .await
            .with_context(|| format!("failed to start remote `{command}`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoTransport;

    impl Transport for NoTransport {
        async fn open(&self, command: &RemoteCommand) -> anyhow::Result<Channel> {
            Err(anyhow::anyhow!("cannot run {command}"))
        }
    }

    #[test]
    fn command_templates() {
        let session = Session::new(NoTransport, true);
        assert_eq!(
            session
                .scp_command(ScpMode::Sink, false, "/tmp/dst")
                .to_string(),
            "scp -tp /tmp/dst"
        );
        assert_eq!(
            session
                .scp_command(ScpMode::Source, true, "/tmp/my dir")
                .to_string(),
            "scp -rfp \"/tmp/my dir\""
        );
        let session = Session::new(NoTransport, false);
        assert_eq!(session.time_option(), "");
        assert_eq!(
            session.scp_command(ScpMode::Sink, true, "dst").args,
            vec!["-rt".to_string(), "dst".to_string()]
        );
        assert_eq!(
            session.scp_command(ScpMode::Source, false, "a").args[0],
            "-f"
        );
    }

    #[test]
    fn quoting_escapes_shell_characters() {
        assert_eq!(quote("plain/path.txt"), "plain/path.txt");
        assert_eq!(quote(""), "\"\"");
        assert_eq!(quote("a$b\"c"), "\"a\\$b\\\"c\"");
    }

    #[tokio::test]
    async fn open_failure_names_the_command() {
        let session = Session::new(NoTransport, false);
        let error = session
            .open(ScpMode::Source, false, "/x")
            .await
            .unwrap_err();
        assert!(format!("{error:#}").contains("failed to start remote `scp -f /x`"));
    }
}
