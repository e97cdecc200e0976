//! [`Transport`](crate::Transport) over one multiplexed OpenSSH connection.
//!
//! Key-based logins use whatever the system `ssh` client does non-interactively: a key file from
//! the inventory, the ssh-agent, or the user's ssh config. Nodes that only carry a password are
//! served by [`crate::password`] instead; [`connect`] picks one per node.

use anyhow::{Context, anyhow};
use tracing::instrument;

/// How to log in.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// A key file, or the ssh-agent and ssh config when `None`.
    Key(Option<std::path::PathBuf>),
    Password(String),
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Key(keypath) => f.debug_tuple("Key").field(keypath).finish(),
            Auth::Password(_) => f.write_str("Password(..)"),
        }
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub auth: Auth,
}

fn expand_home(path: &std::path::Path) -> std::path::PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => std::path::PathBuf::from(home).join(rest),
        _ => path.to_owned(),
    }
}

impl SshTarget {
    /// Validates an inventory node and extracts its connection settings.
    pub fn from_node(node: &common::config::Node) -> anyhow::Result<Self> {
        if node.host.trim().is_empty() {
            return Err(anyhow!("node {:?} has no host", node.name));
        }
        let auth = match (&node.keypath, &node.password) {
            (None, Some(password)) => Auth::Password(password.clone()),
            (keypath, password) => {
                if password.is_some() {
                    tracing::warn!(
                        "node {:?}: ignoring password, authenticating with {:?}",
                        node.name,
                        keypath
                    );
                }
                Auth::Key(keypath.as_deref().map(expand_home))
            }
        };
        Ok(Self {
            host: node.host.trim().to_string(),
            user: Some(node.user.trim().to_string()).filter(|user| !user.is_empty()),
            port: node.port,
            auth,
        })
    }

    /// `ssh://[user@]host[:port]`
    pub fn destination(&self) -> String {
        let host = self.host.as_str();
        match (self.user.as_deref(), self.port) {
            (Some(user), Some(port)) => format!("ssh://{user}@{host}:{port}"),
            (None, Some(port)) => format!("ssh://{host}:{port}"),
            (Some(user), None) => format!("ssh://{user}@{host}"),
            (None, None) => format!("ssh://{host}"),
        }
    }

    /// Login name for password logins, which have no ssh config to fall back on.
    fn login(&self) -> anyhow::Result<String> {
        match &self.user {
            Some(user) => Ok(user.clone()),
            None => std::env::var("USER").with_context(|| {
                format!("no user configured for {} and $USER is not set", self.host)
            }),
        }
    }
}

#[derive(Debug)]
pub struct SshTransport {
    session: std::sync::Arc<openssh::Session>,
}

/// An open connection of either kind.
#[derive(Debug)]
pub enum Connection {
    OpenSsh(SshTransport),
    Password(crate::password::PasswordTransport),
}

/// Opens the connection all transfers to `target` share.
#[instrument]
pub async fn connect(target: &SshTarget) -> anyhow::Result<Connection> {
    match &target.auth {
        Auth::Key(keypath) => Ok(Connection::OpenSsh(
            connect_openssh(&target.destination(), keypath.as_deref()).await?,
        )),
        Auth::Password(password) => {
            let login = target.login()?;
            let port = target.port.unwrap_or(22);
            Ok(Connection::Password(
                crate::password::connect(&target.host, port, &login, password).await?,
            ))
        }
    }
}

async fn connect_openssh(
    destination: &str,
    keypath: Option<&std::path::Path>,
) -> anyhow::Result<SshTransport> {
    tracing::debug!("connecting to {}", destination);
    let mut builder = openssh::SessionBuilder::default();
    builder.known_hosts_check(openssh::KnownHosts::Add);
    if let Some(keypath) = keypath {
        builder.keyfile(keypath);
    }
    let session = builder
        .connect(destination)
        .await
        .with_context(|| format!("failed to establish ssh connection to {destination}"))?;
    Ok(SshTransport {
        session: std::sync::Arc::new(session),
    })
}

impl Connection {
    /// Closes the connection once no channel uses it anymore.
    pub async fn close(self) -> anyhow::Result<()> {
        match self {
            Connection::OpenSsh(transport) => transport.close().await,
            Connection::Password(transport) => transport.close().await,
        }
    }
}

impl crate::Transport for Connection {
    async fn open(&self, command: &crate::RemoteCommand) -> anyhow::Result<crate::Channel> {
        match self {
            Connection::OpenSsh(transport) => transport.open(command).await,
            Connection::Password(transport) => transport.open(command).await,
        }
    }
}

impl SshTransport {
    pub async fn close(self) -> anyhow::Result<()> {
        match std::sync::Arc::try_unwrap(self.session) {
            Ok(session) => session
                .close()
                .await
                .context("failed to close ssh connection"),
            Err(_) => {
                tracing::debug!("ssh connection still shared, leaving it to drop");
                Ok(())
            }
        }
    }
}

struct SshProcess {
    command: String,
    child: openssh::Child<std::sync::Arc<openssh::Session>>,
    stderr: Option<openssh::ChildStderr>,
}

impl crate::RemoteProcess for SshProcess {
    fn wait(self: Box<Self>) -> futures::future::BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            use tokio::io::AsyncReadExt;
            let SshProcess {
                command,
                child,
                stderr,
            } = *self;
            let read_stderr = async move {
                let mut text = String::new();
                let Some(mut stderr) = stderr else {
                    return text;
                };
                if let Err(error) = stderr.read_to_string(&mut text).await {
                    tracing::debug!("failed to read stderr of `{}`: {}", &command, &error);
                }
                text
            };
            let (status, stderr) = tokio::join!(child.wait(), read_stderr);
            let status = status.context("failed waiting for remote scp")?;
            if !status.success() {
                return Err(anyhow!(
                    "remote scp exited with status {:?}: {}",
                    status.code(),
                    stderr.trim()
                ));
            }
            if !stderr.trim().is_empty() {
                tracing::warn!("remote scp: {}", stderr.trim());
            }
            Ok(())
        })
    }
}

impl crate::Transport for SshTransport {
    async fn open(&self, command: &crate::RemoteCommand) -> anyhow::Result<crate::Channel> {
        let mut cmd = self.session.clone().arc_command(command.program.clone());
        cmd.args(&command.args)
            .stdin(openssh::Stdio::piped())
            .stdout(openssh::Stdio::piped())
            .stderr(openssh::Stdio::piped());
        let mut child = cmd
            .spawn()
            .await
            .with_context(|| format!("failed to spawn `{command}`"))?;
        let writer = child
            .stdin()
            .take()
            .context("remote command has no stdin")?;
        let reader = child
            .stdout()
            .take()
            .context("remote command has no stdout")?;
        let stderr = child.stderr().take();
        Ok(crate::Channel {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: Box::new(SshProcess {
                command: command.to_string(),
                child,
                stderr,
            }),
        })
    }
}
