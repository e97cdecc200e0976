//! [`Transport`](crate::Transport) for nodes that log in with a password.
//!
//! The system `ssh` client cannot be handed a password non-interactively, so these nodes are served
//! by an in-process client. Every command runs on its own session channel of the one connection; a
//! pump task moves bytes between the channel and a pair of in-memory pipes.

use anyhow::{Context, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Accepts host keys the way `StrictHostKeyChecking=accept-new` does.
struct HostKeys {
    host: String,
    port: u16,
}

#[async_trait::async_trait]
impl russh::client::Handler for HostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::info!("adding host key of {}:{} to known hosts", &self.host, self.port);
                if let Err(error) =
                    russh_keys::learn_known_hosts(&self.host, self.port, server_public_key)
                {
                    tracing::warn!("failed to record host key of {}: {}", &self.host, &error);
                }
                Ok(true)
            }
            Err(error) => {
                tracing::error!("host key of {}:{} rejected: {}", &self.host, self.port, &error);
                Ok(false)
            }
        }
    }
}

pub struct PasswordTransport {
    handle: tokio::sync::Mutex<russh::client::Handle<HostKeys>>,
}

impl std::fmt::Debug for PasswordTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordTransport").finish_non_exhaustive()
    }
}

/// Connects to `host:port` and logs in as `user`.
#[instrument(skip(password))]
pub async fn connect(
    host: &str,
    port: u16,
    user: &str,
    password: &str,
) -> anyhow::Result<PasswordTransport> {
    let config = std::sync::Arc::new(russh::client::Config::default());
    let handler = HostKeys {
        host: host.to_string(),
        port,
    };
    let mut handle = russh::client::connect(config, (host, port), handler)
        .await
        .with_context(|| format!("failed to establish password ssh connection to {host}:{port}"))?;
    let accepted = handle
        .authenticate_password(user, password)
        .await
        .with_context(|| format!("password authentication of {user}@{host} failed"))?;
    if !accepted {
        return Err(anyhow!("{user}@{host}: password rejected"));
    }
    tracing::debug!("logged in to {}:{} as {}", host, port, user);
    Ok(PasswordTransport {
        handle: tokio::sync::Mutex::new(handle),
    })
}

impl PasswordTransport {
    pub async fn close(self) -> anyhow::Result<()> {
        self.handle
            .into_inner()
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
            .context("failed to close ssh connection")
    }
}

/// How the remote command ended.
#[derive(Debug, Default)]
struct Exit {
    status: Option<u32>,
    stderr: String,
}

enum Event {
    Input(std::io::Result<usize>),
    Message(Option<russh::ChannelMsg>),
}

async fn pump(
    mut channel: russh::Channel<russh::client::Msg>,
    mut input: tokio::io::DuplexStream,
    output: tokio::io::DuplexStream,
) -> anyhow::Result<Exit> {
    let mut buffer = vec![0u8; PIPE_CAPACITY];
    let mut input_open = true;
    let mut output = Some(output);
    let mut exit = Exit::default();
    loop {
        let event = tokio::select! {
            read = input.read(&mut buffer), if input_open => Event::Input(read),
            message = channel.wait() => Event::Message(message),
        };
        match event {
            Event::Input(Ok(0)) => {
                input_open = false;
                channel
                    .eof()
                    .await
                    .context("failed to close remote command input")?;
            }
            Event::Input(Ok(n)) => channel
                .data(&buffer[..n])
                .await
                .context("failed to send to remote command")?,
            Event::Input(Err(error)) => {
                return Err(error).context("failed to read remote command input");
            }
            Event::Message(Some(russh::ChannelMsg::Data { data })) => {
                if let Some(writer) = &mut output
                    && writer.write_all(&data).await.is_err()
                {
                    tracing::debug!("output of remote command no longer read");
                    output = None;
                }
            }
            Event::Message(Some(russh::ChannelMsg::ExtendedData { data, ext: 1 })) => {
                exit.stderr.push_str(&String::from_utf8_lossy(&data));
            }
            Event::Message(Some(russh::ChannelMsg::ExitStatus { exit_status })) => {
                exit.status = Some(exit_status);
            }
            Event::Message(Some(russh::ChannelMsg::Eof)) => {
                // reader sees end of stream
                output = None;
            }
            Event::Message(Some(russh::ChannelMsg::Close)) | Event::Message(None) => break,
            Event::Message(Some(_)) => {}
        }
    }
    Ok(exit)
}

struct ChannelProcess {
    command: String,
    pump: tokio::task::JoinHandle<anyhow::Result<Exit>>,
}

impl crate::RemoteProcess for ChannelProcess {
    fn wait(self: Box<Self>) -> futures::future::BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            let ChannelProcess { command, pump } = *self;
            let exit = pump
                .await
                .with_context(|| format!("channel of `{command}` crashed"))??;
            match exit.status {
                Some(0) => {
                    if !exit.stderr.trim().is_empty() {
                        tracing::warn!("remote scp: {}", exit.stderr.trim());
                    }
                    Ok(())
                }
                status => Err(anyhow!(
                    "remote scp exited with status {:?}: {}",
                    status,
                    exit.stderr.trim()
                )),
            }
        })
    }
}

impl crate::Transport for PasswordTransport {
    async fn open(&self, command: &crate::RemoteCommand) -> anyhow::Result<crate::Channel> {
        let mut channel = self
            .handle
            .lock()
            .await
            .channel_open_session()
            .await
            .context("failed to open ssh channel")?;
        channel
            .exec(true, command.to_string())
            .await
            .with_context(|| format!("failed to spawn `{command}`"))?;
        let (writer, pump_input) = tokio::io::duplex(PIPE_CAPACITY);
        let (reader, pump_output) = tokio::io::duplex(PIPE_CAPACITY);
        let pump = tokio::spawn(pump(channel, pump_input, pump_output));
        Ok(crate::Channel {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: Box::new(ChannelProcess {
                command: command.to_string(),
                pump,
            }),
        })
    }
}
