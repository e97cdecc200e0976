//! In-process stand-in for a remote `scp`, serving a local directory.
//!
//! [`MockTransport`] answers `scp -t` and `scp -f` commands by running a peer task on the other end
//! of a `tokio::io::duplex` pair. It records the control lines it receives and can be told to
//! misbehave.

#![allow(dead_code)]

use anyhow::{Context, anyhow};
use futures::FutureExt;
use futures::future::BoxFuture;
use remote::protocol::{self, ControlLine};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

type PeerReader = tokio::io::BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>;
type PeerWriter = tokio::io::WriteHalf<tokio::io::DuplexStream>;

#[derive(Debug, Clone)]
pub enum Fault {
    /// The sink rejects the n-th control line (1-based) with this message.
    Reject(usize, String),
    /// The source sends only half of every file and hangs up.
    Truncate,
    /// The source sends everything, then exits with a failure status.
    ExitFailure,
}

#[derive(Debug, Default)]
pub struct MockTransport {
    /// Commands opened, as displayed.
    pub commands: std::sync::Mutex<Vec<String>>,
    /// Control lines received by sinks, without the trailing newline.
    pub received: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    pub fault: Option<Fault>,
}

impl MockTransport {
    pub fn with_fault(fault: Fault) -> Self {
        Self {
            fault: Some(fault),
            ..Default::default()
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

struct MockProcess {
    peer: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl remote::RemoteProcess for MockProcess {
    fn wait(self: Box<Self>) -> BoxFuture<'static, anyhow::Result<()>> {
        async move {
            match self.peer.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(anyhow!("remote scp exited with status Some(1): {error:#}")),
                Err(error) => Err(anyhow!("remote scp crashed: {error}")),
            }
        }
        .boxed()
    }
}

impl remote::Transport for MockTransport {
    async fn open(&self, command: &remote::RemoteCommand) -> anyhow::Result<remote::Channel> {
        self.commands.lock().unwrap().push(command.to_string());
        let [flags, path] = command.args.as_slice() else {
            return Err(anyhow!("unexpected command {command}"));
        };
        let flags = flags.trim_start_matches('-').to_string();
        let path = std::path::PathBuf::from(path);
        let (client, peer) = tokio::io::duplex(64 * 1024);
        let (client_reader, client_writer) = tokio::io::split(client);
        let (peer_reader, peer_writer) = tokio::io::split(peer);
        let peer_reader = tokio::io::BufReader::new(peer_reader);
        let recursive = flags.contains('r');
        let keep_time = flags.contains('p');
        let fault = self.fault.clone();
        let peer = if flags.contains('t') {
            let received = self.received.clone();
            tokio::spawn(run_sink(
                peer_reader,
                peer_writer,
                path,
                recursive,
                received,
                fault,
            ))
        } else if flags.contains('f') {
            tokio::spawn(run_source(
                peer_reader,
                peer_writer,
                path,
                recursive,
                keep_time,
                fault,
            ))
        } else {
            return Err(anyhow!("unexpected flags {flags:?}"));
        };
        Ok(remote::Channel {
            reader: Box::new(client_reader),
            writer: Box::new(client_writer),
            process: Box::new(MockProcess { peer }),
        })
    }
}

async fn reply(writer: &mut PeerWriter, bytes: &[u8]) -> anyhow::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn reject(writer: &mut PeerWriter, message: &str) -> anyhow::Error {
    let mut bytes = vec![1u8];
    bytes.extend(message.as_bytes());
    bytes.push(b'\n');
    if let Err(error) = reply(writer, &bytes).await {
        return error;
    }
    anyhow!("{message}")
}

async fn apply(
    path: &std::path::Path,
    mode: u32,
    times: Option<(i64, i64)>,
) -> anyhow::Result<()> {
    common::meta::set_mode(path, mode).await?;
    if let Some((mtime, atime)) = times {
        common::meta::set_times(path, atime, mtime).await?;
    }
    Ok(())
}

/// Behaves like `scp -t <target>`.
async fn run_sink(
    mut reader: PeerReader,
    mut writer: PeerWriter,
    target: std::path::PathBuf,
    recursive: bool,
    received: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    fault: Option<Fault>,
) -> anyhow::Result<()> {
    reply(&mut writer, &[0]).await?;
    let target_is_dir = target.is_dir();
    let mut stack: Vec<(std::path::PathBuf, u32, Option<(i64, i64)>)> = vec![];
    let mut times = None;
    let mut count = 0;
    loop {
        let mut bytes = vec![];
        if reader.read_until(b'\n', &mut bytes).await? == 0 {
            break;
        }
        let text = String::from_utf8(bytes)?.trim_end_matches('\n').to_string();
        received.lock().unwrap().push(text.clone());
        count += 1;
        if let Some(Fault::Reject(at, message)) = &fault {
            if *at == count {
                return Err(reject(&mut writer, message).await);
            }
        }
        let line = ControlLine::decode(&text)?;
        let destination = |name: &str| match stack.last() {
            Some((dir, _, _)) => dir.join(name),
            None if target_is_dir => target.join(name),
            None => target.clone(),
        };
        match line {
            ControlLine::Time { mtime, atime } => {
                times = Some((mtime, atime));
                reply(&mut writer, &[0]).await?;
            }
            ControlLine::File { mode, size, name } => {
                let path = destination(&name);
                reply(&mut writer, &[0]).await?;
                let mut content = vec![0; size as usize];
                reader.read_exact(&mut content).await?;
                let status = reader.read_u8().await?;
                if status != 0 {
                    return Err(anyhow!("sender failed {name:?}"));
                }
                tokio::fs::write(&path, &content)
                    .await
                    .with_context(|| format!("cannot write {path:?}"))?;
                apply(&path, mode, times.take()).await?;
                reply(&mut writer, &[0]).await?;
            }
            ControlLine::Dir { mode, name } => {
                if !recursive {
                    return Err(reject(&mut writer, "scp: received directory without -r").await);
                }
                let path = destination(&name);
                if !path.is_dir() {
                    tokio::fs::create_dir(&path).await?;
                }
                stack.push((path, mode, times.take()));
                reply(&mut writer, &[0]).await?;
            }
            ControlLine::EndDir => {
                let (path, mode, times) = stack.pop().context("E outside of a directory")?;
                apply(&path, mode, times).await?;
                reply(&mut writer, &[0]).await?;
            }
        }
    }
    Ok(())
}

async fn expect_ack(reader: &mut PeerReader) -> anyhow::Result<()> {
    protocol::read_response(reader).await?;
    Ok(())
}

async fn send(writer: &mut PeerWriter, line: &ControlLine) -> anyhow::Result<()> {
    reply(writer, line.encode().as_bytes()).await
}

fn send_entry<'a>(
    reader: &'a mut PeerReader,
    writer: &'a mut PeerWriter,
    path: &'a std::path::Path,
    keep_time: bool,
    fault: &'a Option<Fault>,
) -> BoxFuture<'a, anyhow::Result<()>> {
    async move {
        let meta = common::meta::probe(path).await?;
        if keep_time {
            send(
                writer,
                &ControlLine::Time {
                    mtime: meta.mtime,
                    atime: meta.atime,
                },
            )
            .await?;
            expect_ack(reader).await?;
        }
        if meta.is_dir {
            send(
                writer,
                &ControlLine::Dir {
                    mode: meta.mode,
                    name: meta.name.clone(),
                },
            )
            .await?;
            expect_ack(reader).await?;
            let mut children = vec![];
            let mut entries = tokio::fs::read_dir(path).await?;
            while let Some(entry) = entries.next_entry().await? {
                children.push(entry.path());
            }
            children.sort();
            for child in &children {
                send_entry(reader, writer, child, keep_time, fault).await?;
            }
            send(writer, &ControlLine::EndDir).await?;
            expect_ack(reader).await?;
            return Ok(());
        }
        send(
            writer,
            &ControlLine::File {
                mode: meta.mode,
                size: meta.size,
                name: meta.name.clone(),
            },
        )
        .await?;
        expect_ack(reader).await?;
        let content = tokio::fs::read(path).await?;
        if let Some(Fault::Truncate) = fault {
            reply(writer, &content[..content.len() / 2]).await?;
            writer.shutdown().await?;
            return Err(anyhow!("lost connection"));
        }
        reply(writer, &content).await?;
        reply(writer, &[0]).await?;
        expect_ack(reader).await
    }
    .boxed()
}

/// Behaves like `scp -f <path>`.
async fn run_source(
    mut reader: PeerReader,
    mut writer: PeerWriter,
    path: std::path::PathBuf,
    recursive: bool,
    keep_time: bool,
    fault: Option<Fault>,
) -> anyhow::Result<()> {
    expect_ack(&mut reader).await?;
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(_) => {
            let message = format!("scp: {}: No such file or directory", path.display());
            return Err(reject(&mut writer, &message).await);
        }
    };
    if metadata.is_dir() && !recursive {
        let message = format!("scp: {}: not a regular file", path.display());
        return Err(reject(&mut writer, &message).await);
    }
    send_entry(&mut reader, &mut writer, &path, keep_time, &fault).await?;
    writer.shutdown().await?;
    if let Some(Fault::ExitFailure) = fault {
        return Err(anyhow!("scp: failed to close {}", path.display()));
    }
    Ok(())
}

/// Sets both times of `path` to fixed values.
pub fn set_times(path: &std::path::Path, atime: i64, mtime: i64) -> anyhow::Result<()> {
    filetime::set_file_times(
        path,
        filetime::FileTime::from_unix_time(atime, 0),
        filetime::FileTime::from_unix_time(mtime, 0),
    )?;
    Ok(())
}

/// `(atime, mtime)` of `path` in whole seconds.
pub fn times(path: &std::path::Path) -> anyhow::Result<(i64, i64)> {
    let metadata = std::fs::metadata(path)?;
    Ok(common::meta::access_modify_times(&metadata))
}

#[cfg(unix)]
pub fn mode(path: &std::path::Path) -> anyhow::Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(std::fs::metadata(path)?.permissions().mode() & 0o7777)
}
