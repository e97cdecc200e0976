//! Uploads: local files and trees sent to a remote `scp -t`.

use crate::error::settle;
use crate::link::Link;
use crate::{Error, Summary};
use common::progress::ProgressSink;
use common::walk::{TransferUnit, WalkEvent};
use remote::protocol::ControlLine;
use remote::{ScpMode, Session, Transport};
use tracing::instrument;

/// `dir/name` in remote path syntax.
pub fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

async fn stat(path: &std::path::Path) -> Result<common::meta::EntryMeta, Error> {
    common::meta::probe(path)
        .await
        .map_err(|error| Error::filesystem("stat", path, error))
}

async fn open_source(path: &std::path::Path) -> Result<tokio::fs::File, Error> {
    tokio::fs::File::open(path)
        .await
        .map_err(|error| Error::filesystem("open", path, error))
}

async fn send_times(link: &mut Link, unit: &TransferUnit) -> Result<(), Error> {
    link.request(&ControlLine::Time {
        mtime: unit.mtime,
        atime: unit.atime,
    })
    .await
}

/// Announces one regular file, streams its content and waits for the peer to confirm it.
async fn send_file(
    link: &mut Link,
    keep_time: bool,
    unit: &TransferUnit,
    file: &mut tokio::fs::File,
    progress: &dyn ProgressSink,
) -> Result<u64, Error> {
    if keep_time {
        send_times(link, unit).await?;
    }
    link.request(&ControlLine::File {
        mode: unit.mode,
        size: unit.size,
        name: unit.name.clone(),
    })
    .await?;
    let copied =
        remote::streams::send_content(file, &mut link.writer, unit.size, &unit.name, progress)
            .await?;
    link.ack().await?;
    link.response().await?;
    progress.finalize(&unit.name);
    tracing::debug!("sent {:?} ({} bytes)", &unit.src, copied);
    Ok(copied)
}

/// Uploads the regular file `local` to `remote_path`.
///
/// If `remote_path` is an existing remote directory the file lands inside it under its local
/// name, otherwise it is written to `remote_path` itself.
#[instrument(skip(session, progress))]
pub async fn put_file<T: Transport>(
    session: &Session<T>,
    local: &std::path::Path,
    remote_path: &str,
    progress: &dyn ProgressSink,
) -> Result<Summary, Error> {
    let meta = stat(local).await?;
    if meta.is_dir {
        return Err(Error::Validation(format!(
            "{local:?} is a directory, it can only be uploaded recursively"
        )));
    }
    let mut file = open_source(local).await?;
    let unit = TransferUnit {
        dst: std::path::PathBuf::from(&meta.name),
        src: local.to_owned(),
        name: meta.name,
        mode: meta.mode,
        atime: meta.atime,
        mtime: meta.mtime,
        size: meta.size,
        is_dir: false,
    };
    let channel = session
        .open(ScpMode::Sink, false, remote_path)
        .await
        .map_err(Error::Transport)?;
    let (mut link, process) = Link::split(channel);
    let keep_time = session.keep_time();
    // owns the link so the remote input closes as soon as the driver is done, even on error
    let driver = async move {
        link.response().await?;
        let bytes_copied = send_file(&mut link, keep_time, &unit, &mut file, progress).await?;
        link.close().await?;
        Ok::<_, Error>(Summary {
            bytes_copied,
            files_copied: 1,
            ..Default::default()
        })
    };
    let (driven, exited) = tokio::join!(driver, process.wait());
    settle(driven, exited)
}

/// Sends walker events until the walk completes.
async fn send_tree(
    mut link: Link,
    receiver: common::walk::Receiver,
    keep_time: bool,
    progress: &dyn ProgressSink,
) -> Result<Summary, Error> {
    link.response().await?;
    let mut summary = Summary::default();
    loop {
        let event = match receiver.recv().await {
            Ok(event) => event?,
            Err(_) => {
                return Err(Error::Filesystem(anyhow::anyhow!(
                    "tree walk ended before completing"
                )));
            }
        };
        match event {
            WalkEvent::Unit(unit) if unit.is_dir => {
                if keep_time {
                    send_times(&mut link, &unit).await?;
                }
                link.request(&ControlLine::Dir {
                    mode: unit.mode,
                    name: unit.name.clone(),
                })
                .await?;
                summary.directories_created += 1;
            }
            WalkEvent::Unit(unit) => {
                let mut file = open_source(&unit.src).await?;
                summary.bytes_copied +=
                    send_file(&mut link, keep_time, &unit, &mut file, progress).await?;
                summary.files_copied += 1;
            }
            WalkEvent::Exit => link.request(&ControlLine::EndDir).await?,
            WalkEvent::Complete => break,
        }
    }
    link.close().await?;
    Ok(summary)
}

/// Uploads the directory `local` recursively into the remote directory `remote_dir`.
///
/// The walk and the protocol run concurrently, linked by a one-slot queue. Cancellation is
/// honored at directory boundaries.
#[instrument(skip(session, cancel, progress))]
pub async fn put_all<T: Transport>(
    session: &Session<T>,
    local: &std::path::Path,
    remote_dir: &str,
    cancel: &tokio_util::sync::CancellationToken,
    progress: &dyn ProgressSink,
) -> Result<Summary, Error> {
    if !stat(local).await?.is_dir {
        return Err(Error::Validation(format!("{local:?} is not a directory")));
    }
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let channel = session
        .open(ScpMode::Sink, true, remote_dir)
        .await
        .map_err(Error::Transport)?;
    let (link, process) = Link::split(channel);
    let (sender, receiver) = common::walk::handoff();
    let keep_time = session.keep_time();
    let walker = async move {
        common::walk::walk(local, std::path::Path::new(""), false, cancel, &sender).await
    };
    let consumer = send_tree(link, receiver, keep_time, progress);
    let (walked, driven, exited) = tokio::join!(walker, consumer, process.wait());
    let driven = match (driven, walked) {
        (Ok(_), Err(error)) => Err(error.into()),
        (driven, walked) => {
            if let Err(error) = walked {
                tracing::debug!("walker stopped: {}", &error);
            }
            driven
        }
    };
    settle(driven, exited)
}

/// Uploads the contents of `local` (not the directory itself) into `remote_dir`.
///
/// Each child is its own transfer: subdirectories through [`put_all`] into `remote_dir`, files
/// through [`put_file`] to `remote_dir/<name>`. Children run one after another and the first
/// failure stops the rest.
#[instrument(skip(session, cancel, progress))]
pub async fn put_all_exclude_root<T: Transport>(
    session: &Session<T>,
    local: &std::path::Path,
    remote_dir: &str,
    cancel: &tokio_util::sync::CancellationToken,
    progress: &dyn ProgressSink,
) -> Result<Summary, Error> {
    if !stat(local).await?.is_dir {
        return Err(Error::Validation(format!("{local:?} is not a directory")));
    }
    let mut entries = tokio::fs::read_dir(local)
        .await
        .map_err(|error| Error::filesystem("read directory", local, error))?;
    let mut summary = Summary::default();
    loop {
        let entry = entries
            .next_entry()
            .await
            .map_err(|error| Error::filesystem("read directory", local, error))?;
        let Some(entry) = entry else {
            break;
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let path = entry.path();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|error| Error::filesystem("stat", &path, error))?;
        if metadata.is_dir() {
            summary = summary + put_all(session, &path, remote_dir, cancel, progress).await?;
        } else if metadata.is_file() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let remote_path = remote_join(remote_dir, &name);
            summary = summary + put_file(session, &path, &remote_path, progress).await?;
        } else {
            tracing::warn!("skipping {:?}: not a regular file or directory", &path);
        }
    }
    Ok(summary)
}
