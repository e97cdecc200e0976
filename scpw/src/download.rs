//! Downloads: entries sent by a remote `scp -f`, materialized locally.
//!
//! Files get their mode and times once their content is complete. Directories are created
//! owner-writable so their children can be written, and get their announced mode and times when
//! their `E` line arrives.

use crate::error::settle;
use crate::link::Link;
use crate::{Error, Summary};
use common::progress::ProgressSink;
use remote::protocol::{Attr, AttrAssembler, CommandType, Times};
use remote::{ScpMode, Session, Transport};
use tracing::instrument;

fn parent_dir(path: &std::path::Path) -> &std::path::Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => std::path::Path::new("."),
    }
}

/// Fails unless `path` is an existing local directory.
pub(crate) async fn require_dir(path: &std::path::Path) -> Result<(), Error> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(Error::Validation(format!("{path:?} is not a directory"))),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Err(Error::Validation(
            format!("local directory {path:?} does not exist"),
        )),
        Err(error) => Err(Error::filesystem("stat", path, error)),
    }
}

async fn apply_attributes(
    path: &std::path::Path,
    mode: u32,
    times: Option<Times>,
) -> Result<(), Error> {
    common::meta::set_mode(path, mode)
        .await
        .map_err(|error| Error::filesystem("set permissions of", path, error))?;
    if let Some(times) = times {
        common::meta::set_times(path, times.atime, times.mtime)
            .await
            .map_err(|error| Error::filesystem("set times of", path, error))?;
    }
    Ok(())
}

/// Receives the content of the file announced by `attr` into `path`.
///
/// A partially written file is removed on failure.
async fn receive_file(
    link: &mut Link,
    path: &std::path::Path,
    attr: &Attr,
    progress: &dyn ProgressSink,
) -> Result<u64, Error> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|error| Error::filesystem("create", path, error))?;
    let received = async {
        link.ack().await?;
        let copied =
            remote::streams::recv_content(&mut link.reader, &mut file, attr.size, &attr.name, progress)
                .await?;
        link.response().await?;
        link.ack().await?;
        Ok::<_, Error>(copied)
    }
    .await;
    drop(file);
    let result = match received {
        Ok(copied) => apply_attributes(path, attr.mode, attr.times)
            .await
            .map(|()| copied),
        Err(error) => Err(error),
    };
    match result {
        Ok(copied) => {
            progress.finalize(&attr.name);
            tracing::debug!("received {:?} ({} bytes)", path, copied);
            Ok(copied)
        }
        Err(error) => {
            common::replace::discard(path).await;
            Err(error)
        }
    }
}

/// Reads lines until a complete entry is assembled, acknowledging each `T` line.
async fn next_entry(
    link: &mut Link,
    assembler: &mut AttrAssembler,
) -> Result<Option<Attr>, Error> {
    loop {
        let Some(line) = link.read_line().await? else {
            assembler.finish()?;
            return Ok(None);
        };
        match assembler.push(line)? {
            Some(attr) => return Ok(Some(attr)),
            None => link.ack().await?,
        }
    }
}

async fn receive_single(
    link: &mut Link,
    local: &std::path::Path,
    progress: &dyn ProgressSink,
) -> Result<Summary, Error> {
    link.ack().await?;
    let mut assembler = AttrAssembler::default();
    let attr = next_entry(link, &mut assembler)
        .await?
        .ok_or(Error::Protocol(remote::protocol::Error::UnexpectedEof))?;
    if attr.kind != CommandType::File {
        return Err(Error::Protocol(
            remote::protocol::Error::UnexpectedCommand {
                got: attr.kind,
                expected: "a file",
            },
        ));
    }
    let bytes_copied = receive_file(link, local, &attr, progress).await?;
    link.close().await?;
    Ok(Summary {
        bytes_copied,
        files_copied: 1,
        ..Default::default()
    })
}

/// Downloads the remote file `remote_path` to the local path `local`.
///
/// The parent of `local` must exist; it is checked before the remote command starts.
#[instrument(skip(session, progress))]
pub async fn get_file<T: Transport>(
    session: &Session<T>,
    local: &std::path::Path,
    remote_path: &str,
    progress: &dyn ProgressSink,
) -> Result<Summary, Error> {
    require_dir(parent_dir(local)).await?;
    let existed = tokio::fs::symlink_metadata(local).await.is_ok();
    let channel = session
        .open(ScpMode::Source, false, remote_path)
        .await
        .map_err(Error::Transport)?;
    let (mut link, process) = Link::split(channel);
    let driver = async move {
        let result = receive_single(&mut link, local, progress).await;
        if let Err(error) = &result {
            link.abort(error).await;
        }
        result
    };
    let (driven, exited) = tokio::join!(driver, process.wait());
    let settled = settle(driven, exited);
    if settled.is_err() && !existed {
        common::replace::discard(local).await;
    }
    settled
}

/// A directory entered but not yet closed by its `E` line.
struct Frame {
    path: std::path::PathBuf,
    mode: u32,
    times: Option<Times>,
    /// False when an existing directory was merged into.
    created: bool,
}

/// Creates `path` or merges into the directory already there; returns whether it was created.
async fn make_dir(path: &std::path::Path, mode: u32) -> Result<bool, Error> {
    let created = match tokio::fs::create_dir(path).await {
        Ok(()) => true,
        Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
            if !tokio::fs::metadata(path)
                .await
                .map_err(|error| Error::filesystem("stat", path, error))?
                .is_dir()
            {
                return Err(Error::filesystem("create directory", path, error));
            }
            tracing::debug!("merging into existing directory {:?}", path);
            false
        }
        Err(error) => return Err(Error::filesystem("create directory", path, error)),
    };
    common::meta::set_mode(path, mode | 0o700)
        .await
        .map_err(|error| Error::filesystem("set permissions of", path, error))?;
    Ok(created)
}

async fn receive_tree(
    link: &mut Link,
    root: &std::path::Path,
    created: &mut Vec<std::path::PathBuf>,
    progress: &dyn ProgressSink,
) -> Result<Summary, Error> {
    link.ack().await?;
    let mut assembler = AttrAssembler::default();
    let mut stack: Vec<Frame> = vec![];
    let mut summary = Summary::default();
    while let Some(attr) = next_entry(link, &mut assembler).await? {
        let current = stack.last().map_or(root, |frame| frame.path.as_path());
        // entries below a directory created here go away with it
        let tracked = stack.last().is_none_or(|frame| !frame.created);
        match attr.kind {
            CommandType::File => {
                let path = current.join(&attr.name);
                let existed = tokio::fs::symlink_metadata(&path).await.is_ok();
                summary.bytes_copied += receive_file(link, &path, &attr, progress).await?;
                summary.files_copied += 1;
                if tracked && !existed {
                    created.push(path);
                }
            }
            CommandType::Dir => {
                let path = current.join(&attr.name);
                let new = make_dir(&path, attr.mode).await?;
                if tracked && new {
                    created.push(path.clone());
                }
                link.ack().await?;
                tracing::debug!("entered {:?}", &path);
                stack.push(Frame {
                    path,
                    mode: attr.mode,
                    times: attr.times,
                    created: new,
                });
                summary.directories_created += 1;
            }
            CommandType::EndDir => {
                let Some(frame) = stack.pop() else {
                    return Err(Error::Protocol(
                        remote::protocol::Error::UnexpectedCommand {
                            got: CommandType::EndDir,
                            expected: "a file or directory at the top level",
                        },
                    ));
                };
                apply_attributes(&frame.path, frame.mode, frame.times).await?;
                link.ack().await?;
            }
            CommandType::Time => {
                return Err(Error::Protocol(remote::protocol::Error::DanglingTime));
            }
        }
    }
    if !stack.is_empty() {
        tracing::debug!("stream ended {} directories deep", stack.len());
        return Err(Error::Protocol(remote::protocol::Error::UnexpectedEof));
    }
    link.close().await?;
    Ok(summary)
}

/// Downloads the remote directory `remote_dir` recursively into the existing local directory
/// `local_dir`; the tree lands at `local_dir/<name of remote_dir>`.
///
/// On failure, the entries this call created are removed again; directories that already existed
/// are kept along with their previous content.
#[instrument(skip(session, progress))]
pub async fn get_all<T: Transport>(
    session: &Session<T>,
    local_dir: &std::path::Path,
    remote_dir: &str,
    progress: &dyn ProgressSink,
) -> Result<Summary, Error> {
    require_dir(local_dir).await?;
    let channel = session
        .open(ScpMode::Source, true, remote_dir)
        .await
        .map_err(Error::Transport)?;
    let (mut link, process) = Link::split(channel);
    let driver = async move {
        let mut created = vec![];
        let result = receive_tree(&mut link, local_dir, &mut created, progress).await;
        if let Err(error) = &result {
            link.abort(error).await;
        }
        (result, created)
    };
    let ((driven, created), exited) = tokio::join!(driver, process.wait());
    let settled = settle(driven, exited);
    if settled.is_err() {
        for path in created.iter().rev() {
            common::replace::discard(path).await;
        }
    }
    settled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_parent_to_cwd() {
        assert_eq!(
            parent_dir(std::path::Path::new("file.txt")),
            std::path::Path::new(".")
        );
        assert_eq!(
            parent_dir(std::path::Path::new("/tmp/file.txt")),
            std::path::Path::new("/tmp")
        );
    }

    #[tokio::test]
    async fn missing_directory_is_a_validation_error() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let error = require_dir(&tmp.path().join("nope")).await.unwrap_err();
        assert!(matches!(error, Error::Validation(_)));
        let file = tmp.path().join("f");
        tokio::fs::write(&file, "x").await?;
        let error = require_dir(&file).await.unwrap_err();
        assert!(matches!(error, Error::Validation(_)));
        require_dir(tmp.path()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn existing_directory_is_merged() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("d");
        assert!(make_dir(&dir, 0o500).await?);
        assert!(!make_dir(&dir, 0o755).await?);
        assert!(dir.is_dir());
        let file = tmp.path().join("f");
        tokio::fs::write(&file, "x").await?;
        assert!(matches!(
            make_dir(&file, 0o755).await,
            Err(Error::Filesystem(_))
        ));
        Ok(())
    }
}
