//! Pre-order walk of a local directory tree, producing the unit sequence an upload emits.
//!
//! For every directory the walker emits the directory itself, then all of its regular files in
//! listing order, then recurses into its subdirectories, then an [`WalkEvent::Exit`] marker.
//! Once the recursion returns to the root a single [`WalkEvent::Complete`] follows. Events go
//! through a bounded handoff queue so the walker never runs more than one unit ahead of the
//! consumer. Errors are forwarded through the same queue so the consumer stops on them.

use async_recursion::async_recursion;
use tracing::instrument;

/// One file or directory to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUnit {
    pub name: String,
    /// Absolute (or caller-relative) local path the content is read from.
    pub src: std::path::PathBuf,
    /// Path relative to the remote destination.
    pub dst: std::path::PathBuf,
    pub mode: u32,
    pub atime: i64,
    pub mtime: i64,
    /// Always 0 for directories.
    pub size: u64,
    pub is_dir: bool,
}

impl TransferUnit {
    fn new(src: &std::path::Path, dst_parent: &std::path::Path, meta: crate::meta::EntryMeta) -> Self {
        Self {
            dst: dst_parent.join(&meta.name),
            src: src.to_owned(),
            name: meta.name,
            mode: meta.mode,
            atime: meta.atime,
            mtime: meta.mtime,
            size: meta.size,
            is_dir: meta.is_dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEvent {
    Unit(TransferUnit),
    /// Leaves the most recently entered directory.
    Exit,
    /// The whole tree was emitted.
    Complete,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("walk cancelled")]
    Cancelled,
    #[error("failed to {action} {path:?}")]
    Filesystem {
        action: &'static str,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("walk consumer went away")]
    Disconnected,
}

pub type Sender = async_channel::Sender<Result<WalkEvent, Error>>;
pub type Receiver = async_channel::Receiver<Result<WalkEvent, Error>>;

/// Creates the handoff queue between the walker and its consumer.
pub fn handoff() -> (Sender, Receiver) {
    // async-channel has no zero-capacity rendezvous, one slot is the closest equivalent
    async_channel::bounded(1)
}

/// Walks `root` and sends every event to `sender`.
///
/// With `exclude_root` the root directory itself is not announced (no enter/exit pair), only its
/// contents. Cancellation is checked once per directory, before it is processed. A failed walk
/// forwards its error through the queue and returns `Ok`; `Err(Error::Disconnected)` is returned
/// only when the consumer dropped its end.
#[instrument(skip(cancel, sender))]
pub async fn walk(
    root: &std::path::Path,
    dst_prefix: &std::path::Path,
    exclude_root: bool,
    cancel: &tokio_util::sync::CancellationToken,
    sender: &Sender,
) -> Result<(), Error> {
    match walk_dir(root, dst_prefix, !exclude_root, cancel, sender).await {
        Ok(()) => {
            tracing::debug!("walk of {:?} complete", root);
            emit(sender, WalkEvent::Complete).await
        }
        Err(Error::Disconnected) => Err(Error::Disconnected),
        Err(error) => {
            tracing::debug!("walk of {:?} stopped: {:#}", root, &error);
            sender
                .send(Err(error))
                .await
                .map_err(|_| Error::Disconnected)
        }
    }
}

async fn emit(sender: &Sender, event: WalkEvent) -> Result<(), Error> {
    sender
        .send(Ok(event))
        .await
        .map_err(|_| Error::Disconnected)
}

#[async_recursion]
async fn walk_dir(
    dir: &std::path::Path,
    dst_parent: &std::path::Path,
    announce: bool,
    cancel: &tokio_util::sync::CancellationToken,
    sender: &Sender,
) -> Result<(), Error> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let dst = if announce {
        let meta = crate::meta::probe(dir)
            .await
            .map_err(|source| Error::Filesystem {
                action: "stat",
                path: dir.to_owned(),
                source,
            })?;
        let unit = TransferUnit::new(dir, dst_parent, meta);
        let dst = unit.dst.clone();
        emit(sender, WalkEvent::Unit(unit)).await?;
        dst
    } else {
        dst_parent.to_owned()
    };
    let read_error = |source| Error::Filesystem {
        action: "read directory",
        path: dir.to_owned(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_error)?;
    let mut subdirs = vec![];
    while let Some(entry) = entries.next_entry().await.map_err(read_error)? {
        let path = entry.path();
        let stat_error = |source| Error::Filesystem {
            action: "stat",
            path: path.clone(),
            source,
        };
        // symlinks are not descended into, only links to regular files are sent
        if entry.file_type().await.map_err(stat_error)?.is_dir() {
            subdirs.push(entry.path());
            continue;
        }
        let metadata = tokio::fs::metadata(&path).await.map_err(stat_error)?;
        if metadata.is_dir() {
            tracing::warn!("skipping {:?}: symlink to a directory", &path);
            continue;
        }
        if !metadata.is_file() {
            tracing::warn!("skipping {:?}: not a regular file or directory", &path);
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = crate::meta::EntryMeta::from_metadata(name, &metadata);
        emit(sender, WalkEvent::Unit(TransferUnit::new(&path, &dst, meta))).await?;
    }
    for subdir in subdirs {
        walk_dir(&subdir, &dst, true, cancel, sender).await?;
    }
    if announce {
        emit(sender, WalkEvent::Exit).await?;
    }
    Ok(())
}
