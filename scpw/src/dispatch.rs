//! Picks the transfer for one local/remote path pair.
//!
//! Uploads: a local directory is sent recursively; a local path ending in `*` sends the
//! directory's contents without the directory itself. Downloads: a remote path ending in `/` (or
//! `\`) is fetched recursively, anything else as a single file. Downloads are staged at a
//! temporary sibling of their destination and only moved into place once complete; an existing
//! destination is moved aside first, never overwritten in place.

use crate::{Error, Summary};
use common::config::Direction;
use common::progress::ProgressSink;
use remote::{Session, Transport};

/// Last component of a remote path, ignoring trailing separators.
pub fn remote_basename(path: &str) -> Option<&str> {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
}

async fn upload<T: Transport>(
    session: &Session<T>,
    local: &str,
    remote_path: &str,
    cancel: &tokio_util::sync::CancellationToken,
    progress: &dyn ProgressSink,
) -> Result<Summary, Error> {
    let (local, exclude_root) = match local.strip_suffix('*') {
        Some("") => (".", true),
        Some(stripped) => (stripped, true),
        None => (local, false),
    };
    let local = std::path::Path::new(local);
    let metadata = tokio::fs::metadata(local)
        .await
        .map_err(|error| Error::filesystem("stat", local, error))?;
    if !metadata.is_dir() {
        return crate::upload::put_file(session, local, remote_path, progress).await;
    }
    if exclude_root {
        crate::upload::put_all_exclude_root(session, local, remote_path, cancel, progress).await
    } else {
        crate::upload::put_all(session, local, remote_path, cancel, progress).await
    }
}

async fn download_dir<T: Transport>(
    session: &Session<T>,
    local: &std::path::Path,
    remote_dir: &str,
    progress: &dyn ProgressSink,
) -> Result<Summary, Error> {
    crate::download::require_dir(local).await?;
    let name = remote_basename(remote_dir).ok_or_else(|| {
        Error::Validation(format!(
            "cannot tell the directory name of remote path {remote_dir:?}"
        ))
    })?;
    let staging = common::replace::temp_sibling(&local.join(name));
    tokio::fs::create_dir(&staging)
        .await
        .map_err(|error| Error::filesystem("create directory", &staging, error))?;
    let result = async {
        let summary = crate::download::get_all(session, &staging, remote_dir, progress).await?;
        let replaced = common::replace::replace_dir(&staging, local, name).await?;
        tracing::debug!("installed {:?}", &replaced.path);
        Ok::<_, Error>(summary)
    }
    .await;
    if result.is_err() {
        common::replace::discard(&staging).await;
    }
    result
}

async fn download_file<T: Transport>(
    session: &Session<T>,
    local: &std::path::Path,
    remote_path: &str,
    progress: &dyn ProgressSink,
) -> Result<Summary, Error> {
    let staging = common::replace::temp_sibling(local);
    let result = async {
        let summary = crate::download::get_file(session, &staging, remote_path, progress).await?;
        let replaced = common::replace::replace_file(&staging, local).await?;
        tracing::debug!("installed {:?}", &replaced.path);
        Ok::<_, Error>(summary)
    }
    .await;
    if result.is_err() {
        common::replace::discard(&staging).await;
    }
    result
}

/// Transfers one path pair in `direction`.
pub async fn transfer<T: Transport>(
    session: &Session<T>,
    local: &str,
    remote_path: &str,
    direction: Direction,
    cancel: &tokio_util::sync::CancellationToken,
    progress: &dyn ProgressSink,
) -> Result<Summary, Error> {
    match direction {
        Direction::Put => upload(session, local, remote_path, cancel, progress).await,
        Direction::Get => {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let local = std::path::Path::new(local);
            match remote_path.strip_suffix(['/', '\\']) {
                Some(remote_dir) => download_dir(session, local, remote_dir, progress).await,
                None => download_file(session, local, remote_path, progress).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_of_remote_paths() {
        assert_eq!(remote_basename("/srv/data"), Some("data"));
        assert_eq!(remote_basename("/srv/data/"), Some("data"));
        assert_eq!(remote_basename("C:\\logs\\app\\"), Some("app"));
        assert_eq!(remote_basename("data"), Some("data"));
        assert_eq!(remote_basename("/"), None);
        assert_eq!(remote_basename(".."), None);
    }
}
