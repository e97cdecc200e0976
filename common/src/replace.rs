//! Moving a finished download from its temporary location into place.
//!
//! Downloads land in a randomized sibling of the destination first. Once complete, any existing
//! destination is renamed aside (kept, not deleted) and the download is renamed over it. Each step
//! is a plain rename, so the swap is only as atomic as `rename(2)` on the filesystem holding both
//! paths; a failure between the two renames leaves the destination absent and the backup in place.

use rand::Rng;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to move existing {path:?} aside to {backup:?}")]
    Backup {
        path: std::path::PathBuf,
        backup: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to move {from:?} into place at {to:?}")]
    Install {
        from: std::path::PathBuf,
        to: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("downloaded tree in {root:?} has no entry named {name:?}")]
    MissingSubtree {
        root: std::path::PathBuf,
        name: String,
    },
    #[error("failed to remove temporary directory {path:?}")]
    Cleanup {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where a replaced destination ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replaced {
    pub path: std::path::PathBuf,
    /// Previous content at `path`, if there was any.
    pub backup: Option<std::path::PathBuf>,
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Randomized temporary path next to `path`, used as the download target.
pub fn temp_sibling(path: &std::path::Path) -> std::path::PathBuf {
    let name = format!(".scpw-{}", random_suffix());
    match path.parent() {
        Some(parent) => parent.join(name),
        None => std::path::PathBuf::from(name),
    }
}

fn backup_path(path: &std::path::Path) -> std::path::PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}.{}.bak", name, random_suffix()))
}

async fn move_aside(path: &std::path::Path) -> Result<Option<std::path::PathBuf>, Error> {
    let backup = backup_path(path);
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(Error::Backup {
                path: path.to_owned(),
                backup,
                source,
            });
        }
    }
    tokio::fs::rename(path, &backup)
        .await
        .map_err(|source| Error::Backup {
            path: path.to_owned(),
            backup: backup.clone(),
            source,
        })?;
    tracing::info!("moved existing {:?} aside to {:?}", path, &backup);
    Ok(Some(backup))
}

async fn install(from: &std::path::Path, to: &std::path::Path) -> Result<(), Error> {
    tokio::fs::rename(from, to)
        .await
        .map_err(|source| Error::Install {
            from: from.to_owned(),
            to: to.to_owned(),
            source,
        })
}

/// Replaces `dst` with the downloaded file at `tmp`.
pub async fn replace_file(tmp: &std::path::Path, dst: &std::path::Path) -> Result<Replaced, Error> {
    let backup = move_aside(dst).await?;
    install(tmp, dst).await?;
    Ok(Replaced {
        path: dst.to_owned(),
        backup,
    })
}

/// Moves `tmp_root/<name>` to `dst_parent/<name>` and removes `tmp_root`.
pub async fn replace_dir(
    tmp_root: &std::path::Path,
    dst_parent: &std::path::Path,
    name: &str,
) -> Result<Replaced, Error> {
    let subtree = tmp_root.join(name);
    if tokio::fs::symlink_metadata(&subtree).await.is_err() {
        return Err(Error::MissingSubtree {
            root: tmp_root.to_owned(),
            name: name.to_string(),
        });
    }
    let dst = dst_parent.join(name);
    let backup = move_aside(&dst).await?;
    install(&subtree, &dst).await?;
    tokio::fs::remove_dir_all(tmp_root)
        .await
        .map_err(|source| Error::Cleanup {
            path: tmp_root.to_owned(),
            source,
        })?;
    Ok(Replaced { path: dst, backup })
}

/// Best-effort removal of a temporary file or directory left by a failed download.
pub async fn discard(path: &std::path::Path) {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    };
    if let Err(error) = result {
        tracing::warn!("failed to remove {:?}: {}", path, &error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn temp_sibling_shares_parent() {
        let path = std::path::Path::new("/some/dir/file.txt");
        let first = temp_sibling(path);
        let second = temp_sibling(path);
        assert_eq!(first.parent(), Some(std::path::Path::new("/some/dir")));
        assert_ne!(first, second);
        assert_ne!(first, path);
    }

    #[tokio::test]
    async fn replace_file_without_existing_destination() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let dst = tmp_dir.path().join("file");
        let tmp = temp_sibling(&dst);
        tokio::fs::write(&tmp, "new").await?;
        let replaced = replace_file(&tmp, &dst).await?;
        assert_eq!(replaced.backup, None);
        assert_eq!(tokio::fs::read_to_string(&dst).await?, "new");
        assert!(!tmp.exists());
        Ok(())
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn replace_file_keeps_previous_content_aside() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let dst = tmp_dir.path().join("file");
        tokio::fs::write(&dst, "old").await?;
        let tmp = temp_sibling(&dst);
        tokio::fs::write(&tmp, "new").await?;
        let replaced = replace_file(&tmp, &dst).await?;
        let backup = replaced.backup.expect("existing file should be backed up");
        assert_eq!(backup.parent(), dst.parent());
        assert_eq!(tokio::fs::read_to_string(&dst).await?, "new");
        assert_eq!(tokio::fs::read_to_string(&backup).await?, "old");
        assert!(logs_contain("moved existing"));
        Ok(())
    }

    #[tokio::test]
    async fn replace_dir_moves_matching_subtree() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let dst_parent = tmp_dir.path().join("local");
        tokio::fs::create_dir_all(dst_parent.join("tree")).await?;
        tokio::fs::write(dst_parent.join("tree").join("stale.txt"), "stale").await?;
        let tmp_root = temp_sibling(&dst_parent);
        tokio::fs::create_dir_all(tmp_root.join("tree").join("sub")).await?;
        tokio::fs::write(tmp_root.join("tree").join("sub").join("a.txt"), "a").await?;
        let replaced = replace_dir(&tmp_root, &dst_parent, "tree").await?;
        assert_eq!(replaced.path, dst_parent.join("tree"));
        assert_eq!(
            tokio::fs::read_to_string(dst_parent.join("tree/sub/a.txt")).await?,
            "a"
        );
        assert!(!dst_parent.join("tree/stale.txt").exists());
        let backup = replaced.backup.expect("existing tree should be backed up");
        assert_eq!(tokio::fs::read_to_string(backup.join("stale.txt")).await?, "stale");
        assert!(!tmp_root.exists());
        Ok(())
    }

    #[tokio::test]
    async fn replace_dir_requires_matching_subtree() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let tmp_root = tmp_dir.path().join("tmp");
        tokio::fs::create_dir_all(tmp_root.join("other")).await?;
        let error = replace_dir(&tmp_root, tmp_dir.path(), "tree")
            .await
            .unwrap_err();
        assert!(matches!(error, Error::MissingSubtree { .. }));
        assert!(tmp_root.join("other").exists());
        Ok(())
    }

    #[tokio::test]
    async fn discard_removes_files_and_trees() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let file = tmp_dir.path().join("partial");
        tokio::fs::write(&file, "xx").await?;
        let tree = tmp_dir.path().join("tree");
        tokio::fs::create_dir_all(tree.join("a/b")).await?;
        discard(&file).await;
        discard(&tree).await;
        discard(&tmp_dir.path().join("never-existed")).await;
        assert!(!file.exists());
        assert!(!tree.exists());
        Ok(())
    }
}
