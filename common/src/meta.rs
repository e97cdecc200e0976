//! Local metadata probe: name, permission bits, size, access/modify times and kind of a path.
//!
//! Timestamp extraction differs per platform and is selected at build time; everything else goes
//! through `std::fs::Metadata`.

/// Permission bits carried on the wire (setuid/setgid/sticky + rwx for user/group/other).
pub const MODE_MASK: u32 = 0o7777;

/// Metadata of one local file or directory, as needed to announce it to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub name: String,
    pub mode: u32,
    /// Always 0 for directories.
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub atime: i64,
    /// Seconds since the Unix epoch.
    pub mtime: i64,
    pub is_dir: bool,
}

impl EntryMeta {
    pub fn from_metadata(name: String, metadata: &std::fs::Metadata) -> Self {
        let (atime, mtime) = access_modify_times(metadata);
        let is_dir = metadata.is_dir();
        Self {
            name,
            mode: permission_bits(metadata),
            size: if is_dir { 0 } else { metadata.len() },
            atime,
            mtime,
            is_dir,
        }
    }
}

/// Stats `path` (following symlinks) and returns its metadata.
pub async fn probe(path: &std::path::Path) -> std::io::Result<EntryMeta> {
    let metadata = tokio::fs::metadata(path).await?;
    let name = entry_name(path).await?;
    Ok(EntryMeta::from_metadata(name, &metadata))
}

/// Last path component; paths like `.` or `foo/..` are canonicalized first.
pub async fn entry_name(path: &std::path::Path) -> std::io::Result<String> {
    if let Some(name) = path.file_name() {
        return Ok(name.to_string_lossy().into_owned());
    }
    let canonical = tokio::fs::canonicalize(path).await?;
    Ok(canonical
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| canonical.to_string_lossy().into_owned()))
}

#[cfg(unix)]
pub fn access_modify_times(metadata: &std::fs::Metadata) -> (i64, i64) {
    use std::os::unix::fs::MetadataExt;
    (metadata.atime(), metadata.mtime())
}

#[cfg(not(unix))]
pub fn access_modify_times(metadata: &std::fs::Metadata) -> (i64, i64) {
    (
        epoch_seconds(metadata.accessed()),
        epoch_seconds(metadata.modified()),
    )
}

#[cfg(not(unix))]
fn epoch_seconds(time: std::io::Result<std::time::SystemTime>) -> i64 {
    time.ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .and_then(|elapsed| i64::try_from(elapsed.as_secs()).ok())
        .unwrap_or(0)
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & MODE_MASK
}

#[cfg(not(unix))]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Applies permission bits received from a peer.
#[cfg(unix)]
pub async fn set_mode(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & MODE_MASK)).await
}

#[cfg(not(unix))]
pub async fn set_mode(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    tokio::fs::set_permissions(path, permissions).await
}

/// Sets access and modify times (whole seconds since the Unix epoch).
pub async fn set_times(path: &std::path::Path, atime: i64, mtime: i64) -> std::io::Result<()> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || {
        filetime::set_file_times(
            &path,
            filetime::FileTime::from_unix_time(atime, 0),
            filetime::FileTime::from_unix_time(mtime, 0),
        )
    })
    .await
    .map_err(std::io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[tokio::test]
    async fn probe_file_and_directory() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let file = tmp_dir.path().join("a.txt");
        tokio::fs::write(&file, "abcd").await?;
        let meta = probe(&file).await?;
        assert_eq!(meta.name, "a.txt");
        assert_eq!(meta.size, 4);
        assert!(!meta.is_dir);
        let meta = probe(tmp_dir.path()).await?;
        assert!(meta.is_dir);
        assert_eq!(meta.size, 0);
        Ok(())
    }

    #[tokio::test]
    async fn dot_path_resolves_to_directory_name() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let sub = tmp_dir.path().join("named");
        tokio::fs::create_dir(&sub).await?;
        let name = entry_name(&sub.join("..").join("named").join(".")).await?;
        assert_eq!(name, "named");
        Ok(())
    }

    #[tokio::test]
    async fn set_times_round_trip() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let file = tmp_dir.path().join("t");
        tokio::fs::write(&file, "").await?;
        set_times(&file, 1_446_425_371, 1_446_425_000).await?;
        let meta = probe(&file).await?;
        assert_eq!(meta.atime, 1_446_425_371);
        assert_eq!(meta.mtime, 1_446_425_000);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn set_mode_round_trip() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let file = tmp_dir.path().join("m");
        tokio::fs::write(&file, "").await?;
        set_mode(&file, 0o640).await?;
        assert_eq!(probe(&file).await?.mode, 0o640);
        Ok(())
    }

    #[tokio::test]
    async fn probe_missing_path_fails() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let error = probe(&tmp_dir.path().join("missing")).await.unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::NotFound);
    }
}
