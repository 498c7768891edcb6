//! File store used by the queue: moves, attributes, directory housekeeping

use async_trait::async_trait;
use chrono::DateTime;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, warn};

/// Attribute key: RFC 3339 modification time
pub const ATTR_MODIFIED: &str = "modified";
/// Attribute key: octal unix permission bits, e.g. `644`
pub const ATTR_PERMISSIONS: &str = "permissions";
/// Attribute key: `true` / `false`
pub const ATTR_READONLY: &str = "readonly";

/// File system primitives the queue depends on
#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    async fn exists(&self, path: &Path) -> bool;

    /// Move `from` to `to`. Fails with `AlreadyExists` rather than replace `to`.
    async fn move_file(&self, from: &Path, to: &Path) -> io::Result<()>;

    async fn set_attributes(
        &self,
        path: &Path,
        attributes: &BTreeMap<String, String>,
    ) -> io::Result<()>;

    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Remove a file, or a directory with its contents
    async fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Entry names inside `path`
    async fn list_dir(&self, path: &Path) -> io::Result<Vec<String>>;
}

/// [`FileStore`] on the local disk
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileStore;

impl LocalFileStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    async fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        // Linking never replaces an existing file, unlike rename
        match fs::hard_link(from, to).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(e),
            Err(link_error) => {
                debug!("Link {:?} -> {:?} failed ({}), copying instead", from, to, link_error);
                copy_new(from, to).await?;
            }
        }

        if let Err(e) = fs::remove_file(from).await {
            warn!("Failed to remove temp file {:?}: {}", from, e);
        }
        Ok(())
    }

    async fn set_attributes(
        &self,
        path: &Path,
        attributes: &BTreeMap<String, String>,
    ) -> io::Result<()> {
        if let Some(key) = attributes
            .keys()
            .find(|key| ![ATTR_MODIFIED, ATTR_PERMISSIONS, ATTR_READONLY].contains(&key.as_str()))
        {
            return Err(invalid_input(format!("unsupported file attribute: {}", key)));
        }

        // Timestamps first: the file may be read-only afterwards
        if let Some(value) = attributes.get(ATTR_MODIFIED) {
            let modified = DateTime::parse_from_rfc3339(value)
                .map_err(|e| invalid_input(format!("bad {} value {:?}: {}", ATTR_MODIFIED, value, e)))?;
            let file = fs::OpenOptions::new().write(true).open(path).await?;
            let file = file.into_std().await;
            let time = SystemTime::from(modified);
            tokio::task::spawn_blocking(move || file.set_modified(time))
                .await
                .map_err(io::Error::other)??;
        }

        if let Some(value) = attributes.get(ATTR_PERMISSIONS) {
            set_mode(path, value).await?;
        }

        if let Some(value) = attributes.get(ATTR_READONLY) {
            let readonly: bool = value
                .parse()
                .map_err(|_| invalid_input(format!("bad {} value {:?}", ATTR_READONLY, value)))?;
            let mut permissions = fs::metadata(path).await?.permissions();
            permissions.set_readonly(readonly);
            fs::set_permissions(path, permissions).await?;
        }

        Ok(())
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        if fs::metadata(path).await?.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        }
    }

    async fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

/// Copy into a file that must not exist yet; a partial copy is removed
async fn copy_new(from: &Path, to: &Path) -> io::Result<()> {
    let mut source = fs::File::open(from).await?;
    let mut target = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(to)
        .await?;

    let copied = async {
        tokio::io::copy(&mut source, &mut target).await?;
        target.sync_all().await
    }
    .await;

    if let Err(e) = copied {
        drop(target);
        let _ = fs::remove_file(to).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, value: &str) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = u32::from_str_radix(value, 8)
        .map_err(|_| invalid_input(format!("bad {} value {:?}", ATTR_PERMISSIONS, value)))?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _value: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "unix permissions are not supported on this platform",
    ))
}

fn invalid_input(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}
