//! Destination naming for downloaded files
//!
//! `AlwaysCreate` tries `stem(1).ext`, `stem(2).ext`, ... until a free name
//! is found. The search is not atomic against other processes writing into
//! the same directory; the queue assumes it is the only writer.

use crate::error::QueueError;
use crate::storage::FileStore;
use dlqueue_types::{DownloadMode, DownloadedFile, QueueConfig};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// The downloads directory and the policy for naming files inside it
#[derive(Clone)]
pub struct DownloadsDirectory {
    root: PathBuf,
    directory: PathBuf,
    store: Arc<dyn FileStore>,
}

impl DownloadsDirectory {
    pub fn new(config: &QueueConfig, store: Arc<dyn FileStore>) -> Self {
        Self {
            root: config.root_dir.clone(),
            directory: config.downloads_dir(),
            store,
        }
    }

    /// Root that downloaded files are relative to
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self) -> &Path {
        &self.directory
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    /// Create the downloads directory if it is missing
    pub async fn ensure_exists(&self) -> Result<(), QueueError> {
        if !self.store.exists(&self.directory).await {
            info!("Creating downloads directory {:?}", self.directory);
            self.store.create_dir_all(&self.directory).await?;
        }
        Ok(())
    }

    /// Path a download named `name` should be written to
    pub async fn resolve_destination(
        &self,
        name: &str,
        mode: DownloadMode,
    ) -> Result<PathBuf, QueueError> {
        if !is_plain_name(name) {
            return Err(QueueError::FileSystem(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} is not a plain file name", name),
            )));
        }
        self.ensure_exists().await?;
        match mode {
            DownloadMode::ReuseIfExists => Ok(self.directory.join(name)),
            DownloadMode::AlwaysCreate => Ok(self.unique_path(name).await),
        }
    }

    /// First of `name`, `stem(1).ext`, `stem(2).ext`, ... that does not exist
    pub async fn unique_path(&self, name: &str) -> PathBuf {
        let base = self.directory.join(name);
        if !self.store.exists(&base).await {
            return base;
        }

        let (stem, extension) = split_name(name);
        let mut counter = 0u64;
        loop {
            counter += 1;
            let candidate = match extension {
                Some(ext) => self.directory.join(format!("{}({}).{}", stem, counter, ext)),
                None => self.directory.join(format!("{}({})", stem, counter)),
            };
            if !self.store.exists(&candidate).await {
                debug!("Name {} taken, using {:?}", name, candidate);
                return candidate;
            }
        }
    }

    /// The already downloaded file called `name`, if there is one
    pub async fn existing_file(&self, name: &str) -> Option<DownloadedFile> {
        if !is_plain_name(name) {
            return None;
        }
        let path = self.directory.join(name);
        if !self.store.exists(&path).await {
            return None;
        }
        DownloadedFile::from_absolute(&path, &self.root)
    }

    /// Remove everything inside the downloads directory
    pub async fn clean(&self) -> Result<(), QueueError> {
        if !self.store.exists(&self.directory).await {
            return Ok(());
        }
        let names = self.store.list_dir(&self.directory).await?;
        info!("Cleaning {} entries from {:?}", names.len(), self.directory);
        for name in names {
            self.store.remove_file(&self.directory.join(name)).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, file: &DownloadedFile) -> Result<(), QueueError> {
        self.store.remove_file(&file.absolute_path(&self.root)).await?;
        Ok(())
    }
}

/// Path of an already downloaded file, without a running queue
pub async fn path_for(name: &str, config: &QueueConfig) -> Option<PathBuf> {
    if !is_plain_name(name) {
        return None;
    }
    let path = config.downloads_dir().join(name);
    match tokio::fs::try_exists(&path).await {
        Ok(true) => Some(path),
        _ => None,
    }
}

/// A single file name: no separators, no `.`/`..`, not absolute
pub fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    let path = Path::new(name);
    match (path.file_stem().and_then(|s| s.to_str()), path.extension().and_then(|e| e.to_str())) {
        (Some(stem), Some(ext)) if !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalFileStore;
    use dlqueue_types::ConcurrencyMode;
    use tempfile::tempdir;
    use tokio::fs;

    fn directory(root: &Path) -> DownloadsDirectory {
        let config = QueueConfig::new(ConcurrencyMode::Serial, root);
        DownloadsDirectory::new(&config, Arc::new(LocalFileStore::new()))
    }

    #[test]
    fn test_plain_names() {
        assert!(is_plain_name("a.txt"));
        assert!(is_plain_name(".bashrc"));
        assert!(!is_plain_name(""));
        assert!(!is_plain_name("."));
        assert!(!is_plain_name(".."));
        assert!(!is_plain_name("../a.txt"));
        assert!(!is_plain_name("sub/a.txt"));
        assert!(!is_plain_name("/etc/passwd"));
    }

    #[tokio::test]
    async fn test_escaping_names_are_refused() {
        let root = tempdir().unwrap();
        let downloads = directory(root.path());

        let err = downloads
            .resolve_destination("../a.txt", DownloadMode::AlwaysCreate)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::FileSystem(ref e) if e.kind() == io::ErrorKind::InvalidInput));

        fs::write(root.path().join("a.txt"), b"outside").await.unwrap();
        assert!(downloads.existing_file("../a.txt").await.is_none());
        let config = QueueConfig::new(ConcurrencyMode::Serial, root.path());
        assert!(path_for("../a.txt", &config).await.is_none());
    }

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("photo.png"), ("photo", Some("png")));
        assert_eq!(split_name("archive.tar.gz"), ("archive.tar", Some("gz")));
        assert_eq!(split_name("README"), ("README", None));
        assert_eq!(split_name(".bashrc"), (".bashrc", None));
    }

    #[tokio::test]
    async fn test_always_create_appends_counter() {
        let root = tempdir().unwrap();
        let downloads = directory(root.path());

        let first = downloads
            .resolve_destination("photo.png", DownloadMode::AlwaysCreate)
            .await
            .unwrap();
        assert_eq!(first, downloads.path().join("photo.png"));
        fs::write(&first, b"1").await.unwrap();

        let second = downloads
            .resolve_destination("photo.png", DownloadMode::AlwaysCreate)
            .await
            .unwrap();
        assert_eq!(second, downloads.path().join("photo(1).png"));
        fs::write(&second, b"2").await.unwrap();

        let third = downloads
            .resolve_destination("photo.png", DownloadMode::AlwaysCreate)
            .await
            .unwrap();
        assert_eq!(third, downloads.path().join("photo(2).png"));
    }

    #[tokio::test]
    async fn test_counter_without_extension() {
        let root = tempdir().unwrap();
        let downloads = directory(root.path());
        downloads.ensure_exists().await.unwrap();
        fs::write(downloads.path().join("README"), b"x").await.unwrap();

        assert_eq!(
            downloads.unique_path("README").await,
            downloads.path().join("README(1)")
        );
    }

    #[tokio::test]
    async fn test_reuse_returns_plain_path() {
        let root = tempdir().unwrap();
        let downloads = directory(root.path());
        downloads.ensure_exists().await.unwrap();
        fs::write(downloads.path().join("a.txt"), b"x").await.unwrap();

        let path = downloads
            .resolve_destination("a.txt", DownloadMode::ReuseIfExists)
            .await
            .unwrap();
        assert_eq!(path, downloads.path().join("a.txt"));
    }

    #[tokio::test]
    async fn test_resolve_creates_directory() {
        let root = tempdir().unwrap();
        let downloads = directory(&root.path().join("deep").join("er"));
        assert!(!downloads.path().exists());

        downloads
            .resolve_destination("a.txt", DownloadMode::ReuseIfExists)
            .await
            .unwrap();
        assert!(downloads.path().is_dir());
    }

    #[tokio::test]
    async fn test_existing_file_and_remove() {
        let root = tempdir().unwrap();
        let downloads = directory(root.path());
        assert!(downloads.existing_file("a.txt").await.is_none());

        downloads.ensure_exists().await.unwrap();
        fs::write(downloads.path().join("a.txt"), b"x").await.unwrap();

        let file = downloads.existing_file("a.txt").await.unwrap();
        assert_eq!(file, DownloadedFile::new("Downloads/a.txt"));
        assert_eq!(file.absolute_path(root.path()), downloads.path().join("a.txt"));

        downloads.remove(&file).await.unwrap();
        assert!(downloads.existing_file("a.txt").await.is_none());
    }

    #[tokio::test]
    async fn test_clean() {
        let root = tempdir().unwrap();
        let downloads = directory(root.path());
        downloads.clean().await.unwrap();

        downloads.ensure_exists().await.unwrap();
        fs::write(downloads.path().join("a"), b"x").await.unwrap();
        fs::write(downloads.path().join("b"), b"y").await.unwrap();
        downloads.clean().await.unwrap();

        let mut entries = fs::read_dir(downloads.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_path_for() {
        let root = tempdir().unwrap();
        let config = QueueConfig::new(ConcurrencyMode::Serial, root.path());
        assert!(path_for("a.txt", &config).await.is_none());

        fs::create_dir_all(config.downloads_dir()).await.unwrap();
        fs::write(config.downloads_dir().join("a.txt"), b"x").await.unwrap();
        assert_eq!(
            path_for("a.txt", &config).await,
            Some(config.downloads_dir().join("a.txt"))
        );
    }
}
