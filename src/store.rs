use std::os::unix::fs::DirBuilderExt as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context as _;
use log::{debug, error, info, warn};
use rand::Rng as _;
use rand::distr::Alphanumeric;
use tokio::io::AsyncWriteExt as _;

use crate::mirror::CacheKey;

/// Name prefix of in-flight downloads, created directly under the data root.
pub(crate) const TMP_PREFIX: &str = "remirror_tmp_";

const TMP_SUFFIX_LEN: usize = 10;
const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// File store keyed by cleaned request path.
///
/// Objects are published by renaming a completely written temporary file onto
/// their final path, so readers see either nothing or the whole object.
/// Concurrent writers of the same key are not coordinated, the last rename wins.
#[derive(Clone, Debug)]
pub(crate) struct CacheStore {
    root: Arc<PathBuf>,
    buffer_size: usize,
}

#[derive(Debug)]
pub(crate) enum CacheLookup {
    Hit(CachedFile),
    Miss,
}

#[derive(Debug)]
pub(crate) struct CachedFile {
    pub(crate) file: tokio::fs::File,
    pub(crate) size: u64,
    pub(crate) modified: Option<SystemTime>,
    pub(crate) path: PathBuf,
}

impl CacheStore {
    #[must_use]
    pub(crate) fn new(root: PathBuf, buffer_size: usize) -> Self {
        Self {
            root: Arc::new(root),
            buffer_size,
        }
    }

    #[must_use]
    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the data root and removes in-flight files left over by a previous process.
    pub(crate) fn setup(&self) -> anyhow::Result<()> {
        let root = self.root();

        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(root)
            .with_context(|| format!("Failed to create directory `{}`", root.display()))?;

        let mut removed = 0;
        for entry in std::fs::read_dir(root)
            .with_context(|| format!("Failed to read directory `{}`", root.display()))?
        {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                continue;
            }

            let entry_path = entry.path();
            debug!("Removing stale temporary file `{}`", entry_path.display());
            std::fs::remove_file(&entry_path)
                .with_context(|| format!("Failed to remove entry `{}`", entry_path.display()))?;
            removed += 1;
        }

        if removed > 0 {
            info!("Removed {removed} stale temporary files from `{}`", root.display());
        }

        Ok(())
    }

    /// Final location of a cache object.
    #[must_use]
    pub(crate) fn object_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative())
    }

    /// Opens a published object.
    ///
    /// Directories, non-regular files and in-flight temporaries are misses.
    pub(crate) async fn open_for_read(&self, key: &CacheKey) -> std::io::Result<CacheLookup> {
        if key.first_segment().starts_with(TMP_PREFIX) {
            return Ok(CacheLookup::Miss);
        }

        let path = self.object_path(key);

        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                ) =>
            {
                return Ok(CacheLookup::Miss);
            }
            Err(err) => return Err(err),
        };

        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            debug!("Cache path `{}` is not a regular file", path.display());
            return Ok(CacheLookup::Miss);
        }

        Ok(CacheLookup::Hit(CachedFile {
            file,
            size: metadata.len(),
            modified: metadata.modified().ok(),
            path,
        }))
    }

    /// Creates a uniquely named temporary file directly under the data root.
    pub(crate) async fn begin_write(&self) -> std::io::Result<PendingFile> {
        const MAX_TRIES: u32 = 10;

        let mut tries = 0;
        loop {
            let name: String = {
                let suffix: String = rand::rng()
                    .sample_iter(Alphanumeric)
                    .take(TMP_SUFFIX_LEN)
                    .map(char::from)
                    .collect();
                format!("{TMP_PREFIX}{suffix}")
            };
            let path = self.root.join(name);

            match tokio::fs::File::options()
                .create_new(true)
                .write(true)
                .mode(FILE_MODE)
                .open(&path)
                .await
            {
                Ok(file) => {
                    debug!("Created temporary file `{}`", path.display());
                    return Ok(PendingFile {
                        writer: Some(tokio::io::BufWriter::with_capacity(
                            self.buffer_size,
                            file,
                        )),
                        path,
                        armed: true,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    tries += 1;
                    if tries > MAX_TRIES {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// An in-flight download.
///
/// Unless [`PendingFile::commit`] succeeds the temporary file is unlinked,
/// including when the handle is dropped on an error or cancellation path.
#[derive(Debug)]
pub(crate) struct PendingFile {
    writer: Option<tokio::io::BufWriter<tokio::fs::File>>,
    path: PathBuf,
    armed: bool,
}

impl PendingFile {
    #[must_use]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_all(chunk).await,
            None => Err(std::io::Error::other("temporary file already closed")),
        }
    }

    /// Publishes the written data as `key`. This is the publish point.
    pub(crate) async fn commit(mut self, store: &CacheStore, key: &CacheKey) -> std::io::Result<PathBuf> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.into_inner().sync_data().await?;
        }

        let dest_path = store.object_path(key);

        if let Some(parent) = dest_path.parent() {
            tokio::fs::DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(parent)
                .await?;
        }

        tokio::fs::rename(&self.path, &dest_path).await?;
        self.armed = false;

        Ok(dest_path)
    }

    /// Discards the download.
    pub(crate) async fn abort(mut self) {
        drop(self.writer.take());

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("Removed temporary file `{}`", self.path.display()),
            Err(err) => error!(
                "Failed to remove temporary file `{}`:  {err}",
                self.path.display()
            ),
        }

        self.armed = false;
    }
}

#[cfg(test)]
impl PendingFile {
    /// Wraps an already opened file as the in-flight download at `path`.
    pub(crate) fn from_file(file: tokio::fs::File, path: PathBuf, buffer_size: usize) -> Self {
        Self {
            writer: Some(tokio::io::BufWriter::with_capacity(buffer_size, file)),
            path,
            armed: true,
        }
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        drop(self.writer.take());

        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                "Failed to remove abandoned temporary file `{}`:  {err}",
                self.path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> CacheKey {
        CacheKey::from_request_path(path).unwrap()
    }

    fn tmp_files(root: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with(TMP_PREFIX)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_path_buf(), 4096);

        assert!(matches!(
            store.open_for_read(&key("/centos/bash.rpm")).await.unwrap(),
            CacheLookup::Miss
        ));

        /* parent is a file */
        std::fs::write(dir.path().join("centos"), b"x").unwrap();
        assert!(matches!(
            store.open_for_read(&key("/centos/bash.rpm")).await.unwrap(),
            CacheLookup::Miss
        ));

        /* directories are not objects */
        std::fs::create_dir_all(dir.path().join("fedora/releases")).unwrap();
        assert!(matches!(
            store.open_for_read(&key("/fedora/releases")).await.unwrap(),
            CacheLookup::Miss
        ));
    }

    #[tokio::test]
    async fn test_commit_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_path_buf(), 4096);
        let key = key("/archlinux/core/os/x86_64/foo-1-1-x86_64.pkg.tar.xz");

        let mut pending = store.begin_write().await.unwrap();
        assert_eq!(pending.path().parent().unwrap(), dir.path());
        pending.write(b"hello ").await.unwrap();
        pending.write(b"world").await.unwrap();

        /* not visible before the publish point */
        assert!(matches!(
            store.open_for_read(&key).await.unwrap(),
            CacheLookup::Miss
        ));

        let dest = pending.commit(&store, &key).await.unwrap();
        assert_eq!(
            dest,
            dir.path()
                .join("archlinux/core/os/x86_64/foo-1-1-x86_64.pkg.tar.xz")
        );

        let CacheLookup::Hit(hit) = store.open_for_read(&key).await.unwrap() else {
            panic!("expected a hit");
        };
        assert_eq!(hit.size, 11);
        assert_eq!(std::fs::read(&hit.path).unwrap(), b"hello world");

        let mode = std::os::unix::fs::PermissionsExt::mode(
            &std::fs::metadata(dir.path().join("archlinux/core"))
                .unwrap()
                .permissions(),
        );
        assert_eq!(mode & 0o777, 0o755);

        assert!(tmp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_abort_and_drop_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_path_buf(), 4096);

        let mut pending = store.begin_write().await.unwrap();
        pending.write(b"partial").await.unwrap();
        assert_eq!(tmp_files(dir.path()).len(), 1);
        pending.abort().await;
        assert!(tmp_files(dir.path()).is_empty());

        let mut pending = store.begin_write().await.unwrap();
        pending.write(b"partial").await.unwrap();
        drop(pending);
        assert!(tmp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_later_commit_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_path_buf(), 4096);
        let key = key("/centos/7/os/x86_64/Packages/bash.rpm");

        let mut first = store.begin_write().await.unwrap();
        let mut second = store.begin_write().await.unwrap();
        assert_ne!(first.path(), second.path());

        first.write(b"first").await.unwrap();
        second.write(b"second").await.unwrap();

        first.commit(&store, &key).await.unwrap();
        second.commit(&store, &key).await.unwrap();

        assert_eq!(std::fs::read(store.object_path(&key)).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_tmp_files_not_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_path_buf(), 4096);

        let pending = store.begin_write().await.unwrap();
        let name = pending.path().file_name().unwrap().to_string_lossy().into_owned();

        assert!(matches!(
            store
                .open_for_read(&key(&format!("/{name}")))
                .await
                .unwrap(),
            CacheLookup::Miss
        ));
    }

    #[test]
    fn test_setup_sweeps_stale_tmp_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("remirror_tmp_abcdefghij"), b"stale").unwrap();
        std::fs::create_dir(root.join("centos")).unwrap();
        std::fs::write(root.join("centos/bash.rpm"), b"keep").unwrap();

        let store = CacheStore::new(root.clone(), 4096);
        store.setup().unwrap();

        assert!(tmp_files(&root).is_empty());
        assert_eq!(std::fs::read(root.join("centos/bash.rpm")).unwrap(), b"keep");

        /* creates a missing root */
        let store = CacheStore::new(dir.path().join("new/data"), 4096);
        store.setup().unwrap();
        assert!(dir.path().join("new/data").is_dir());
    }
}
