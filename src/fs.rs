//! File system abstraction for save targets.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Where transferred bytes end up on the direct channel.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Checks if a file exists at the given path.
    async fn file_exists(&self, path: &Path) -> bool;

    /// Creates all directories in the given path.
    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()>;

    /// Creates (or truncates) a file for streaming writes.
    async fn create_file(&self, path: &Path) -> std::io::Result<tokio::fs::File>;

    /// Renames a file, replacing the destination if it exists.
    async fn rename_file(&self, from: &Path, to: &Path) -> std::io::Result<()>;

    /// Creates a new archive file for a synchronous zip writer.
    async fn create_archive(&self, path: &Path) -> std::io::Result<std::fs::File>;

    /// Removes a file.
    async fn remove_file(&self, path: &Path) -> std::io::Result<()>;
}

/// Default file system implementation using `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    /// Creates a new `TokioFileSystem` instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn file_exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn create_file(&self, path: &Path) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::create(path).await
    }

    async fn rename_file(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn create_archive(&self, path: &Path) -> std::io::Result<std::fs::File> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(path).await?;
        Ok(file.into_std().await)
    }

    async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

/// Path of the `.part` file a download streams into before it is renamed.
#[must_use]
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// A destination is taken if it exists or a download into it is underway.
async fn occupied(fs: &dyn FileSystem, path: &Path) -> bool {
    fs.file_exists(path).await || fs.file_exists(&part_path(path)).await
}

/// Returns the first of `name`, `name_1`, `name_2`, ... (before the
/// extension) that is not occupied in `dir`.
pub async fn next_free_path(fs: &dyn FileSystem, dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !occupied(fs, &candidate).await {
        return candidate;
    }
    let (stem, extension) = crate::resolve::split_extension(name);
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{n}{extension}"));
        if !occupied(fs, &candidate).await {
            return candidate;
        }
        n += 1;
    }
}
