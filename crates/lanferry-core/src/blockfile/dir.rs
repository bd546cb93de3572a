//! The receive-root directory handle.
//!
//! All receive-side file operations go through a [`RootDir`] anchored at
//! the user's chosen folder; the core never touches files outside it.
//! File names coming off the wire are validated to be bare names before
//! any path is formed.

use std::path::{Component, Path, PathBuf};

use tokio::fs::{File, OpenOptions};

use crate::error::{Error, Result};

/// Handle to one directory the core is allowed to operate in.
#[derive(Debug, Clone)]
pub struct RootDir {
    path: PathBuf,
}

impl RootDir {
    /// Wrap a directory path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute path of `name` inside this directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `name` is empty or contains any
    /// path component beyond a bare file name.
    pub fn join(&self, name: &str) -> Result<PathBuf> {
        let candidate = Path::new(name);
        let mut components = candidate.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.path.join(name)),
            _ => Err(Error::Protocol(format!("unsafe file name {name:?}"))),
        }
    }

    /// Open a sub-directory, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on an unsafe name and
    /// [`Error::Io`] if creation fails.
    pub async fn get_or_create_sub(&self, name: &str) -> Result<RootDir> {
        let path = self.join(name)?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(RootDir::new(path))
    }

    /// Open a file for reading and writing, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on an unsafe name and
    /// [`Error::FileUnavailable`] if the file cannot be opened.
    pub async fn get_or_create_file(&self, name: &str) -> Result<File> {
        let path = self.join(name)?;
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| Error::FileUnavailable(format!("{}: {e}", path.display())))
    }

    /// Create a file, truncating any existing content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on an unsafe name and
    /// [`Error::FileUnavailable`] if the file cannot be created.
    pub async fn create_file(&self, name: &str) -> Result<File> {
        let path = self.join(name)?;
        File::create(&path)
            .await
            .map_err(|e| Error::FileUnavailable(format!("{}: {e}", path.display())))
    }

    /// Delete a file. Missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on an unsafe name and
    /// [`Error::Io`] on any other removal failure.
    pub async fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.join(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a file with this name exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on an unsafe name.
    pub async fn file_exists(&self, name: &str) -> Result<bool> {
        let path = self.join(name)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Existence check for a batch of names, in order.
    ///
    /// # Errors
    ///
    /// Returns the first per-name error encountered.
    pub async fn files_exist(&self, names: &[String]) -> Result<Vec<bool>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push(self.file_exists(name).await?);
        }
        Ok(out)
    }
}
