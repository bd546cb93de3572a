//! The resume sidecar.
//!
//! One sidecar file exists per in-progress receive, named by the hex
//! content hash under the metadata directory. Fixed layout:
//!
//! ```text
//! [0..4)  last written block, little-endian int32
//! [4..)   target file name, UTF-8, length implied by file length
//! ```
//!
//! A file of length 4 or less carries no usable resume state.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::Result;
use crate::protocol::{decode_int32, decode_text, encode_int32};

/// Resume state read back from a sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarState {
    /// Count of blocks fully and durably written to the target file
    pub last_written_block: u32,
    /// Name of the target file inside the receive root
    pub file_name: String,
}

/// Writer and reader for one sidecar file.
#[derive(Debug)]
pub struct Sidecar {
    file: File,
    path: PathBuf,
}

impl Sidecar {
    /// Open a sidecar file, creating it empty if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the file cannot be
    /// opened or created.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        Ok(Self { file, path })
    }

    /// Location of the sidecar on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored resume state.
    ///
    /// Returns `None` for a fresh or truncated sidecar (length ≤ 4).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) on read failure and
    /// [`Error::Protocol`](crate::Error::Protocol) if the stored bytes
    /// are not a valid counter and UTF-8 name.
    pub async fn read_state(&mut self) -> Result<Option<SidecarState>> {
        let len = self.file.metadata().await?.len();
        if len <= 4 {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(0)).await?;
        let mut counter = [0u8; 4];
        self.file.read_exact(&mut counter).await?;

        let mut name = Vec::with_capacity((len - 4) as usize);
        self.file.read_to_end(&mut name).await?;

        Ok(Some(SidecarState {
            last_written_block: decode_int32(&counter)?,
            file_name: decode_text(&name)?,
        }))
    }

    /// Durably record the count of fully written blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the write or sync
    /// fails.
    pub async fn write_last_block(&mut self, block: u32) -> Result<()> {
        self.file.seek(SeekFrom::Start(0)).await?;
        self.file.write_all(&encode_int32(block)?).await?;
        self.file.sync_data().await?;
        Ok(())
    }

    /// Durably record the target file name, truncating any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the write or sync
    /// fails.
    pub async fn write_file_name(&mut self, name: &str) -> Result<()> {
        self.file.set_len(4 + name.len() as u64).await?;
        self.file.seek(SeekFrom::Start(4)).await?;
        self.file.write_all(name.as_bytes()).await?;
        self.file.sync_data().await?;
        Ok(())
    }

    /// Close and delete the sidecar file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the file cannot be
    /// removed.
    pub async fn remove(self) -> Result<()> {
        let Self { file, path } = self;
        drop(file);
        tokio::fs::remove_file(&path).await?;
        tracing::debug!(path = %path.display(), "removed sidecar");
        Ok(())
    }
}
