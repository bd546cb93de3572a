//! Block-level file I/O for Lanferry.
//!
//! This module handles:
//! - Reading and writing files in [`BLOCK_SIZE`](crate::BLOCK_SIZE) units
//! - The resume sidecar tracking the last durably written block
//! - Content digests used as resume identity keys
//!
//! ## Crash safety
//!
//! On the receive side every block write follows the same order: block
//! data synced, sidecar counter written and synced, in-memory counter
//! incremented. A crash at any point therefore leaves the sidecar
//! counter at or below the number of blocks durably on disk, so a
//! resumed transfer re-requests the partially written block instead of
//! skipping it.

mod dir;
mod sidecar;

pub use dir::RootDir;
pub use sidecar::{Sidecar, SidecarState};

use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::BLOCK_SIZE;

/// Compute the MD5 digest of a file's content.
///
/// The digest is used purely as an identity key for resume matching;
/// delivered content is never verified against it.
///
/// # Errors
///
/// Returns [`Error::FileUnavailable`] if the file cannot be read.
pub async fn content_digest(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path)
        .await
        .map_err(|e| Error::FileUnavailable(format!("{}: {e}", path.display())))?;

    let mut context = md5::Context::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }

    Ok(context.compute().0.to_vec())
}

/// Block-granular accessor over one open file.
///
/// Holds the file handle, the declared size, an optional [`Sidecar`]
/// persisting write progress, and a single reusable block buffer. The
/// handle is exclusively owned; block position is tracked as the index
/// of the next block to process.
#[derive(Debug)]
pub struct BlockFile {
    file: File,
    size: u64,
    last_processed_block: u32,
    buf: Vec<u8>,
    sidecar: Option<Sidecar>,
    progress_tx: watch::Sender<u32>,
}

impl BlockFile {
    /// Open an existing file for block reads (the send side).
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileUnavailable`] if the file cannot be opened,
    /// its size cannot be read, or the size overflows the wire format.
    pub async fn open_read(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .await
            .map_err(|e| Error::FileUnavailable(format!("{}: {e}", path.display())))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| Error::FileUnavailable(format!("{}: {e}", path.display())))?
            .len();
        if size > i32::MAX as u64 {
            return Err(Error::FileUnavailable(format!(
                "{}: {size} bytes exceeds the supported file size",
                path.display()
            )));
        }

        Ok(Self::from_parts(file, size, None))
    }

    /// Wrap an already resolved file handle (the receive side).
    ///
    /// `size` is the sender-declared file size; `sidecar`, when present,
    /// receives every progress update before it becomes visible here.
    pub fn from_parts(file: File, size: u64, sidecar: Option<Sidecar>) -> Self {
        let (progress_tx, _) = watch::channel(0);
        Self {
            file,
            size,
            last_processed_block: 0,
            buf: vec![0u8; BLOCK_SIZE],
            sidecar,
            progress_tx,
        }
    }

    /// Observe the last-processed-block counter.
    pub fn progress(&self) -> watch::Receiver<u32> {
        self.progress_tx.subscribe()
    }

    /// Index of the next block to read or write.
    pub fn last_processed_block(&self) -> u32 {
        self.last_processed_block
    }

    /// Declared size of the file in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Position the file at block `n`.
    ///
    /// Returns whether the new position is at or past end of file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the seek fails.
    pub async fn seek_to_block(&mut self, n: u32) -> Result<bool> {
        let offset = u64::from(n) * BLOCK_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.last_processed_block = n;
        let _ = self.progress_tx.send(n);
        Ok(offset >= self.size)
    }

    /// Read the next block, returning a view over the bytes actually
    /// read. Zero length means end of file. The view is valid until the
    /// next operation on this accessor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the read fails.
    pub async fn read_next_block(&mut self) -> Result<&[u8]> {
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.file.read(&mut self.buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        self.last_processed_block += 1;
        let _ = self.progress_tx.send(self.last_processed_block);
        Ok(&self.buf[..filled])
    }

    /// Append `bytes` at the current position as the next block.
    ///
    /// The block data is synced and the sidecar counter durably updated
    /// before the in-memory counter moves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the write, sync, or sidecar update fails;
    /// the in-memory counter is left unchanged in that case.
    pub async fn write_next_block(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes).await?;
        self.file.sync_data().await?;

        let written = self.last_processed_block + 1;
        if let Some(sidecar) = &mut self.sidecar {
            sidecar.write_last_block(written).await?;
        }

        self.last_processed_block = written;
        let _ = self.progress_tx.send(written);
        Ok(())
    }

    /// Drop the accessor and delete its sidecar, if any.
    ///
    /// Called on successful completion of a receive; an absent sidecar
    /// makes this a plain close.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the sidecar file cannot be removed.
    pub async fn finish(self) -> Result<()> {
        let Self { file, sidecar, .. } = self;
        drop(file);
        if let Some(sidecar) = sidecar {
            sidecar.remove().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, content).await.expect("write");
        path
    }

    #[tokio::test]
    async fn test_content_digest_empty_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_file(&dir, "a.bin", b"").await;

        let digest = content_digest(&path).await.expect("digest");
        assert_eq!(hex::encode(&digest), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn test_content_digest_known_value() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_file(&dir, "a.txt", b"abc").await;

        let digest = content_digest(&path).await.expect("digest");
        assert_eq!(hex::encode(&digest), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn test_read_blocks_with_short_tail() {
        let dir = TempDir::new().expect("tempdir");
        let content: Vec<u8> = (0..BLOCK_SIZE + 100).map(|i| (i % 256) as u8).collect();
        let path = write_file(&dir, "data.bin", &content).await;

        let mut file = BlockFile::open_read(&path).await.expect("open");
        assert_eq!(file.size(), content.len() as u64);

        let block = file.read_next_block().await.expect("block 0");
        assert_eq!(block.len(), BLOCK_SIZE);
        assert_eq!(block, &content[..BLOCK_SIZE]);
        assert_eq!(file.last_processed_block(), 1);

        let block = file.read_next_block().await.expect("block 1");
        assert_eq!(block, &content[BLOCK_SIZE..]);

        let block = file.read_next_block().await.expect("eof");
        assert!(block.is_empty());
    }

    #[tokio::test]
    async fn test_seek_to_block_reports_eof() {
        let dir = TempDir::new().expect("tempdir");
        let content = vec![7u8; 2 * BLOCK_SIZE];
        let path = write_file(&dir, "data.bin", &content).await;

        let mut file = BlockFile::open_read(&path).await.expect("open");
        assert!(!file.seek_to_block(1).await.expect("seek"));
        assert!(file.seek_to_block(2).await.expect("seek"));
        assert_eq!(file.last_processed_block(), 2);

        // Reading after an interior seek resumes from that block.
        file.seek_to_block(1).await.expect("seek");
        let block = file.read_next_block().await.expect("read");
        assert_eq!(block, &content[BLOCK_SIZE..]);
        assert_eq!(file.last_processed_block(), 2);
    }

    #[tokio::test]
    async fn test_write_updates_sidecar_before_counter() {
        let dir = TempDir::new().expect("tempdir");
        let sidecar_path = dir.path().join("abc123");
        let mut sidecar = Sidecar::open(&sidecar_path).await.expect("sidecar");
        sidecar.write_file_name("out.bin").await.expect("name");

        let out = File::create(dir.path().join("out.bin")).await.expect("out");
        let mut file = BlockFile::from_parts(out, 2 * BLOCK_SIZE as u64, Some(sidecar));

        file.write_next_block(&[1u8; BLOCK_SIZE]).await.expect("w0");
        file.write_next_block(&[2u8; 100]).await.expect("w1");
        assert_eq!(file.last_processed_block(), 2);

        let mut check = Sidecar::open(&sidecar_path).await.expect("reopen");
        let state = check.read_state().await.expect("state").expect("present");
        assert_eq!(state.last_written_block, 2);
        assert_eq!(state.file_name, "out.bin");
    }

    #[tokio::test]
    async fn test_progress_observer_sees_counter() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_file(&dir, "data.bin", &[0u8; 300]).await;

        let mut file = BlockFile::open_read(&path).await.expect("open");
        let progress = file.progress();
        assert_eq!(*progress.borrow(), 0);

        file.read_next_block().await.expect("read");
        assert_eq!(*progress.borrow(), 1);
    }

    #[tokio::test]
    async fn test_finish_removes_sidecar() {
        let dir = TempDir::new().expect("tempdir");
        let sidecar_path = dir.path().join("deadbeef");
        let sidecar = Sidecar::open(&sidecar_path).await.expect("sidecar");

        let out = File::create(dir.path().join("out.bin")).await.expect("out");
        let file = BlockFile::from_parts(out, 0, Some(sidecar));

        file.finish().await.expect("finish");
        assert!(!sidecar_path.exists());
    }
}
