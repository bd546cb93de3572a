//! Per-transfer parameter negotiation.
//!
//! Both sides walk a fixed frame sequence with no correlation ids:
//!
//! ```text
//! sender                       receiver
//!   Metadata(password)     →
//!                          ←   Metadata(empty)            accepted
//!                          ←   EndOfTransfer(empty)       rejected
//!   Metadata(file name)    →
//!   Metadata(hash bytes)   →
//!   Metadata(size, int32)  →
//!                          ←   Metadata(resume block)
//! ```
//!
//! A frame of the wrong type at any step is a fatal protocol error; an
//! `EndOfTransfer` where the sequence allows one maps to the matching
//! cancellation error instead.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::blockfile::{RootDir, Sidecar};
use crate::error::{Error, Result};
use crate::protocol::{
    decode_int32, decode_text, encode_int32, FileMetadata, FramedChannel, MessageKind,
};
use crate::ui::{ConflictChoice, UserPrompts};
use crate::METADATA_DIR;

/// Receiver-side outcome of the negotiation: an opened target file plus
/// its sidecar and the block to resume from.
#[derive(Debug)]
pub struct ResolvedFile {
    /// Target file, positioned by the caller before streaming
    pub file: tokio::fs::File,
    /// Sidecar persisting this transfer's progress
    pub sidecar: Sidecar,
    /// Count of blocks the target already holds durably
    pub resume_block: u32,
    /// Final name of the target inside the receive root
    pub name: String,
}

/// Run the sender half of the negotiation.
///
/// Returns the receiver's resume point: the index of the first block
/// the receiver still needs.
///
/// # Errors
///
/// Returns [`Error::InvalidPassword`] if the receiver rejects the
/// password, [`Error::RemoteCancelled`] if it backs out afterwards, and
/// [`Error::Protocol`] on any unexpected frame.
pub async fn send_parameters<S>(
    channel: &mut FramedChannel<S>,
    password: &str,
    meta: &FileMetadata,
) -> Result<u32>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    channel.send(MessageKind::Metadata, password.as_bytes()).await?;

    let verdict = channel.receive().await?;
    match verdict.kind {
        MessageKind::Metadata => {}
        MessageKind::EndOfTransfer => return Err(Error::InvalidPassword),
        MessageKind::Data => {
            return Err(Error::Protocol("data frame during password check".into()))
        }
    }

    channel.send(MessageKind::Metadata, meta.name.as_bytes()).await?;
    channel.send(MessageKind::Metadata, &meta.hash).await?;
    channel
        .send(MessageKind::Metadata, &encode_int32(meta.size)?)
        .await?;

    let resume = channel.receive().await?;
    match resume.kind {
        MessageKind::Metadata => decode_int32(resume.payload),
        MessageKind::EndOfTransfer => Err(Error::RemoteCancelled),
        MessageKind::Data => Err(Error::Protocol("data frame instead of resume point".into())),
    }
}

/// Receive and check the sender's password.
///
/// An empty local password accepts anything; otherwise the comparison
/// is byte-exact. Rejection answers the sender with `EndOfTransfer`
/// before failing locally.
async fn receive_password<S>(channel: &mut FramedChannel<S>, local_password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = channel.receive().await?;
    if frame.kind != MessageKind::Metadata {
        return Err(Error::Protocol(format!(
            "expected password frame, got {:?}",
            frame.kind
        )));
    }
    let offered = decode_text(frame.payload)?;

    if !local_password.is_empty() && offered != local_password {
        channel.send(MessageKind::EndOfTransfer, &[]).await?;
        return Err(Error::InvalidPassword);
    }

    channel.send(MessageKind::Metadata, &[]).await?;
    Ok(())
}

/// Receive the three-frame file offer.
///
/// `EndOfTransfer` at any of the three frames means the sender backed
/// out and maps to [`Error::RemoteCancelled`].
async fn receive_file_offer<S>(channel: &mut FramedChannel<S>) -> Result<FileMetadata>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut fields: Vec<Vec<u8>> = Vec::with_capacity(3);
    for step in ["file name", "hash", "size"] {
        let frame = channel.receive().await?;
        match frame.kind {
            MessageKind::Metadata => fields.push(frame.payload.to_vec()),
            MessageKind::EndOfTransfer => return Err(Error::RemoteCancelled),
            MessageKind::Data => {
                return Err(Error::Protocol(format!("data frame instead of {step}")))
            }
        }
    }

    let size = decode_int32(&fields[2])?;
    Ok(FileMetadata {
        name: decode_text(&fields[0])?,
        hash: fields[1].clone(),
        size,
    })
}

/// Pick a free `name (n).ext` variant by probing in batches of five.
async fn unique_name(root: &RootDir, wanted: &str) -> Result<String> {
    let path = std::path::Path::new(wanted);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(wanted)
        .to_string();
    let extension = path.extension().and_then(|e| e.to_str());

    let candidate = |n: u32| match extension {
        Some(ext) => format!("{stem} ({n}).{ext}"),
        None => format!("{stem} ({n})"),
    };

    let mut base = 1u32;
    loop {
        let batch: Vec<String> = (base..base + 5).map(candidate).collect();
        let exists = root.files_exist(&batch).await?;
        if let Some(free) = exists.iter().position(|&taken| !taken) {
            return Ok(batch[free].clone());
        }
        base += 5;
    }
}

/// Resolve the on-disk target for an offered file.
///
/// Opens (creating if needed) the sidecar named by the content hash
/// under the metadata directory. A sidecar with usable state whose
/// target still exists resumes that file; anything else runs conflict
/// resolution on the offered name and starts fresh at block zero.
///
/// # Errors
///
/// Returns [`Error::LocalCancelled`] if the user aborts the conflict
/// prompt, and file system errors otherwise.
pub async fn resolve_target(
    root: &RootDir,
    meta: &FileMetadata,
    prompts: &dyn UserPrompts,
) -> Result<ResolvedFile> {
    let meta_dir = root.get_or_create_sub(METADATA_DIR).await?;
    let mut sidecar = Sidecar::open(meta_dir.join(&meta.hash_hex())?).await?;

    if let Some(state) = sidecar.read_state().await? {
        if root.file_exists(&state.file_name).await? {
            let file = root.get_or_create_file(&state.file_name).await?;
            tracing::info!(
                name = %state.file_name,
                block = state.last_written_block,
                "resuming interrupted transfer"
            );
            return Ok(ResolvedFile {
                file,
                sidecar,
                resume_block: state.last_written_block,
                name: state.file_name,
            });
        }
        tracing::debug!(name = %state.file_name, "sidecar target missing, starting fresh");
    }

    let name = if root.file_exists(&meta.name).await? {
        match prompts.resolve_conflict(&meta.name) {
            ConflictChoice::Overwrite => {
                root.delete_file(&meta.name).await?;
                meta.name.clone()
            }
            ConflictChoice::Rename => unique_name(root, &meta.name).await?,
            ConflictChoice::Abort => return Err(Error::LocalCancelled),
        }
    } else {
        meta.name.clone()
    };

    let file = root.create_file(&name).await?;
    sidecar.write_file_name(&name).await?;
    sidecar.write_last_block(0).await?;

    Ok(ResolvedFile {
        file,
        sidecar,
        resume_block: 0,
        name,
    })
}

/// Run the receiver half of the negotiation.
///
/// Checks the password, receives the offer, asks the user, resolves the
/// target file, and answers with the resume point. Any local refusal
/// after the password step answers the sender with `EndOfTransfer`.
///
/// # Errors
///
/// Returns the error kinds of [`receive_password`], [`resolve_target`],
/// or [`Error::LocalCancelled`] if the user declines the transfer.
pub async fn receive_parameters<S>(
    channel: &mut FramedChannel<S>,
    local_password: &str,
    root: &RootDir,
    prompts: &dyn UserPrompts,
) -> Result<(FileMetadata, ResolvedFile)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    receive_password(channel, local_password).await?;
    let meta = receive_file_offer(channel).await?;

    if !prompts.confirm_transfer(&meta.name, u64::from(meta.size)) {
        channel.send(MessageKind::EndOfTransfer, &[]).await?;
        return Err(Error::LocalCancelled);
    }

    let resolved = match resolve_target(root, &meta, prompts).await {
        Ok(resolved) => resolved,
        Err(e) => {
            let _ = channel.send(MessageKind::EndOfTransfer, &[]).await;
            return Err(e);
        }
    };

    channel
        .send(MessageKind::Metadata, &encode_int32(resolved.resume_block)?)
        .await?;

    Ok((meta, resolved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::{duplex, DuplexStream};

    struct Scripted {
        confirm: bool,
        conflict: ConflictChoice,
        errors: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(confirm: bool, conflict: ConflictChoice) -> Self {
            Self {
                confirm,
                conflict,
                errors: Mutex::new(Vec::new()),
            }
        }
    }

    impl UserPrompts for Scripted {
        fn confirm_transfer(&self, _file_name: &str, _size: u64) -> bool {
            self.confirm
        }

        fn resolve_conflict(&self, _file_name: &str) -> ConflictChoice {
            self.conflict
        }

        fn report_error(&self, message: &str) {
            self.errors.lock().expect("lock").push(message.to_string());
        }
    }

    fn channels() -> (FramedChannel<DuplexStream>, FramedChannel<DuplexStream>) {
        let (a, b) = duplex(4 * crate::BLOCK_SIZE);
        (FramedChannel::new(a), FramedChannel::new(b))
    }

    fn sample_meta(name: &str, size: u32) -> FileMetadata {
        FileMetadata {
            name: name.to_string(),
            hash: vec![0xAB; 16],
            size,
        }
    }

    #[tokio::test]
    async fn test_negotiation_happy_path() {
        let dir = TempDir::new().expect("tempdir");
        let root = RootDir::new(dir.path());
        let (mut sender, mut receiver) = channels();
        let meta = sample_meta("a.bin", 12_345);

        let send_meta = meta.clone();
        let send_side = tokio::spawn(async move {
            send_parameters(&mut sender, "", &send_meta).await
        });

        let prompts = Scripted::new(true, ConflictChoice::Abort);
        let (got_meta, resolved) = receive_parameters(&mut receiver, "", &root, &prompts)
            .await
            .expect("receive");

        assert_eq!(got_meta, meta);
        assert_eq!(resolved.resume_block, 0);
        assert_eq!(resolved.name, "a.bin");

        let resume = send_side.await.expect("join").expect("send");
        assert_eq!(resume, 0);
        assert!(dir.path().join("a.bin").exists());
        assert!(dir
            .path()
            .join(crate::METADATA_DIR)
            .join(meta.hash_hex())
            .exists());
    }

    #[tokio::test]
    async fn test_password_mismatch_rejects_sender() {
        let dir = TempDir::new().expect("tempdir");
        let root = RootDir::new(dir.path());
        let (mut sender, mut receiver) = channels();

        let send_side = tokio::spawn(async move {
            send_parameters(&mut sender, "hunter2", &sample_meta("a.bin", 10)).await
        });

        let prompts = Scripted::new(true, ConflictChoice::Abort);
        let err = receive_parameters(&mut receiver, "open sesame", &root, &prompts)
            .await
            .expect_err("must reject");
        assert!(matches!(err, Error::InvalidPassword));

        let err = send_side.await.expect("join").expect_err("must fail");
        assert!(matches!(err, Error::InvalidPassword));
    }

    #[tokio::test]
    async fn test_empty_receiver_password_accepts_any() {
        let dir = TempDir::new().expect("tempdir");
        let root = RootDir::new(dir.path());
        let (mut sender, mut receiver) = channels();

        let send_side = tokio::spawn(async move {
            send_parameters(&mut sender, "whatever", &sample_meta("b.bin", 1)).await
        });

        let prompts = Scripted::new(true, ConflictChoice::Abort);
        receive_parameters(&mut receiver, "", &root, &prompts)
            .await
            .expect("accept any password");
        send_side.await.expect("join").expect("send ok");
    }

    #[tokio::test]
    async fn test_receiver_decline_maps_to_remote_cancelled() {
        let dir = TempDir::new().expect("tempdir");
        let root = RootDir::new(dir.path());
        let (mut sender, mut receiver) = channels();

        let send_side = tokio::spawn(async move {
            send_parameters(&mut sender, "", &sample_meta("c.bin", 10)).await
        });

        let prompts = Scripted::new(false, ConflictChoice::Abort);
        let err = receive_parameters(&mut receiver, "", &root, &prompts)
            .await
            .expect_err("declined");
        assert!(matches!(err, Error::LocalCancelled));

        let err = send_side.await.expect("join").expect_err("cancelled");
        assert!(matches!(err, Error::RemoteCancelled));
    }

    #[tokio::test]
    async fn test_conflict_rename_probes_for_free_name() {
        let dir = TempDir::new().expect("tempdir");
        let root = RootDir::new(dir.path());

        tokio::fs::write(dir.path().join("report.pdf"), b"old")
            .await
            .expect("seed");

        let prompts = Scripted::new(true, ConflictChoice::Rename);
        let meta = sample_meta("report.pdf", 100);
        let resolved = resolve_target(&root, &meta, &prompts).await.expect("resolve");

        assert_eq!(resolved.name, "report (1).pdf");
        assert!(dir.path().join("report (1).pdf").exists());
    }

    #[tokio::test]
    async fn test_conflict_rename_skips_taken_variants() {
        let dir = TempDir::new().expect("tempdir");
        let root = RootDir::new(dir.path());

        for name in [
            "report.pdf",
            "report (1).pdf",
            "report (2).pdf",
            "report (3).pdf",
            "report (4).pdf",
            "report (5).pdf",
            "report (6).pdf",
        ] {
            tokio::fs::write(dir.path().join(name), b"x").await.expect("seed");
        }

        let prompts = Scripted::new(true, ConflictChoice::Rename);
        let meta = sample_meta("report.pdf", 100);
        let resolved = resolve_target(&root, &meta, &prompts).await.expect("resolve");

        assert_eq!(resolved.name, "report (7).pdf");
    }

    #[tokio::test]
    async fn test_conflict_overwrite_reuses_name() {
        let dir = TempDir::new().expect("tempdir");
        let root = RootDir::new(dir.path());

        tokio::fs::write(dir.path().join("data.bin"), b"previous content")
            .await
            .expect("seed");

        let prompts = Scripted::new(true, ConflictChoice::Overwrite);
        let meta = sample_meta("data.bin", 4);
        let resolved = resolve_target(&root, &meta, &prompts).await.expect("resolve");

        assert_eq!(resolved.name, "data.bin");
        let len = tokio::fs::metadata(dir.path().join("data.bin"))
            .await
            .expect("meta")
            .len();
        assert_eq!(len, 0, "existing content discarded");
    }

    #[tokio::test]
    async fn test_conflict_abort_is_local_cancel() {
        let dir = TempDir::new().expect("tempdir");
        let root = RootDir::new(dir.path());

        tokio::fs::write(dir.path().join("data.bin"), b"x")
            .await
            .expect("seed");

        let prompts = Scripted::new(true, ConflictChoice::Abort);
        let meta = sample_meta("data.bin", 4);
        let err = resolve_target(&root, &meta, &prompts)
            .await
            .expect_err("aborted");
        assert!(matches!(err, Error::LocalCancelled));
    }

    #[tokio::test]
    async fn test_resume_reuses_sidecar_target() {
        let dir = TempDir::new().expect("tempdir");
        let root = RootDir::new(dir.path());
        let meta = sample_meta("movie.mkv", 500_000);

        // First resolution creates the file and sidecar.
        let prompts = Scripted::new(true, ConflictChoice::Abort);
        let first = resolve_target(&root, &meta, &prompts).await.expect("resolve");
        assert_eq!(first.resume_block, 0);

        // Simulate progress.
        let mut sidecar = first.sidecar;
        sidecar.write_last_block(2).await.expect("progress");
        drop(sidecar);

        // Second resolution resumes at the recorded block.
        let second = resolve_target(&root, &meta, &prompts).await.expect("resolve");
        assert_eq!(second.resume_block, 2);
        assert_eq!(second.name, "movie.mkv");
    }

    #[tokio::test]
    async fn test_resume_with_missing_target_starts_fresh() {
        let dir = TempDir::new().expect("tempdir");
        let root = RootDir::new(dir.path());
        let meta = sample_meta("gone.bin", 1000);

        let prompts = Scripted::new(true, ConflictChoice::Abort);
        let first = resolve_target(&root, &meta, &prompts).await.expect("resolve");
        let mut sidecar = first.sidecar;
        sidecar.write_last_block(3).await.expect("progress");
        drop(sidecar);

        tokio::fs::remove_file(dir.path().join("gone.bin"))
            .await
            .expect("remove target");

        let second = resolve_target(&root, &meta, &prompts).await.expect("resolve");
        assert_eq!(second.resume_block, 0);
        assert_eq!(second.name, "gone.bin");
    }

    #[tokio::test]
    async fn test_unique_name_without_extension() {
        let dir = TempDir::new().expect("tempdir");
        let root = RootDir::new(dir.path());

        tokio::fs::write(dir.path().join("notes"), b"x").await.expect("seed");
        tokio::fs::write(dir.path().join("notes (1)"), b"x")
            .await
            .expect("seed");

        assert_eq!(unique_name(&root, "notes").await.expect("probe"), "notes (2)");
    }
}
