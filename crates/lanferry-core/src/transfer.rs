//! The block streaming engine and per-transfer state machine.
//!
//! Streaming follows one rule both ways: the sender emits
//! `EndOfTransfer` strictly after the final `Data` frame, so a receiver
//! that observes termination has already written every block.
//!
//! Each transfer carries two independent cancellation signals. The
//! *pause* token is polled only at the top of each loop iteration and
//! leaves all state intact, so a later [`Transfer::run`] resumes where
//! the stream stopped. The *cancel* token is checked around every await
//! and tears the transfer down.
//!
//! State machine:
//!
//! ```text
//! Init → ParamExchange → Streaming ⇄ Paused
//!                             │
//!                             ├→ Completed
//!                             ├→ Failed
//!                             └→ Cancelled
//! ```
//!
//! The three terminal states remove the transfer from its owning
//! session through a parent-supplied callback.

use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::blockfile::BlockFile;
use crate::error::{Error, Result};
use crate::protocol::{FramedChannel, MessageKind};
use crate::BLOCK_SIZE;

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We are receiving a file
    Inbound,
    /// We are sending a file
    Outbound,
}

/// Life stage of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Created, nothing negotiated yet
    Init,
    /// Running the parameter exchange
    ParamExchange,
    /// Streaming blocks
    Streaming,
    /// Paused; resumable via `run`
    Paused,
    /// All blocks delivered
    Completed,
    /// Ended on an error
    Failed,
    /// Ended by cancellation, local or remote
    Cancelled,
}

impl TransferState {
    /// Whether the transfer has ended.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Stream a file's blocks into a channel.
///
/// Emits one `Data` frame per block read from the current position and
/// terminates with `EndOfTransfer` after the final (short or empty)
/// block.
///
/// # Errors
///
/// Returns [`Error::Cancelled`] when either token fires, otherwise
/// whatever the file or channel fails with.
pub async fn transmit<S>(
    channel: &mut FramedChannel<S>,
    file: &mut BlockFile,
    pause: &CancellationToken,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if pause.is_cancelled() || cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let block = file.read_next_block().await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if block.is_empty() {
            channel.send(MessageKind::EndOfTransfer, &[]).await?;
            return Ok(());
        }

        let len = block.len();
        channel.send(MessageKind::Data, block).await?;
        if len < BLOCK_SIZE {
            channel.send(MessageKind::EndOfTransfer, &[]).await?;
            return Ok(());
        }
    }
}

/// Drain a channel's blocks into a file until `EndOfTransfer`.
///
/// # Errors
///
/// Returns [`Error::Cancelled`] when either token fires,
/// [`Error::Protocol`] on a non-data frame, otherwise whatever the file
/// or channel fails with.
pub async fn receive_blocks<S>(
    channel: &mut FramedChannel<S>,
    file: &mut BlockFile,
    pause: &CancellationToken,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if pause.is_cancelled() || cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let frame = channel.receive().await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match frame.kind {
            MessageKind::Data => file.write_next_block(frame.payload).await?,
            MessageKind::EndOfTransfer => return Ok(()),
            MessageKind::Metadata => {
                return Err(Error::Protocol("metadata frame during streaming".into()))
            }
        }
    }
}

/// Callback a transfer uses to remove itself from its owner. Plain set
/// removal only; it must not call back into the transfer.
pub type RemoveFn = Box<dyn Fn(Uuid) + Send + Sync>;

struct EngineParts {
    channel: FramedChannel<TcpStream>,
    file: BlockFile,
}

/// One live transfer under a session.
pub struct Transfer {
    id: Uuid,
    direction: Direction,
    state_tx: watch::Sender<TransferState>,
    cancel: CancellationToken,
    pause: Mutex<CancellationToken>,
    parts: tokio::sync::Mutex<Option<EngineParts>>,
    progress: Mutex<Option<watch::Receiver<u32>>>,
    remove: RemoveFn,
    weak: std::sync::Weak<Self>,
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Transfer {
    /// Create a transfer in `Init` state.
    pub(crate) fn new(direction: Direction, remove: RemoveFn) -> std::sync::Arc<Self> {
        let (state_tx, _) = watch::channel(TransferState::Init);
        std::sync::Arc::new_cyclic(|weak| Self {
            id: Uuid::new_v4(),
            direction,
            state_tx,
            cancel: CancellationToken::new(),
            pause: Mutex::new(CancellationToken::new()),
            parts: tokio::sync::Mutex::new(None),
            progress: Mutex::new(None),
            remove,
            weak: weak.clone(),
        })
    }

    /// Unique id of this transfer.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Direction of this transfer.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current state.
    pub fn state(&self) -> TransferState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<TransferState> {
        self.state_tx.subscribe()
    }

    /// Observe the block counter, available once streaming has started.
    pub fn progress(&self) -> Option<watch::Receiver<u32>> {
        self.progress.lock().expect("lock poisoned").clone()
    }

    pub(crate) fn set_state(&self, state: TransferState) {
        let _ = self.state_tx.send(state);
    }

    /// Install the negotiated channel and file.
    pub(crate) async fn attach(&self, channel: FramedChannel<TcpStream>, file: BlockFile) {
        *self.progress.lock().expect("lock poisoned") = Some(file.progress());
        *self.parts.lock().await = Some(EngineParts { channel, file });
    }

    /// Start or resume streaming.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] once the transfer has reached a
    /// terminal state. Calling while already streaming is a no-op.
    pub fn run(&self) -> Result<()> {
        {
            let state = self.state();
            if state.is_terminal() || self.cancel.is_cancelled() {
                return Err(Error::Disposed);
            }
            if state == TransferState::Streaming {
                return Ok(());
            }
        }
        let Some(transfer) = self.weak.upgrade() else {
            return Err(Error::Disposed);
        };

        let pause = CancellationToken::new();
        *self.pause.lock().expect("lock poisoned") = pause.clone();
        self.set_state(TransferState::Streaming);

        tokio::spawn(async move {
            transfer.stream(pause).await;
        });
        Ok(())
    }

    async fn stream(&self, pause: CancellationToken) {
        let mut guard = self.parts.lock().await;
        let Some(parts) = guard.as_mut() else {
            tracing::error!(id = %self.id, "transfer started without negotiated parts");
            drop(guard);
            self.finish(TransferState::Failed);
            return;
        };

        // Racing the engine against the cancel token makes cancellation
        // effective even while blocked in channel I/O; abandoning the
        // engine mid-await is fatal to the channel, which the cancel
        // path tears down anyway.
        let engine = async {
            match self.direction {
                Direction::Outbound => {
                    transmit(&mut parts.channel, &mut parts.file, &pause, &self.cancel).await
                }
                Direction::Inbound => {
                    receive_blocks(&mut parts.channel, &mut parts.file, &pause, &self.cancel).await
                }
            }
        };
        let result = tokio::select! {
            r = engine => r,
            () = self.cancel.cancelled() => Err(Error::Cancelled),
        };

        match result {
            Ok(()) => {
                let parts = guard.take();
                drop(guard);
                if let Some(parts) = parts {
                    drop(parts.channel);
                    if self.direction == Direction::Inbound {
                        if let Err(e) = parts.file.finish().await {
                            tracing::warn!(id = %self.id, "sidecar cleanup failed: {e}");
                        }
                    }
                }
                tracing::info!(id = %self.id, "transfer completed");
                self.finish(TransferState::Completed);
            }
            Err(Error::Cancelled) if !self.cancel.is_cancelled() => {
                // Only the pause token fired; keep everything for resume.
                drop(guard);
                tracing::debug!(id = %self.id, "transfer paused");
                self.set_state(TransferState::Paused);
            }
            Err(e) => {
                guard.take();
                drop(guard);
                let terminal = if e.is_cancellation() {
                    TransferState::Cancelled
                } else {
                    tracing::warn!(id = %self.id, "transfer failed: {e}");
                    TransferState::Failed
                };
                self.finish(terminal);
            }
        }
    }

    /// Request a clean pause. The engine stops at the next loop
    /// iteration; resume with [`run`](Self::run).
    pub fn pause(&self) {
        self.pause.lock().expect("lock poisoned").cancel();
    }

    /// Cancel the transfer fatally, tearing down channel and file.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if self.state().is_terminal() {
            return;
        }
        let Some(transfer) = self.weak.upgrade() else {
            return;
        };

        // A streaming engine observes the token itself; a paused or
        // never-started transfer has no task to do so. The cleanup runs
        // either way and queues behind any running engine on the parts
        // lock; `finish` keeps the first terminal state.
        tokio::spawn(async move {
            transfer.parts.lock().await.take();
            transfer.finish(TransferState::Cancelled);
        });
    }

    /// Terminate a transfer that never reached streaming, classifying
    /// the error as cancellation or failure.
    pub(crate) fn fail(&self, error: &Error) {
        let terminal = if error.is_cancellation() {
            TransferState::Cancelled
        } else {
            TransferState::Failed
        };
        self.finish(terminal);
    }

    fn finish(&self, state: TransferState) {
        let entered = self.state_tx.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = state;
                true
            }
        });
        if entered {
            (self.remove)(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockfile::Sidecar;
    use crate::protocol::Frame;
    use tempfile::TempDir;
    use tokio::fs::File;
    use tokio::io::{duplex, DuplexStream};

    fn channels() -> (FramedChannel<DuplexStream>, FramedChannel<DuplexStream>) {
        let (a, b) = duplex(8 * BLOCK_SIZE);
        (FramedChannel::new(a), FramedChannel::new(b))
    }

    fn idle_tokens() -> (CancellationToken, CancellationToken) {
        (CancellationToken::new(), CancellationToken::new())
    }

    async fn reader_file(dir: &TempDir, content: &[u8]) -> BlockFile {
        let path = dir.path().join("src.bin");
        tokio::fs::write(&path, content).await.expect("write");
        BlockFile::open_read(&path).await.expect("open")
    }

    async fn collect_frames(
        rx: &mut FramedChannel<DuplexStream>,
    ) -> Vec<(MessageKind, usize)> {
        let mut frames = Vec::new();
        loop {
            let Frame { kind, payload } = rx.receive().await.expect("frame");
            frames.push((kind, payload.len()));
            if kind == MessageKind::EndOfTransfer {
                return frames;
            }
        }
    }

    #[tokio::test]
    async fn test_transmit_zero_byte_file() {
        let dir = TempDir::new().expect("tempdir");
        let mut file = reader_file(&dir, b"").await;
        let (mut tx, mut rx) = channels();
        let (pause, cancel) = idle_tokens();

        transmit(&mut tx, &mut file, &pause, &cancel)
            .await
            .expect("transmit");

        let frames = collect_frames(&mut rx).await;
        assert_eq!(frames, vec![(MessageKind::EndOfTransfer, 0)]);
    }

    #[tokio::test]
    async fn test_transmit_exactly_one_block() {
        let dir = TempDir::new().expect("tempdir");
        let mut file = reader_file(&dir, &vec![3u8; BLOCK_SIZE]).await;
        let (mut tx, mut rx) = channels();
        let (pause, cancel) = idle_tokens();

        transmit(&mut tx, &mut file, &pause, &cancel)
            .await
            .expect("transmit");

        let frames = collect_frames(&mut rx).await;
        assert_eq!(
            frames,
            vec![
                (MessageKind::Data, BLOCK_SIZE),
                (MessageKind::EndOfTransfer, 0)
            ]
        );
    }

    #[tokio::test]
    async fn test_transmit_short_tail_block() {
        let dir = TempDir::new().expect("tempdir");
        let mut file = reader_file(&dir, &vec![9u8; BLOCK_SIZE + 3072]).await;
        let (mut tx, mut rx) = channels();
        let (pause, cancel) = idle_tokens();

        transmit(&mut tx, &mut file, &pause, &cancel)
            .await
            .expect("transmit");

        let frames = collect_frames(&mut rx).await;
        assert_eq!(
            frames,
            vec![
                (MessageKind::Data, BLOCK_SIZE),
                (MessageKind::Data, 3072),
                (MessageKind::EndOfTransfer, 0)
            ]
        );
    }

    #[tokio::test]
    async fn test_transmit_resumes_from_seek_position() {
        let dir = TempDir::new().expect("tempdir");
        let content: Vec<u8> = (0..200_000).map(|i| (i % 256) as u8).collect();
        let mut file = reader_file(&dir, &content).await;
        file.seek_to_block(2).await.expect("seek");

        let (mut tx, mut rx) = channels();
        let (pause, cancel) = idle_tokens();
        transmit(&mut tx, &mut file, &pause, &cancel)
            .await
            .expect("transmit");

        let frames = collect_frames(&mut rx).await;
        assert_eq!(
            frames,
            vec![
                (MessageKind::Data, BLOCK_SIZE),
                (MessageKind::Data, 200_000 - 3 * BLOCK_SIZE),
                (MessageKind::EndOfTransfer, 0)
            ]
        );
    }

    #[tokio::test]
    async fn test_receive_writes_blocks_then_stops() {
        let dir = TempDir::new().expect("tempdir");
        let out_path = dir.path().join("out.bin");
        let out = File::create(&out_path).await.expect("create");
        let mut file = BlockFile::from_parts(out, (BLOCK_SIZE + 100) as u64, None);

        let (mut tx, mut rx) = channels();
        let (pause, cancel) = idle_tokens();

        let payload: Vec<u8> = (0..BLOCK_SIZE + 100).map(|i| (i % 256) as u8).collect();
        tx.send(MessageKind::Data, &payload[..BLOCK_SIZE])
            .await
            .expect("send");
        tx.send(MessageKind::Data, &payload[BLOCK_SIZE..])
            .await
            .expect("send");
        tx.send(MessageKind::EndOfTransfer, &[]).await.expect("send");

        receive_blocks(&mut rx, &mut file, &pause, &cancel)
            .await
            .expect("receive");

        let written = tokio::fs::read(&out_path).await.expect("read back");
        assert_eq!(written, payload);
    }

    #[tokio::test]
    async fn test_receive_rejects_metadata_frame() {
        let dir = TempDir::new().expect("tempdir");
        let out = File::create(dir.path().join("out.bin")).await.expect("create");
        let mut file = BlockFile::from_parts(out, 0, None);

        let (mut tx, mut rx) = channels();
        let (pause, cancel) = idle_tokens();

        tx.send(MessageKind::Metadata, b"huh").await.expect("send");
        let err = receive_blocks(&mut rx, &mut file, &pause, &cancel)
            .await
            .expect_err("must reject");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_pause_token_stops_engine_cleanly() {
        let dir = TempDir::new().expect("tempdir");
        let mut file = reader_file(&dir, &vec![1u8; 3 * BLOCK_SIZE]).await;
        let (mut tx, _rx) = channels();

        let pause = CancellationToken::new();
        let cancel = CancellationToken::new();
        pause.cancel();

        let err = transmit(&mut tx, &mut file, &pause, &cancel)
            .await
            .expect_err("paused");
        assert!(matches!(err, Error::Cancelled));
        // Nothing consumed: the pause fired before the first read.
        assert_eq!(file.last_processed_block(), 0);
    }

    #[tokio::test]
    async fn test_receiver_progress_survives_mid_stream_pause() {
        let dir = TempDir::new().expect("tempdir");
        let out_path = dir.path().join("out.bin");
        let out = File::create(&out_path).await.expect("create");
        let sidecar = Sidecar::open(dir.path().join("meta")).await.expect("sidecar");
        let mut file = BlockFile::from_parts(out, (2 * BLOCK_SIZE) as u64, Some(sidecar));

        let (mut tx, mut rx) = channels();
        let pause = CancellationToken::new();
        let cancel = CancellationToken::new();

        tx.send(MessageKind::Data, &vec![5u8; BLOCK_SIZE])
            .await
            .expect("send");

        // The pause fires while the engine waits for the second block;
        // it is observed at the next loop top, after that block lands.
        let receive = async {
            let res = receive_blocks(&mut rx, &mut file, &pause, &cancel).await;
            assert!(matches!(res, Err(Error::Cancelled)));
        };
        let pacer = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            pause.cancel();
            tx.send(MessageKind::Data, &vec![6u8; BLOCK_SIZE])
                .await
                .expect("send");
        };
        tokio::join!(receive, pacer);

        assert_eq!(file.last_processed_block(), 2);

        // Resume with a fresh pause token and finish the stream.
        let pause = CancellationToken::new();
        tx.send(MessageKind::EndOfTransfer, &[]).await.expect("send");
        receive_blocks(&mut rx, &mut file, &pause, &cancel)
            .await
            .expect("resume");

        let written = tokio::fs::read(&out_path).await.expect("read back");
        assert_eq!(written.len(), 2 * BLOCK_SIZE);
        assert!(written[..BLOCK_SIZE].iter().all(|&b| b == 5));
        assert!(written[BLOCK_SIZE..].iter().all(|&b| b == 6));
    }

    #[tokio::test]
    async fn test_cancel_token_is_fatal_between_frames() {
        let dir = TempDir::new().expect("tempdir");
        let out = File::create(dir.path().join("out.bin")).await.expect("create");
        let mut file = BlockFile::from_parts(out, 0, None);

        let (mut tx, mut rx) = channels();
        let pause = CancellationToken::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        tx.send(MessageKind::EndOfTransfer, &[]).await.expect("send");
        let err = receive_blocks(&mut rx, &mut file, &pause, &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransferState::Completed.is_terminal());
        assert!(TransferState::Failed.is_terminal());
        assert!(TransferState::Cancelled.is_terminal());
        assert!(!TransferState::Init.is_terminal());
        assert!(!TransferState::Streaming.is_terminal());
        assert!(!TransferState::Paused.is_terminal());
    }
}
