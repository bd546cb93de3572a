//! Per-peer sessions.
//!
//! A session pairs one control stream with the set of live transfers to
//! and from a single peer. Each transfer runs on its own TCP stream;
//! the control stream carries no payload and exists to detect the peer
//! going away: any I/O fault on it tears the whole session down.
//!
//! The inbound and outbound sets are guarded by plain mutexes held only
//! for map access, never across an await. Transfers remove themselves
//! from their set on termination through the callback given at
//! construction; removal is a bare map operation and never re-enters
//! the transfer.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::blockfile::{content_digest, BlockFile, RootDir};
use crate::error::{Error, Result};
use crate::exchange;
use crate::net;
use crate::protocol::{FileMetadata, FramedChannel};
use crate::transfer::{Direction, Transfer, TransferState};
use crate::ui::UserPrompts;

/// Callback invoked once when a session shuts down.
pub type SessionClosedFn = Box<dyn Fn(Ipv4Addr) + Send + Sync>;

/// Shared settings a session operates under.
#[derive(Clone)]
pub struct SessionConfig {
    /// Password expected from, and offered to, the peer
    pub password: String,
    /// Directory received files land in
    pub root: RootDir,
    /// Prompt surface for confirmations and conflicts
    pub prompts: Arc<dyn UserPrompts>,
    /// TCP port to dial on the peer for outgoing transfer streams
    pub peer_port: u16,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("root", &self.root.path())
            .field("peer_port", &self.peer_port)
            .finish_non_exhaustive()
    }
}

type TransferMap = Arc<Mutex<HashMap<Uuid, Arc<Transfer>>>>;

/// One live peer relationship.
pub struct Session {
    peer: Ipv4Addr,
    config: SessionConfig,
    inbound: TransferMap,
    outbound: TransferMap,
    cancel: CancellationToken,
    torn_down: AtomicBool,
    on_closed: SessionClosedFn,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("inbound", &self.inbound.lock().expect("lock poisoned").len())
            .field("outbound", &self.outbound.lock().expect("lock poisoned").len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session over an established control stream and start
    /// its monitor task.
    pub fn new(
        control: TcpStream,
        peer: Ipv4Addr,
        config: SessionConfig,
        on_closed: SessionClosedFn,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            peer,
            config,
            inbound: Arc::new(Mutex::new(HashMap::new())),
            outbound: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
            on_closed,
        });

        let monitor = Arc::clone(&session);
        tokio::spawn(async move {
            monitor.monitor_control(FramedChannel::new(control)).await;
        });

        tracing::info!(peer = %peer, "session opened");
        session
    }

    /// Address of the peer this session talks to.
    pub fn peer(&self) -> Ipv4Addr {
        self.peer
    }

    /// Live inbound transfers.
    pub fn inbound(&self) -> Vec<Arc<Transfer>> {
        self.inbound
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Live outbound transfers.
    pub fn outbound(&self) -> Vec<Arc<Transfer>> {
        self.outbound
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Offer a local file to the peer and start streaming it.
    ///
    /// Dials a fresh transfer stream, negotiates, seeks to the peer's
    /// resume point, and launches the transmitter. The transfer is
    /// tracked in the outbound set until it terminates.
    ///
    /// # Errors
    ///
    /// Surfaces negotiation errors ([`Error::InvalidPassword`],
    /// [`Error::RemoteCancelled`]) and file errors; user-visible ones
    /// are also reported through the prompt surface.
    pub async fn start_outgoing(&self, path: &Path) -> Result<Arc<Transfer>> {
        let transfer = self.track_new(Direction::Outbound, &self.outbound);

        let launched = self.launch_outgoing(&transfer, path).await;
        match launched {
            Ok(()) => Ok(transfer),
            Err(e) => {
                transfer.fail(&e);
                if e.is_user_visible() {
                    self.config.prompts.report_error(&e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn launch_outgoing(&self, transfer: &Arc<Transfer>, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::FileUnavailable(format!("{}: no file name", path.display())))?
            .to_string();

        let hash = content_digest(path).await?;
        let mut file = BlockFile::open_read(path).await?;
        let meta = FileMetadata {
            name,
            hash,
            size: file.size() as u32,
        };

        transfer.set_state(TransferState::ParamExchange);
        let stream = net::connect(self.peer, self.config.peer_port, &self.cancel).await?;
        let mut channel = FramedChannel::new(stream);

        let resume = exchange::send_parameters(&mut channel, &self.config.password, &meta).await?;
        if resume > meta.block_count() {
            return Err(Error::Protocol(format!(
                "resume point {resume} beyond {} blocks",
                meta.block_count()
            )));
        }
        file.seek_to_block(resume).await?;

        tracing::info!(
            peer = %self.peer,
            name = %meta.name,
            size = meta.size,
            resume,
            "sending file"
        );

        transfer.attach(channel, file).await;
        transfer.run()
    }

    /// Take over an accepted transfer stream from this peer.
    ///
    /// Runs the receiver half of the negotiation, opens the target, and
    /// launches the block receiver. The transfer is tracked in the
    /// inbound set until it terminates.
    ///
    /// # Errors
    ///
    /// Surfaces negotiation and file errors; user-visible ones are also
    /// reported through the prompt surface.
    pub async fn handle_incoming(&self, stream: TcpStream) -> Result<Arc<Transfer>> {
        let transfer = self.track_new(Direction::Inbound, &self.inbound);

        let launched = self.launch_incoming(&transfer, stream).await;
        match launched {
            Ok(()) => Ok(transfer),
            Err(e) => {
                transfer.fail(&e);
                if e.is_user_visible() {
                    self.config.prompts.report_error(&e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn launch_incoming(
        &self,
        transfer: &Arc<Transfer>,
        stream: TcpStream,
    ) -> Result<()> {
        transfer.set_state(TransferState::ParamExchange);
        let mut channel = FramedChannel::new(stream);

        let (meta, resolved) = exchange::receive_parameters(
            &mut channel,
            &self.config.password,
            &self.config.root,
            self.config.prompts.as_ref(),
        )
        .await?;

        let mut file = BlockFile::from_parts(
            resolved.file,
            u64::from(meta.size),
            Some(resolved.sidecar),
        );
        file.seek_to_block(resolved.resume_block).await?;

        tracing::info!(
            peer = %self.peer,
            name = %resolved.name,
            size = meta.size,
            resume = resolved.resume_block,
            "receiving file"
        );

        transfer.attach(channel, file).await;
        transfer.run()
    }

    /// Insert a fresh transfer into `map` with a self-removal callback.
    fn track_new(&self, direction: Direction, map: &TransferMap) -> Arc<Transfer> {
        let weak_map = Arc::downgrade(map);
        let transfer = Transfer::new(
            direction,
            Box::new(move |id| {
                if let Some(map) = weak_map.upgrade() {
                    map.lock().expect("lock poisoned").remove(&id);
                }
            }),
        );
        map.lock()
            .expect("lock poisoned")
            .insert(transfer.id(), Arc::clone(&transfer));
        transfer
    }

    /// Shut the session down: cancel every transfer, close the control
    /// stream, and notify the owner. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.teardown();
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        // Cancelling under the set lock is safe: a transfer's actual
        // removal runs from its own task, never from inside cancel().
        for map in [&self.inbound, &self.outbound] {
            let guard = map.lock().expect("lock poisoned");
            for transfer in guard.values() {
                transfer.cancel();
            }
        }

        tracing::info!(peer = %self.peer, "session closed");
        (self.on_closed)(self.peer);
    }

    async fn monitor_control(self: Arc<Self>, mut control: FramedChannel<TcpStream>) {
        loop {
            let received = tokio::select! {
                () = self.cancel.cancelled() => break,
                r = control.receive() => r.map(|frame| frame.kind),
            };

            match received {
                Ok(kind) => {
                    tracing::warn!(peer = %self.peer, ?kind, "unexpected frame on control stream");
                }
                Err(e) => {
                    tracing::info!(peer = %self.peer, "control stream ended: {e}");
                    break;
                }
            }
        }

        control.close();
        self.teardown();
    }
}
