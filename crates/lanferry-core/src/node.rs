//! The top-level node.
//!
//! A [`Node`] owns the connection acceptor, the discovery handler, and
//! every live [`Session`]. Accepted streams are routed by peer address:
//! the first stream from a peer becomes that session's control stream,
//! later ones are transfer streams handed to the existing session.
//! Stopping the node fans out to the acceptor, both discovery loops,
//! and every session.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::blockfile::RootDir;
use crate::discovery::{DiscoveryHandler, PeerSet};
use crate::error::{Error, Result};
use crate::net::{self, Acceptor};
use crate::session::{Session, SessionConfig};
use crate::transfer::Transfer;
use crate::ui::{AcceptAll, UserPrompts};
use crate::{BROADCAST_PORT, TRANSFER_PORT};

/// Settings for constructing a [`Node`].
#[derive(Clone)]
pub struct NodeOptions {
    /// Directory received files land in
    pub root: PathBuf,
    /// Session password; empty accepts any sender
    pub password: String,
    /// Prompt surface; defaults to accepting everything
    pub prompts: Arc<dyn UserPrompts>,
    /// TCP port to listen on, and to dial peers on
    pub port: u16,
    /// UDP port for discovery broadcasts
    pub broadcast_port: u16,
    /// Whether to broadcast our presence; peers are collected either way
    pub announce: bool,
}

impl std::fmt::Debug for NodeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeOptions")
            .field("root", &self.root)
            .field("port", &self.port)
            .field("broadcast_port", &self.broadcast_port)
            .field("announce", &self.announce)
            .finish_non_exhaustive()
    }
}

impl NodeOptions {
    /// Options with protocol defaults for the given receive root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            password: String::new(),
            prompts: Arc::new(AcceptAll),
            port: TRANSFER_PORT,
            broadcast_port: BROADCAST_PORT,
            announce: true,
        }
    }

    /// Set the session password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the prompt surface.
    #[must_use]
    pub fn with_prompts(mut self, prompts: Arc<dyn UserPrompts>) -> Self {
        self.prompts = prompts;
        self
    }

    /// Set the TCP transfer port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the UDP discovery port.
    #[must_use]
    pub fn with_broadcast_port(mut self, port: u16) -> Self {
        self.broadcast_port = port;
        self
    }

    /// Set whether the node broadcasts its presence.
    #[must_use]
    pub fn with_announce(mut self, announce: bool) -> Self {
        self.announce = announce;
        self
    }
}

type SessionMap = Arc<Mutex<HashMap<Ipv4Addr, Arc<Session>>>>;

/// One running Lanferry endpoint.
pub struct Node {
    acceptor: Acceptor,
    discovery: DiscoveryHandler,
    sessions: SessionMap,
    options: NodeOptions,
    accepted: Mutex<Option<mpsc::Receiver<TcpStream>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("local_addr", &self.acceptor.local_addr())
            .field("sessions", &self.sessions.lock().expect("lock poisoned").len())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Bind the acceptor and discovery sockets.
    ///
    /// # Errors
    ///
    /// Returns an error if any socket cannot be bound.
    pub async fn bind(options: NodeOptions) -> Result<Self> {
        let (acceptor, accepted) = Acceptor::bind(options.port).await?;
        let discovery = DiscoveryHandler::with_port(options.broadcast_port).await?;

        Ok(Self {
            acceptor,
            discovery,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            options,
            accepted: Mutex::new(Some(accepted)),
            cancel: CancellationToken::new(),
        })
    }

    /// Address the acceptor is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// The discovery peer set.
    pub fn peers(&self) -> Arc<PeerSet> {
        self.discovery.peers()
    }

    /// Live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Start the acceptor, the discovery loops, and stream dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the node was already stopped.
    pub fn start(&self) -> Result<()> {
        let Some(accepted) = self.accepted.lock().expect("lock poisoned").take() else {
            return Err(Error::Disposed);
        };

        self.acceptor.start()?;
        if self.options.announce {
            self.discovery.start()?;
        } else {
            self.discovery.start_listener()?;
        }

        let sessions = Arc::clone(&self.sessions);
        let options = self.options.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(dispatch_loop(accepted, sessions, options, cancel));

        tracing::info!(addr = %self.acceptor.local_addr(), "node started");
        Ok(())
    }

    /// Session with `peer`, opening a control connection if none exists.
    ///
    /// # Errors
    ///
    /// Returns connection errors from the dial.
    pub async fn connect(&self, peer: Ipv4Addr, port: u16) -> Result<Arc<Session>> {
        if let Some(session) = self.sessions.lock().expect("lock poisoned").get(&peer) {
            return Ok(Arc::clone(session));
        }

        let control = net::connect(peer, port, &self.cancel).await?;
        let session = open_session(control, peer, port, &self.sessions, &self.options);
        Ok(session)
    }

    /// Push one file to a peer: connect if needed, then start an
    /// outgoing transfer.
    ///
    /// # Errors
    ///
    /// Returns connection, negotiation, or file errors.
    pub async fn send_file(
        &self,
        peer: Ipv4Addr,
        port: u16,
        path: &Path,
    ) -> Result<Arc<Transfer>> {
        let session = self.connect(peer, port).await?;
        session.start_outgoing(path).await
    }

    /// Stop everything: dispatch, acceptor, discovery, every session.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.acceptor.close();
        self.discovery.close();

        let sessions: Vec<Arc<Session>> = {
            let mut guard = self.sessions.lock().expect("lock poisoned");
            guard.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.stop();
        }

        tracing::info!("node stopped");
    }
}

fn open_session(
    control: TcpStream,
    peer: Ipv4Addr,
    peer_port: u16,
    sessions: &SessionMap,
    options: &NodeOptions,
) -> Arc<Session> {
    let config = SessionConfig {
        password: options.password.clone(),
        root: RootDir::new(&options.root),
        prompts: Arc::clone(&options.prompts),
        peer_port,
    };

    let owner = Arc::downgrade(sessions);
    let session = Session::new(
        control,
        peer,
        config,
        Box::new(move |peer| {
            if let Some(sessions) = owner.upgrade() {
                sessions.lock().expect("lock poisoned").remove(&peer);
            }
        }),
    );

    sessions
        .lock()
        .expect("lock poisoned")
        .insert(peer, Arc::clone(&session));
    session
}

async fn dispatch_loop(
    mut accepted: mpsc::Receiver<TcpStream>,
    sessions: SessionMap,
    options: NodeOptions,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            () = cancel.cancelled() => break,
            s = accepted.recv() => match s {
                Some(s) => s,
                None => break,
            },
        };

        let peer = match stream.peer_addr() {
            Ok(SocketAddr::V4(addr)) => *addr.ip(),
            Ok(SocketAddr::V6(addr)) => {
                if let IpAddr::V4(v4) = addr.ip().to_canonical() {
                    v4
                } else {
                    tracing::warn!(peer = %addr, "dropping non-IPv4 connection");
                    continue;
                }
            }
            Err(e) => {
                tracing::warn!("dropping connection without peer address: {e}");
                continue;
            }
        };

        let existing = sessions.lock().expect("lock poisoned").get(&peer).cloned();
        match existing {
            Some(session) => {
                tokio::spawn(async move {
                    if let Err(e) = session.handle_incoming(stream).await {
                        tracing::warn!(peer = %peer, "incoming transfer rejected: {e}");
                    }
                });
            }
            None => {
                open_session(stream, peer, options.port, &sessions, &options);
            }
        }
    }
    tracing::debug!("dispatch loop stopped");
}
