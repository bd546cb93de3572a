//! Peer discovery via UDP broadcast.
//!
//! Every two seconds each usable interface broadcasts its own IPv4
//! address, as exactly four bytes, to that interface's network
//! broadcast address on port 52913. A listener bound to the same port
//! collects the addresses of other machines into an observable peer
//! set; datagrams carrying one of our own interface addresses are
//! dropped so a machine never discovers itself.
//!
//! Duplicates refresh the last-heard timestamp; the core never expires
//! peers.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::task::Looper;
use crate::{BROADCAST_INTERVAL, BROADCAST_PORT};

/// One discovered peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    /// The peer's IPv4 address
    pub addr: Ipv4Addr,
    /// When a broadcast from this peer was last heard
    pub last_heard: Instant,
}

/// Observable set of discovered peers.
#[derive(Debug)]
pub struct PeerSet {
    peers: Mutex<HashMap<Ipv4Addr, Instant>>,
    tx: watch::Sender<Vec<Peer>>,
}

impl PeerSet {
    fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self {
            peers: Mutex::new(HashMap::new()),
            tx,
        }
    }

    fn insert(&self, addr: Ipv4Addr) {
        let snapshot = {
            let mut peers = self.peers.lock().expect("lock poisoned");
            peers.insert(addr, Instant::now());
            let mut list: Vec<Peer> = peers
                .iter()
                .map(|(&addr, &last_heard)| Peer { addr, last_heard })
                .collect();
            list.sort_by_key(|p| p.addr);
            list
        };
        let _ = self.tx.send(snapshot);
    }

    /// Current peers, sorted by address.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.tx.borrow().clone()
    }

    /// Subscribe to peer set changes.
    pub fn watch(&self) -> watch::Receiver<Vec<Peer>> {
        self.tx.subscribe()
    }

    /// Whether `addr` has been heard from.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.peers
            .lock()
            .expect("lock poisoned")
            .contains_key(&addr)
    }
}

/// The network broadcast address for an interface: `addr | !netmask`.
#[must_use]
pub fn broadcast_address(addr: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) | !u32::from(netmask))
}

/// Enumerate up, non-loopback IPv4 interfaces as `(address, netmask)`.
fn usable_interfaces() -> Result<Vec<(Ipv4Addr, Ipv4Addr)>> {
    let mut out = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            out.push((v4.ip, v4.netmask));
        }
    }
    Ok(out)
}

fn new_udp_socket() -> Result<socket2::Socket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;

    #[cfg(target_os = "macos")]
    socket.set_reuse_port(true)?;

    Ok(socket)
}

/// A broadcast socket bound to one interface.
#[derive(Debug)]
struct InterfaceSender {
    addr: Ipv4Addr,
    socket: UdpSocket,
}

/// Accept one discovery datagram into the peer set.
///
/// Payloads that are not exactly four bytes are ignored, as are our own
/// interface addresses.
fn register_datagram(peers: &PeerSet, local_addrs: &HashSet<Ipv4Addr>, payload: &[u8]) {
    let Ok(octets) = <[u8; 4]>::try_from(payload) else {
        tracing::warn!(len = payload.len(), "discarding malformed discovery datagram");
        return;
    };

    let addr = Ipv4Addr::from(octets);
    if local_addrs.contains(&addr) {
        return;
    }

    if !peers.contains(addr) {
        tracing::info!(peer = %addr, "discovered peer");
    }
    peers.insert(addr);
}

/// Discovery sender and receiver loops plus the peer set they feed.
#[derive(Debug)]
pub struct DiscoveryHandler {
    sender: Looper,
    receiver: Looper,
    peers: Arc<PeerSet>,
}

impl DiscoveryHandler {
    /// Create a discovery handler on the protocol broadcast port.
    ///
    /// # Errors
    ///
    /// Returns an error if interface enumeration or socket setup fails.
    pub async fn new() -> Result<Self> {
        Self::with_port(BROADCAST_PORT).await
    }

    /// Create a discovery handler on a specific port.
    ///
    /// # Errors
    ///
    /// Returns an error if interface enumeration or socket setup fails.
    pub async fn with_port(port: u16) -> Result<Self> {
        let interfaces = usable_interfaces()?;
        let local_addrs: HashSet<Ipv4Addr> = interfaces.iter().map(|&(addr, _)| addr).collect();

        let mut senders = Vec::with_capacity(interfaces.len());
        for (addr, netmask) in interfaces {
            let target = broadcast_address(addr, netmask);

            let socket = new_udp_socket()?;
            socket.set_broadcast(true)?;
            socket.bind(&SocketAddrV4::new(addr, 0).into())?;
            socket.connect(&SocketAddrV4::new(target, port).into())?;
            socket.set_nonblocking(true)?;

            let socket = UdpSocket::from_std(socket.into())?;
            tracing::debug!(%addr, %target, "broadcasting on interface");
            senders.push(InterfaceSender { addr, socket });
        }
        let senders = Arc::new(senders);

        let recv_socket = new_udp_socket()?;
        recv_socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        recv_socket.set_nonblocking(true)?;
        let recv_socket = Arc::new(UdpSocket::from_std(recv_socket.into())?);

        let peers = Arc::new(PeerSet::new());

        let sender = {
            let senders = Arc::clone(&senders);
            Looper::new(move |token| broadcast_loop(Arc::clone(&senders), token))
        };

        let receiver = {
            let peers = Arc::clone(&peers);
            let socket = Arc::clone(&recv_socket);
            Looper::new(move |token| {
                listen_loop(
                    Arc::clone(&socket),
                    Arc::clone(&peers),
                    local_addrs.clone(),
                    token,
                )
            })
        };

        Ok(Self {
            sender,
            receiver,
            peers,
        })
    }

    /// Start both loops.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`](crate::Error::Disposed) after
    /// [`close`](Self::close).
    pub fn start(&self) -> Result<()> {
        self.sender.run()?;
        self.receiver.run()?;
        Ok(())
    }

    /// Start only the listener, collecting peers without announcing
    /// this machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`](crate::Error::Disposed) after
    /// [`close`](Self::close).
    pub fn start_listener(&self) -> Result<()> {
        self.receiver.run()
    }

    /// Signal both loops to stop.
    pub fn stop(&self) {
        self.sender.stop();
        self.receiver.stop();
    }

    /// Stop both loops permanently.
    pub fn close(&self) {
        self.sender.close();
        self.receiver.close();
    }

    /// The live peer set.
    pub fn peers(&self) -> Arc<PeerSet> {
        Arc::clone(&self.peers)
    }
}

async fn broadcast_loop(senders: Arc<Vec<InterfaceSender>>, token: CancellationToken) {
    loop {
        if token.is_cancelled() {
            break;
        }

        for sender in senders.iter() {
            if let Err(e) = sender.socket.send(&sender.addr.octets()).await {
                tracing::warn!(addr = %sender.addr, "broadcast failed: {e}");
            }
        }

        tokio::select! {
            () = tokio::time::sleep(BROADCAST_INTERVAL) => {}
            () = token.cancelled() => break,
        }
    }
    tracing::debug!("broadcast loop stopped");
}

async fn listen_loop(
    socket: Arc<UdpSocket>,
    peers: Arc<PeerSet>,
    local_addrs: HashSet<Ipv4Addr>,
    token: CancellationToken,
) {
    let mut buf = [0u8; 16];
    loop {
        let received = tokio::select! {
            res = socket.recv_from(&mut buf) => res,
            () = token.cancelled() => break,
        };

        match received {
            Ok((len, _source)) => register_datagram(&peers, &local_addrs, &buf[..len]),
            Err(e) => {
                tracing::warn!("discovery receive failed: {e}");
            }
        }
    }
    tracing::debug!("discovery listener stopped");
}
