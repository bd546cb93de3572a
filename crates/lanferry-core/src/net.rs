//! TCP connection admission.
//!
//! The [`Acceptor`] owns the listening socket on the transfer port and
//! hands every accepted, buffer-tuned stream to its consumer over a
//! channel. [`connect`] is the matching outgoing dialer. Both apply
//! [`SOCKET_BUFFER`](crate::SOCKET_BUFFER) in each direction.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::task::Looper;
use crate::SOCKET_BUFFER;

/// Apply the protocol buffer sizes to a connected stream.
fn tune_stream(stream: &TcpStream) -> Result<()> {
    let sock = SockRef::from(stream);
    sock.set_recv_buffer_size(SOCKET_BUFFER)?;
    sock.set_send_buffer_size(SOCKET_BUFFER)?;
    Ok(())
}

/// Listener emitting accepted transfer streams.
#[derive(Debug)]
pub struct Acceptor {
    looper: Looper,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Bind the listener and return the acceptor plus the stream of
    /// accepted connections. Pass port 0 to let the OS choose.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(port: u16) -> Result<(Self, mpsc::Receiver<TcpStream>)> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        #[cfg(not(windows))]
        socket.set_reuse_address(true)?;

        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;

        let listener = TcpListener::from_std(socket.into())?;
        let local_addr = listener.local_addr()?;
        let listener = Arc::new(listener);

        let (tx, rx) = mpsc::channel(16);
        let looper = Looper::new(move |token| {
            accept_loop(Arc::clone(&listener), tx.clone(), token)
        });

        tracing::debug!(%local_addr, "acceptor bound");
        Ok((Self { looper, local_addr }, rx))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after [`close`](Self::close).
    pub fn start(&self) -> Result<()> {
        self.looper.run()
    }

    /// Stop accepting; any in-flight accept is abandoned immediately.
    pub fn stop(&self) {
        self.looper.stop();
    }

    /// Stop accepting permanently.
    pub fn close(&self) {
        self.looper.close();
    }
}

async fn accept_loop(
    listener: Arc<TcpListener>,
    tx: mpsc::Sender<TcpStream>,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            () = token.cancelled() => break,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = tune_stream(&stream) {
                    tracing::warn!(%peer, "failed to tune accepted socket: {e}");
                }
                tracing::info!(%peer, "accepted connection");
                if tx.send(stream).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("accept failed: {e}");
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

/// Dial a peer, honouring cancellation.
///
/// # Errors
///
/// Returns [`Error::Cancelled`] if the token fires first, otherwise any
/// socket error.
pub async fn connect(
    addr: Ipv4Addr,
    port: u16,
    cancel: &CancellationToken,
) -> Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    socket.set_recv_buffer_size(SOCKET_BUFFER as u32)?;
    socket.set_send_buffer_size(SOCKET_BUFFER as u32)?;

    let stream = tokio::select! {
        res = socket.connect(SocketAddr::V4(SocketAddrV4::new(addr, port))) => res?,
        () = cancel.cancelled() => return Err(Error::Cancelled),
    };

    tracing::debug!(peer = %stream.peer_addr()?, "connected");
    Ok(stream)
}
