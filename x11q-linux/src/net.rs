//! Raw links and the network they come from. Everything above this module
//! talks to `dyn Network`, so the scenario harness can swap TCP for a
//! simulated NAT.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use x11q_core::{FrameDecodeError, FrameEncodeError};

/// Ordered, reliable byte stream between two hosts.
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Link for T {}

pub type BoxedLink = Box<dyn Link>;

#[async_trait]
pub trait Network: Send + Sync + 'static {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Listener>>;

    /// Dial `remote`. Returns the link and the local address it left from.
    async fn connect(&self, remote: SocketAddr) -> io::Result<(BoxedLink, SocketAddr)>;

    /// Simultaneous open from `local` toward `remote`. Keeps trying until a
    /// link exists; callers bound it with a timeout.
    async fn punch(&self, local: SocketAddr, remote: SocketAddr) -> io::Result<BoxedLink>;

    /// Addresses worth publishing for a listener bound at `listen`, given the
    /// reflexive addresses rendezvous nodes observed for this host.
    fn advertise(&self, listen: SocketAddr, observed: &[SocketAddr]) -> Vec<SocketAddr> {
        if !listen.ip().is_unspecified() {
            return vec![listen];
        }
        let mut out: Vec<SocketAddr> = observed
            .iter()
            .map(|o| SocketAddr::new(o.ip(), listen.port()))
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

#[async_trait]
pub trait Listener: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Next inbound link and the remote address as seen from here.
    async fn accept(&self) -> io::Result<(BoxedLink, SocketAddr)>;
}

/// Errors moving frames over a raw link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("frame encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("frame decode: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("timed out")]
    Timeout,
    #[error("peer is not reachable through this node")]
    Unavailable,
    #[error("unexpected message")]
    Unexpected,
}

const PUNCH_RETRY: Duration = Duration::from_millis(200);

/// Real sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpNetwork;

impl TcpNetwork {
    fn reusable_socket(for_addr: &SocketAddr) -> io::Result<TcpSocket> {
        let socket = if for_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        socket.set_reuseport(true)?;
        Ok(socket)
    }

    fn unspecified(remote: &SocketAddr) -> SocketAddr {
        let ip = match remote.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, 0)
    }

    fn boxed(stream: TcpStream) -> BoxedLink {
        let _ = stream.set_nodelay(true);
        Box::new(stream)
    }
}

struct TcpListenerHandle(TcpListener);

#[async_trait]
impl Listener for TcpListenerHandle {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }

    async fn accept(&self) -> io::Result<(BoxedLink, SocketAddr)> {
        let (stream, remote) = self.0.accept().await?;
        Ok((TcpNetwork::boxed(stream), remote))
    }
}

#[async_trait]
impl Network for TcpNetwork {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Listener>> {
        let socket = Self::reusable_socket(&addr)?;
        socket.bind(addr)?;
        Ok(Box::new(TcpListenerHandle(socket.listen(64)?)))
    }

    async fn connect(&self, remote: SocketAddr) -> io::Result<(BoxedLink, SocketAddr)> {
        // Reusable so a later punch can bind the same local port.
        let socket = Self::reusable_socket(&remote)?;
        socket.bind(Self::unspecified(&remote))?;
        let stream = socket.connect(remote).await?;
        let local = stream.local_addr()?;
        Ok((Self::boxed(stream), local))
    }

    async fn punch(&self, local: SocketAddr, remote: SocketAddr) -> io::Result<BoxedLink> {
        loop {
            let socket = Self::reusable_socket(&remote)?;
            socket.bind(local)?;
            match socket.connect(remote).await {
                Ok(stream) => return Ok(Self::boxed(stream)),
                Err(e) => {
                    tracing::trace!(%remote, error = %e, "punch attempt");
                    tokio::time::sleep(PUNCH_RETRY).await;
                }
            }
        }
    }
}
