//! X11 byte relay. The side with the real X server connects every data
//! stream the peer opens to it; the other side offers a virtual display and
//! opens one data stream per local X client.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::connection::AuthenticatedConnection;
use crate::net::BoxedLink;

pub const X11_UNIX_DIR: &str = "/tmp/.X11-unix";
pub const X11_TCP_BASE: u16 = 6000;

/// `":0"`, `"0"` or `"host:0.0"` style display names; only the number matters.
pub fn parse_display(name: &str) -> Option<u32> {
    let number = name.rsplit(':').next()?;
    let number = number.split('.').next()?;
    number.parse().ok()
}

fn tcp_port(display: u32) -> io::Result<u16> {
    u16::try_from(display)
        .ok()
        .and_then(|d| X11_TCP_BASE.checked_add(d))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "display number out of range"))
}

/// Where the local X server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XServer {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl XServer {
    /// Prefer the display's unix socket; fall back to TCP `6000 + n`.
    pub fn locate(display: u32) -> io::Result<Self> {
        let socket = Path::new(X11_UNIX_DIR).join(format!("X{display}"));
        if socket.exists() {
            return Ok(XServer::Unix(socket));
        }
        Ok(XServer::Tcp(SocketAddr::from((
            Ipv4Addr::LOCALHOST,
            tcp_port(display)?,
        ))))
    }

    async fn connect(&self) -> io::Result<BoxedLink> {
        Ok(match self {
            XServer::Unix(path) => Box::new(UnixStream::connect(path).await?),
            XServer::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
        })
    }
}

/// Connect each stream the peer opens to `server` until the connection ends.
pub async fn serve_display(conn: AuthenticatedConnection, server: XServer) -> io::Result<()> {
    while let Some(mut stream) = conn.accept_stream().await {
        let server = server.clone();
        tokio::spawn(async move {
            let mut x = match server.connect().await {
                Ok(x) => x,
                Err(e) => {
                    tracing::warn!(?server, error = %e, "local X server unreachable");
                    return;
                }
            };
            match copy_bidirectional(&mut stream, &mut x).await {
                Ok((up, down)) => tracing::debug!(stream = stream.id(), up, down, "X client done"),
                Err(e) => tracing::debug!(stream = stream.id(), error = %e, "X client dropped"),
            }
        });
    }
    Ok(())
}

/// Display `:n` on this host, backed by the peer's X server.
pub struct VirtualDisplay {
    number: u32,
    unix: Option<(UnixListener, PathBuf)>,
    tcp: TcpListener,
}

impl VirtualDisplay {
    /// Bind `/tmp/.X11-unix/X{n}` and `127.0.0.1:6000+n`. The unix socket is
    /// optional; the TCP port is not.
    pub async fn bind(number: u32) -> io::Result<Self> {
        let tcp = SocketAddr::from((Ipv4Addr::LOCALHOST, tcp_port(number)?));
        Self::bind_at(number, Path::new(X11_UNIX_DIR), tcp).await
    }

    pub async fn bind_at(number: u32, unix_dir: &Path, tcp: SocketAddr) -> io::Result<Self> {
        let tcp = TcpListener::bind(tcp).await?;
        let path = unix_dir.join(format!("X{number}"));
        let unix = match bind_unix(unix_dir, &path) {
            Ok(listener) => Some((listener, path)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "no unix socket for display");
                None
            }
        };
        Ok(Self { number, unix, tcp })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn tcp_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn unix_path(&self) -> Option<&Path> {
        self.unix.as_ref().map(|(_, p)| p.as_path())
    }

    /// Open one stream per local X client until the connection ends.
    pub async fn forward(self, conn: AuthenticatedConnection) -> io::Result<()> {
        loop {
            let client = tokio::select! {
                _ = conn.closed() => return Ok(()),
                c = accept_unix(self.unix.as_ref()) => c,
                c = self.tcp.accept() => c.map(|(s, _)| {
                    let _ = s.set_nodelay(true);
                    Box::new(s) as BoxedLink
                }),
            };
            let mut client = match client {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(error = %e, "display accept failed");
                    continue;
                }
            };
            let mut stream = match conn.open_stream().await {
                Ok(stream) => stream,
                Err(_) => return Ok(()),
            };
            tokio::spawn(async move {
                if let Err(e) = copy_bidirectional(&mut client, &mut stream).await {
                    tracing::debug!(stream = stream.id(), error = %e, "X client dropped");
                }
            });
        }
    }
}

impl Drop for VirtualDisplay {
    fn drop(&mut self) {
        if let Some((_, path)) = &self.unix {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn bind_unix(dir: &Path, path: &Path) -> io::Result<UnixListener> {
    std::fs::create_dir_all(dir)?;
    // A stale socket from an earlier run blocks the bind.
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

async fn accept_unix(listener: Option<&(UnixListener, PathBuf)>) -> io::Result<BoxedLink> {
    match listener {
        Some((l, _)) => Ok(Box::new(l.accept().await?.0)),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::connected_pair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn display_names() {
        assert_eq!(parse_display(":0"), Some(0));
        assert_eq!(parse_display("99"), Some(99));
        assert_eq!(parse_display("localhost:10.0"), Some(10));
        assert_eq!(parse_display(":x"), None);
    }

    #[test]
    fn tcp_fallback_port() {
        let server = XServer::locate(4242).unwrap();
        assert_eq!(
            server,
            XServer::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, 10242)))
        );
        assert!(XServer::locate(70_000).is_err());
    }

    /// Echo server standing in for the X server.
    async fn fake_x_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut s, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn x_clients_reach_the_remote_server() {
        let (dialer, listener) = connected_pair();
        let joined = AuthenticatedConnection::new(dialer);
        let served = AuthenticatedConnection::new(listener);
        let x = fake_x_server().await;
        tokio::spawn(serve_display(served, XServer::Tcp(x)));

        let dir = tempfile::tempdir().unwrap();
        let display = VirtualDisplay::bind_at(42, dir.path(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let socket = display.unix_path().unwrap().to_path_buf();
        let tcp = display.tcp_addr().unwrap();
        tokio::spawn(display.forward(joined));

        let mut unix_client = UnixStream::connect(&socket).await.unwrap();
        unix_client.write_all(b"xproto").await.unwrap();
        let mut buf = [0u8; 6];
        unix_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"xproto");

        let mut tcp_client = TcpStream::connect(tcp).await.unwrap();
        tcp_client.write_all(b"second").await.unwrap();
        tcp_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"second");
    }
}
