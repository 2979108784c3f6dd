//! Listening sockets handed between generations.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// A bound, listening socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Local or peer address of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    /// `None` for unnamed Unix sockets (typically the connecting peer).
    Unix(Option<PathBuf>),
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "{addr}"),
            ListenAddr::Unix(Some(path)) => write!(f, "{}", path.display()),
            ListenAddr::Unix(None) => write!(f, "(unnamed)"),
        }
    }
}

impl Listener {
    /// Accept the next connection.
    pub async fn accept(&self) -> io::Result<(Connection, ListenAddr)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Connection::Tcp(stream), ListenAddr::Tcp(peer)))
            }
            Listener::Unix(listener) => {
                let (stream, peer) = listener.accept().await?;
                let path = peer.as_pathname().map(|p| p.to_path_buf());
                Ok((Connection::Unix(stream), ListenAddr::Unix(path)))
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<ListenAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().map(ListenAddr::Tcp),
            Listener::Unix(listener) => {
                let addr = listener.local_addr()?;
                Ok(ListenAddr::Unix(addr.as_pathname().map(|p| p.to_path_buf())))
            }
        }
    }

    /// Family name used in `LISTEN_FD_NAMES`.
    pub(crate) fn family(&self) -> &'static str {
        match self {
            Listener::Tcp(_) => "tcp",
            Listener::Unix(_) => "unix",
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(listener) => listener.as_fd(),
            Listener::Unix(listener) => listener.as_fd(),
        }
    }
}

/// An accepted connection on either socket family.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_accept_and_echo() {
        let listener = Listener::Tcp(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let ListenAddr::Tcp(addr) = listener.local_addr().unwrap() else {
            panic!("expected tcp address");
        };

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let (mut conn, peer) = listener.accept().await.unwrap();
        assert!(matches!(peer, ListenAddr::Tcp(_)));
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        conn.write_all(&buf).await.unwrap();

        assert_eq!(&client.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_unix_local_addr_is_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let listener = Listener::Unix(UnixListener::bind(&path).unwrap());

        assert_eq!(listener.local_addr().unwrap(), ListenAddr::Unix(Some(path.clone())));
        assert_eq!(listener.family(), "unix");

        let _client = UnixStream::connect(&path).await.unwrap();
        let (_conn, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, ListenAddr::Unix(None));
    }

    #[test]
    fn test_display() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(ListenAddr::Tcp(addr).to_string(), "127.0.0.1:8080");
        assert_eq!(
            ListenAddr::Unix(Some(PathBuf::from("/run/svc.sock"))).to_string(),
            "/run/svc.sock"
        );
    }
}
