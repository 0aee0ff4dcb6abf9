//! Socket abstraction over TCP and OS local-domain (Unix) sockets.
//!
//! Peer authentication is explicitly out of scope (§1 non-goals), so unlike
//! the teacher library this layer carries no TLS handshake: a [`Socket`] is
//! a bare, reliable, ordered byte stream.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::config::SocketOptions;

/// A connected byte stream, either TCP or a local-domain socket.
pub enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Socket {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Socket::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Socket::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Socket::Unix(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Socket::Tcp(s) => s.is_write_vectored(),
            Socket::Unix(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_flush(cx),
            Socket::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Socket::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Applies the configured `TCP_NODELAY`/`TCP_QUICKACK`/buffer-size hints to
/// an already-connected TCP stream. A no-op for local-domain sockets.
pub fn apply_tcp_options(stream: &TcpStream, opts: &SocketOptions) -> io::Result<()> {
    stream.set_nodelay(opts.tcp_no_delay)?;

    let sock_ref = socket2::SockRef::from(stream);
    if opts.tcp_receive_buffer_size > 0 {
        sock_ref.set_recv_buffer_size(opts.tcp_receive_buffer_size)?;
    }
    if opts.tcp_send_buffer_size > 0 {
        sock_ref.set_send_buffer_size(opts.tcp_send_buffer_size)?;
    }
    if opts.tcp_quick_ack {
        set_quickack_best_effort(&sock_ref);
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_quickack_best_effort(sock_ref: &socket2::SockRef<'_>) {
    // Linux-only hint; failures are non-fatal since it's purely an
    // optimization for delayed-ACK latency.
    let _ = sock_ref.set_quickack(true);
}

#[cfg(not(target_os = "linux"))]
fn set_quickack_best_effort(_sock_ref: &socket2::SockRef<'_>) {}

/// A listening endpoint, either TCP or a local-domain socket.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub async fn bind_tcp(addr: SocketAddr) -> io::Result<Self> {
        Ok(Listener::Tcp(TcpListener::bind(addr).await?))
    }

    pub async fn bind_unix(path: &str) -> io::Result<Self> {
        let _ = std::fs::remove_file(path);
        Ok(Listener::Unix(UnixListener::bind(path)?))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr(),
            Listener::Unix(_) => Err(io::Error::new(io::ErrorKind::Other, "local-domain listener has no socket address")),
        }
    }

    pub async fn accept(&self) -> io::Result<(Socket, Option<SocketAddr>)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, addr) = l.accept().await?;
                Ok((Socket::Tcp(stream), Some(addr)))
            }
            Listener::Unix(l) => {
                let (stream, _addr) = l.accept().await?;
                Ok((Socket::Unix(stream), None))
            }
        }
    }
}

pub async fn connect_tcp(addr: SocketAddr, opts: &SocketOptions) -> io::Result<Socket> {
    let stream = TcpStream::connect(addr).await?;
    apply_tcp_options(&stream, opts)?;
    Ok(Socket::Tcp(stream))
}

pub async fn connect_unix(path: &str) -> io::Result<Socket> {
    Ok(Socket::Unix(UnixStream::connect(path).await?))
}
