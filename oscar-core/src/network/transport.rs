//! Byte-stream transport seam.
//!
//! Everything above this module talks to a [`BoxedStream`] obtained from a
//! [`Connector`], so tests can hand out in-memory duplex pipes where a real
//! client opens TCP sockets.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// An ordered, reliable, bidirectional byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// A bound socket waiting for one peer to connect.
#[async_trait]
pub trait PeerListener: Send {
    /// The address peers should be told to connect to.
    fn local_addr(&self) -> (Ipv4Addr, u16);

    async fn accept(&mut self) -> io::Result<BoxedStream>;
}

/// Opens outgoing streams and, optionally, listening sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> io::Result<BoxedStream>;

    /// Bind a listener on `ip` with an ephemeral port.
    async fn listen(&self, ip: &str) -> io::Result<Box<dyn PeerListener>> {
        let _ = ip;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "this connector cannot listen",
        ))
    }
}

// ── TCP ──────────────────────────────────────────────────────────

/// The production connector: plain TCP with `TCP_NODELAY`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        tracing::debug!("connected to {address}");
        Ok(Box::new(stream))
    }

    async fn listen(&self, ip: &str) -> io::Result<Box<dyn PeerListener>> {
        let listener = TcpListener::bind((ip, 0)).await?;
        let addr = match listener.local_addr()? {
            SocketAddr::V4(v4) => (*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => (Ipv4Addr::UNSPECIFIED, v6.port()),
        };
        tracing::debug!("listening for peer on {}:{}", addr.0, addr.1);
        Ok(Box::new(TcpPeerListener { listener, addr }))
    }
}

struct TcpPeerListener {
    listener: TcpListener,
    addr: (Ipv4Addr, u16),
}

#[async_trait]
impl PeerListener for TcpPeerListener {
    fn local_addr(&self) -> (Ipv4Addr, u16) {
        self.addr
    }

    async fn accept(&mut self) -> io::Result<BoxedStream> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::debug!("accepted peer connection from {peer}");
        Ok(Box::new(stream))
    }
}
