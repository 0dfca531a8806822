//! Transport - TCP byte streams and the listener used by observers.
//!
//! Sessions are generic over any async byte stream, so production
//! traffic runs over TCP while tests run over in-memory duplex pipes.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;

/// Maximum bytes moved per read or write call on a byte stream.
pub const MAX_TRANSFER_UNIT: usize = 1024;

/// A bidirectional async byte transport.
///
/// Blanket-implemented for everything that satisfies the bounds, so any
/// tokio stream type (TCP, duplex, ...) can back a session.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ByteStream for T {}

/// Connect to a peer endpoint.
pub async fn connect(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// TCP listener used by the observer side to accept producer connections.
pub struct StreamListener {
    listener: TcpListener,
}

impl StreamListener {
    /// Bind to the given address. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Accept one inbound connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
