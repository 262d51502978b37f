//! Length-prefixed frames over any byte stream, and a TCP transport built on it.

use super::{BoxConnection, Connection, Incoming, PeerTransport};
use crate::error::{Result, StreamError};
use crate::streaming::protocol::{read_frame, write_frame};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Wraps a byte stream and moves whole protocol frames over it.
pub struct FramedConnection<S> {
    peer: SocketAddr,
    connecting: SocketAddr,
    stream: S,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(peer: SocketAddr, connecting: SocketAddr, stream: S) -> Self {
        Self {
            peer,
            connecting,
            stream,
        }
    }

    fn map_io(&self, err: StreamError) -> StreamError {
        match err {
            StreamError::Io(e)
                if matches!(
                    e.kind(),
                    ErrorKind::UnexpectedEof
                        | ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::BrokenPipe
                ) =>
            {
                StreamError::ConnectionLost {
                    peer: self.peer,
                    reason: e.to_string(),
                }
            }
            other => other,
        }
    }
}

#[async_trait]
impl<S> Connection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn connecting(&self) -> SocketAddr {
        self.connecting
    }

    async fn send(&mut self, frame: Bytes) -> Result<()> {
        let result = match write_frame(&mut self.stream, &frame).await {
            Ok(()) => self.stream.flush().await.map_err(StreamError::from),
            Err(e) => Err(e),
        };
        result.map_err(|e| self.map_io(e))
    }

    async fn receive(&mut self) -> Result<Bytes> {
        let result = read_frame(&mut self.stream).await;
        result.map_err(|e| self.map_io(e))
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Dials peers over plain TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn connect(&self, peer: SocketAddr) -> Result<BoxConnection> {
        let stream = TcpStream::connect(peer)
            .await
            .map_err(|e| StreamError::PeerUnreachable {
                peer,
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        Ok(Box::new(FramedConnection::new(peer, peer, stream)))
    }
}

/// Accepts framed TCP connections.
pub struct TcpIncoming {
    listener: TcpListener,
}

impl TcpIncoming {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Incoming for TcpIncoming {
    async fn accept(&mut self) -> Option<BoxConnection> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    return Some(Box::new(FramedConnection::new(peer, peer, stream)));
                }
                Err(e) => {
                    tracing::warn!("Failed to accept stream connection: {}", e);
                    if e.kind() != ErrorKind::ConnectionAborted {
                        return None;
                    }
                }
            }
        }
    }
}
