//! Peer transport seam.
//!
//! Sessions never touch sockets directly. They dial through a
//! [`PeerTransport`] and exchange whole frames over a [`Connection`];
//! inbound sessions arrive through an [`Incoming`] acceptor.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

pub mod framed;
pub mod memory;

pub use framed::{FramedConnection, TcpIncoming, TcpTransport};
pub use memory::{MemoryIncoming, MemoryNetwork, MemoryTransport};

/// One established, ordered, bidirectional frame stream to a peer.
#[async_trait]
pub trait Connection: Send {
    /// Logical address of the other node.
    fn peer(&self) -> SocketAddr;

    /// Address actually dialed. Equal to [`Connection::peer`] unless proxied.
    fn connecting(&self) -> SocketAddr;

    /// Send one encoded frame. Fails with `ConnectionLost` once the link is gone.
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Receive the next frame. Fails with `ConnectionLost` once the link is gone.
    async fn receive(&mut self) -> Result<Bytes>;

    async fn close(&mut self) -> Result<()>;
}

pub type BoxConnection = Box<dyn Connection>;

/// Dials peers. Fails with `PeerUnreachable` when no connection can be made.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn connect(&self, peer: SocketAddr) -> Result<BoxConnection>;
}

/// Source of inbound connections. `None` once the listener is closed.
#[async_trait]
pub trait Incoming: Send {
    async fn accept(&mut self) -> Option<BoxConnection>;
}
