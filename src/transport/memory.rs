//! In-process network for wiring several nodes together in one process.
//!
//! Every bound address gets a listener queue. Links are pairs of unbounded
//! channels plus a shared "severed" flag, which lets callers simulate a
//! peer disappearing mid-conversation.

use super::{BoxConnection, Connection, Incoming, PeerTransport};
use crate::error::{Result, StreamError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<SocketAddr, mpsc::UnboundedSender<BoxConnection>>,
    unreachable: HashSet<SocketAddr>,
    proxies: HashMap<SocketAddr, SocketAddr>,
    /// Frames a dialer may send to this address before the link drops.
    disconnect_after: HashMap<SocketAddr, usize>,
    latency: Option<Duration>,
    links: Vec<(SocketAddr, SocketAddr, watch::Sender<bool>)>,
}

/// Shared switchboard for [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `addr` and return its dialer and acceptor.
    pub fn bind(&self, addr: SocketAddr) -> (MemoryTransport, MemoryIncoming) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().listeners.insert(addr, tx);
        (
            MemoryTransport {
                local: addr,
                network: self.clone(),
            },
            MemoryIncoming { rx },
        )
    }

    /// Refuse new connections to `addr`.
    pub fn set_unreachable(&self, addr: SocketAddr, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(addr);
        } else {
            state.unreachable.remove(&addr);
        }
    }

    /// Dial `via` whenever `peer` is requested.
    pub fn route_through(&self, peer: SocketAddr, via: SocketAddr) {
        self.lock().proxies.insert(peer, via);
    }

    /// Drop any future link to `peer` after the dialer has sent `frames` frames.
    pub fn disconnect_after(&self, peer: SocketAddr, frames: usize) {
        self.lock().disconnect_after.insert(peer, frames);
    }

    /// Delay every frame by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Sever every open link between `a` and `b`. Returns how many were cut.
    pub fn sever(&self, a: SocketAddr, b: SocketAddr) -> usize {
        let state = self.lock();
        let mut cut = 0;
        for (x, y, flag) in &state.links {
            if (*x == a && *y == b) || (*x == b && *y == a) {
                flag.send_replace(true);
                cut += 1;
            }
        }
        cut
    }

    fn latency(&self) -> Option<Duration> {
        self.lock().latency
    }
}

/// Dialer bound to one local address of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    local: SocketAddr,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn connect(&self, peer: SocketAddr) -> Result<BoxConnection> {
        let mut state = self.network.lock();
        let target = state.proxies.get(&peer).copied().unwrap_or(peer);

        if state.unreachable.contains(&peer) || state.unreachable.contains(&target) {
            return Err(StreamError::PeerUnreachable {
                peer,
                reason: "connection refused".to_string(),
            });
        }
        let listener = state
            .listeners
            .get(&target)
            .cloned()
            .ok_or_else(|| StreamError::PeerUnreachable {
                peer,
                reason: format!("no listener at {}", target),
            })?;

        let (severed_tx, severed_rx) = watch::channel(false);
        let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
        let (to_local_tx, to_local_rx) = mpsc::unbounded_channel();
        let budget = state.disconnect_after.get(&peer).copied();

        let accepted = MemoryConnection {
            peer: self.local,
            connecting: self.local,
            tx: to_local_tx,
            rx: to_peer_rx,
            severed: severed_rx.clone(),
            sever_handle: None,
            budget: None,
            network: self.network.clone(),
        };
        listener
            .send(Box::new(accepted))
            .map_err(|_| StreamError::PeerUnreachable {
                peer,
                reason: "listener closed".to_string(),
            })?;

        let dialer = MemoryConnection {
            peer,
            connecting: target,
            tx: to_peer_tx,
            rx: to_local_rx,
            severed: severed_rx,
            sever_handle: budget.map(|_| severed_tx.clone()),
            budget,
            network: self.network.clone(),
        };
        state.links.retain(|(_, _, flag)| !flag.is_closed());
        state.links.push((self.local, peer, severed_tx));

        Ok(Box::new(dialer))
    }
}

/// Acceptor side of [`MemoryNetwork::bind`].
pub struct MemoryIncoming {
    rx: mpsc::UnboundedReceiver<BoxConnection>,
}

#[async_trait]
impl Incoming for MemoryIncoming {
    async fn accept(&mut self) -> Option<BoxConnection> {
        self.rx.recv().await
    }
}

struct MemoryConnection {
    peer: SocketAddr,
    connecting: SocketAddr,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    severed: watch::Receiver<bool>,
    sever_handle: Option<watch::Sender<bool>>,
    budget: Option<usize>,
    network: MemoryNetwork,
}

impl MemoryConnection {
    fn lost(&self, reason: &str) -> StreamError {
        StreamError::ConnectionLost {
            peer: self.peer,
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn connecting(&self) -> SocketAddr {
        self.connecting
    }

    async fn send(&mut self, frame: Bytes) -> Result<()> {
        if let Some(latency) = self.network.latency() {
            tokio::time::sleep(latency).await;
        }
        if *self.severed.borrow() {
            return Err(self.lost("link severed"));
        }
        if let Some(budget) = self.budget.as_mut() {
            if *budget == 0 {
                if let Some(handle) = &self.sever_handle {
                    handle.send_replace(true);
                }
                return Err(self.lost("peer disconnected"));
            }
            *budget -= 1;
        }
        self.tx
            .send(frame)
            .map_err(|_| self.lost("peer closed connection"))
    }

    async fn receive(&mut self) -> Result<Bytes> {
        // Frames delivered before the link dropped are still readable
        if let Ok(frame) = self.rx.try_recv() {
            return Ok(frame);
        }
        if *self.severed.borrow() {
            return Err(self.lost("link severed"));
        }
        let peer = self.peer;
        let lost = |reason: &str| StreamError::ConnectionLost {
            peer,
            reason: reason.to_string(),
        };
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame.ok_or_else(|| lost("peer closed connection")),
            Ok(_) = self.severed.wait_for(|s| *s) => Err(lost("link severed")),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let net = MemoryNetwork::new();
        let (a, _a_in) = net.bind(addr(1));
        let (_b, mut b_in) = net.bind(addr(2));

        let mut dialer = a.connect(addr(2)).await.unwrap();
        let mut accepted = b_in.accept().await.unwrap();
        assert_eq!(accepted.peer(), addr(1));

        dialer.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(&accepted.receive().await.unwrap()[..], b"ping");
        accepted.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(&dialer.receive().await.unwrap()[..], b"pong");
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let net = MemoryNetwork::new();
        let (a, _a_in) = net.bind(addr(1));
        let err = a.connect(addr(9)).await.err().unwrap();
        assert!(matches!(err, StreamError::PeerUnreachable { .. }));

        let (_b, _b_in) = net.bind(addr(2));
        net.set_unreachable(addr(2), true);
        assert!(a.connect(addr(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_after_budget() {
        let net = MemoryNetwork::new();
        let (a, _a_in) = net.bind(addr(1));
        let (_b, mut b_in) = net.bind(addr(2));
        net.disconnect_after(addr(2), 1);

        let mut dialer = a.connect(addr(2)).await.unwrap();
        let mut accepted = b_in.accept().await.unwrap();
        dialer.send(Bytes::from_static(b"one")).await.unwrap();
        assert!(matches!(
            dialer.send(Bytes::from_static(b"two")).await,
            Err(StreamError::ConnectionLost { .. })
        ));

        accepted.receive().await.unwrap();
        assert!(matches!(
            accepted.receive().await,
            Err(StreamError::ConnectionLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_proxy_sets_connecting_address() {
        let net = MemoryNetwork::new();
        let (a, _a_in) = net.bind(addr(1));
        let (_proxy, mut proxy_in) = net.bind(addr(3));
        net.route_through(addr(2), addr(3));

        let dialer = a.connect(addr(2)).await.unwrap();
        assert_eq!(dialer.peer(), addr(2));
        assert_eq!(dialer.connecting(), addr(3));
        assert!(proxy_in.accept().await.is_some());
    }

    #[tokio::test]
    async fn test_sever_link() {
        let net = MemoryNetwork::new();
        let (a, _a_in) = net.bind(addr(1));
        let (_b, mut b_in) = net.bind(addr(2));
        let mut dialer = a.connect(addr(2)).await.unwrap();
        let mut accepted = b_in.accept().await.unwrap();

        assert_eq!(net.sever(addr(2), addr(1)), 1);
        assert!(dialer.send(Bytes::from_static(b"x")).await.is_err());
        assert!(accepted.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_delivered_frames_survive_sever() {
        let net = MemoryNetwork::new();
        let (a, _a_in) = net.bind(addr(1));
        let (_b, mut b_in) = net.bind(addr(2));
        let mut dialer = a.connect(addr(2)).await.unwrap();
        let mut accepted = b_in.accept().await.unwrap();

        dialer.send(Bytes::from_static(b"first")).await.unwrap();
        dialer.send(Bytes::from_static(b"second")).await.unwrap();
        net.sever(addr(1), addr(2));

        assert_eq!(&accepted.receive().await.unwrap()[..], b"first");
        assert_eq!(&accepted.receive().await.unwrap()[..], b"second");
        assert!(matches!(
            accepted.receive().await,
            Err(StreamError::ConnectionLost { .. })
        ));
    }
}
