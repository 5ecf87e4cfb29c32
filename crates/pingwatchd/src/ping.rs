//! UDP ping transport.
//!
//! One socket does both jobs: it answers pings from other nodes and carries
//! our own probes. Outstanding probes are keyed by nonce; the receive loop
//! completes a probe when a pong with that nonce arrives from the peer the
//! probe was sent to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::Instant;
use zerocopy::AsBytes;

use pingwatch_core::wire::{FrameKind, PingFrame};
use pingwatch_core::PeerId;
use pingwatch_services::{ProbeError, Prober};

use crate::membership::PeerTable;

struct Pending {
    peer: PeerId,
    reply: oneshot::Sender<Instant>,
}

pub struct PingTransport {
    socket: Arc<UdpSocket>,
    self_id: PeerId,
    peers: PeerTable,
    pending: DashMap<u64, Pending>,
    next_nonce: AtomicU64,
}

/// Removes a probe's pending slot however the probe ends, including the
/// scheduler dropping it at the round deadline.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, Pending>,
    nonce: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.nonce);
    }
}

impl PingTransport {
    pub fn new(socket: Arc<UdpSocket>, self_id: PeerId, peers: PeerTable) -> Arc<Self> {
        Arc::new(Self {
            socket,
            self_id,
            peers,
            pending: DashMap::new(),
            next_nonce: AtomicU64::new(rand::random()),
        })
    }

    /// Answer pings and complete outstanding probes.
    ///
    /// Runs forever; cancel by dropping the task handle.
    pub async fn receive_loop(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; 512];

        tracing::info!(addr = %self.socket.local_addr()?, "ping responder listening");

        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "recv_from failed");
                    continue;
                }
            };

            let (frame, kind) = match PingFrame::parse(&buf[..len]) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::trace!(%from, error = %e, "dropping malformed datagram");
                    continue;
                }
            };

            let sender = frame.sender();
            if sender == self.self_id {
                tracing::trace!("ignoring own frame");
                continue;
            }

            match kind {
                FrameKind::Ping => {
                    self.peers.observe(sender, from);
                    let pong = frame.pong(self.self_id);
                    if let Err(e) = self.socket.send_to(pong.as_bytes(), from).await {
                        tracing::debug!(%from, error = %e, "failed to send pong");
                    }
                }
                FrameKind::Pong => {
                    let received_at = Instant::now();
                    let nonce = frame.nonce;
                    match self.pending.remove_if(&nonce, |_, p| p.peer == sender) {
                        Some((_, pending)) => {
                            let _ = pending.reply.send(received_at);
                        }
                        None => tracing::trace!(%from, nonce, "unsolicited or late pong"),
                    }
                    self.peers.observe(sender, from);
                }
            }
        }
    }
}

#[async_trait]
impl Prober for PingTransport {
    async fn probe(&self, peer: &PeerId, deadline: Instant) -> Result<Duration, ProbeError> {
        let addr = self.peers.addr_of(peer).ok_or(ProbeError::UnknownPeer(*peer))?;

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(nonce, Pending { peer: *peer, reply: tx });
        let _guard = PendingGuard {
            pending: &self.pending,
            nonce,
        };

        let frame = PingFrame::ping(nonce, self.self_id);
        let sent_at = Instant::now();
        self.socket.send_to(frame.as_bytes(), addr).await?;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(received_at)) => Ok(received_at.saturating_duration_since(sent_at)),
            Ok(Err(_)) => Err(ProbeError::TransportClosed),
            Err(_) => Err(ProbeError::DeadlineElapsed),
        }
    }
}
