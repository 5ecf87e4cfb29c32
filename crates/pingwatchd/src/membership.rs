//! Peer table: the set of peers the probe scheduler measures.
//!
//! Bootstrap peers come from config and stay for the life of the daemon.
//! Learned peers are added when a ping arrives from a sender we have not
//! heard of, and are dropped once nothing has been heard from them for the
//! peer TTL. Dropping a peer here only stops future probes; its series are
//! expired by the last-seen registry on its own schedule.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use pingwatch_core::PeerId;
use pingwatch_services::{Membership, MembershipError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOrigin {
    /// Listed in the config file.
    Bootstrap,
    /// Pinged us first.
    Learned,
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Where pings for this peer are sent.
    pub addr: SocketAddr,
    pub origin: PeerOrigin,
    /// Last datagram of any kind received from this peer.
    pub last_heard: Instant,
}

/// Shared between the ping transport, the scheduler, and the status server.
#[derive(Clone)]
pub struct PeerTable {
    peers: Arc<DashMap<PeerId, PeerEntry>>,
    learned_ttl: Duration,
}

impl PeerTable {
    pub fn new(learned_ttl: Duration) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            learned_ttl,
        }
    }

    pub fn add_bootstrap(&self, id: PeerId, addr: SocketAddr) {
        tracing::info!(peer = %id.short(), %addr, "bootstrap peer");
        self.peers.insert(
            id,
            PeerEntry {
                addr,
                origin: PeerOrigin::Bootstrap,
                last_heard: Instant::now(),
            },
        );
    }

    /// A datagram from `id` arrived from `addr`.
    ///
    /// Unknown senders join as learned peers. Known peers get their address
    /// updated, so a peer that rebinds keeps being probed.
    pub fn observe(&self, id: PeerId, addr: SocketAddr) {
        let now = Instant::now();
        match self.peers.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                if entry.addr != addr {
                    tracing::debug!(peer = %id.short(), old = %entry.addr, new = %addr, "peer address changed");
                    entry.addr = addr;
                }
                entry.last_heard = now;
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                tracing::info!(peer = %id.short(), %addr, "peer joined");
                e.insert(PeerEntry {
                    addr,
                    origin: PeerOrigin::Learned,
                    last_heard: now,
                });
            }
        }
    }

    pub fn addr_of(&self, id: &PeerId) -> Option<SocketAddr> {
        self.peers.get(id).map(|e| e.addr)
    }

    #[cfg(test)]
    pub fn get(&self, id: &PeerId) -> Option<PeerEntry> {
        self.peers.get(id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Every peer with its current address, without pruning.
    pub fn entries(&self) -> Vec<(PeerId, PeerEntry)> {
        self.peers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Drop learned peers not heard from within the TTL, then list the rest.
    pub fn current(&self) -> Vec<PeerId> {
        let ttl = self.learned_ttl;
        self.peers.retain(|id, entry| {
            let keep = entry.origin == PeerOrigin::Bootstrap || entry.last_heard.elapsed() <= ttl;
            if !keep {
                tracing::info!(peer = %id.short(), addr = %entry.addr, "peer left");
            }
            keep
        });
        self.peers.iter().map(|e| *e.key()).collect()
    }
}

#[async_trait]
impl Membership for PeerTable {
    async fn current_peers(&self) -> Result<Vec<PeerId>, MembershipError> {
        Ok(self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_sender_joins_as_learned() {
        let table = PeerTable::new(Duration::from_secs(10));
        let peer = PeerId::derive(b"peer");

        table.observe(peer, addr(4001));

        let entry = table.get(&peer).unwrap();
        assert_eq!(entry.origin, PeerOrigin::Learned);
        assert_eq!(entry.addr, addr(4001));
        assert_eq!(table.current(), vec![peer]);
    }

    #[tokio::test(start_paused = true)]
    async fn observe_tracks_address_changes() {
        let table = PeerTable::new(Duration::from_secs(10));
        let peer = PeerId::derive(b"peer");

        table.add_bootstrap(peer, addr(4001));
        table.observe(peer, addr(5001));

        let entry = table.get(&peer).unwrap();
        assert_eq!(entry.addr, addr(5001));
        assert_eq!(entry.origin, PeerOrigin::Bootstrap);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_learned_peers_are_pruned() {
        let table = PeerTable::new(Duration::from_secs(10));
        let learned = PeerId::derive(b"learned");
        let boot = PeerId::derive(b"boot");

        table.add_bootstrap(boot, addr(4001));
        table.observe(learned, addr(4002));
        assert_eq!(table.len(), 2);

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(table.current(), vec![boot]);
        assert!(table.addr_of(&learned).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hearing_from_a_peer_keeps_it() {
        let table = PeerTable::new(Duration::from_secs(10));
        let learned = PeerId::derive(b"learned");

        table.observe(learned, addr(4002));
        tokio::time::sleep(Duration::from_secs(8)).await;
        table.observe(learned, addr(4002));
        tokio::time::sleep(Duration::from_secs(8)).await;

        let peers = table.current_peers().await.unwrap();
        assert_eq!(peers, vec![learned]);
    }
}
