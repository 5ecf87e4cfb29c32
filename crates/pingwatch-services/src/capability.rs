//! What the probe scheduler needs from the rest of the node.
//!
//! The scheduler never talks to the network itself. It asks a `Prober` to
//! measure one peer and a `Membership` to list the peers worth measuring.
//! The daemon backs both with its UDP ping transport; tests back them with
//! scripted fakes.

use std::time::Duration;

use async_trait::async_trait;
use pingwatch_core::PeerId;
use tokio::time::Instant;

/// Measures round-trip latency to a single peer.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `peer`, giving up no later than `deadline`.
    ///
    /// The scheduler also drops the returned future at the round deadline,
    /// so implementations must not rely on running to completion.
    async fn probe(&self, peer: &PeerId, deadline: Instant) -> Result<Duration, ProbeError>;
}

/// Enumerates the peers currently known to this node.
#[async_trait]
pub trait Membership: Send + Sync {
    /// Called once at the start of every round.
    async fn current_peers(&self) -> Result<Vec<PeerId>, MembershipError>;
}

/// A single probe failed. Contained to that peer for that round.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("no address known for peer {0}")]
    UnknownPeer(PeerId),

    #[error("no reply before the round deadline")]
    DeadlineElapsed,

    #[error("probe transport closed")]
    TransportClosed,

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// The peer set could not be enumerated. Fatal for the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("membership source unavailable: {0}")]
    Unavailable(String),
}
