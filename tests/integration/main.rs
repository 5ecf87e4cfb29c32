//! pingwatch integration test harness.
//!
//! Drives the probe scheduler and the last-seen registry together against
//! scripted membership and probers. Everything runs on tokio's paused
//! clock, so multi-second TTL scenarios finish instantly and
//! deterministically:
//!
//!   cargo test --test integration

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use pingwatch_core::{PeerId, ProbeConfig};
use pingwatch_services::{
    rtt_gauges, GaugeRegistry, Membership, MembershipError, ProbeError, ProbeScheduler, Prober,
};

mod expiry;
mod failures;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const HOST: &str = "test-host";

pub fn peer(name: &str) -> PeerId {
    PeerId::derive(name.as_bytes())
}

/// Short timings so a peer expires two rounds after it drops out.
pub fn fast_config() -> ProbeConfig {
    ProbeConfig {
        ttl: Duration::from_secs(2),
        sweep_interval: Duration::from_secs(1),
        round_deadline: Duration::from_secs(1),
    }
}

/// Membership whose peer list the test edits between rounds.
#[derive(Default)]
pub struct ScriptedMembership {
    peers: Mutex<Vec<PeerId>>,
    broken: Mutex<Option<String>>,
}

impl ScriptedMembership {
    pub fn with_peers(peers: &[PeerId]) -> Arc<Self> {
        let m = Self::default();
        *m.peers.lock().unwrap() = peers.to_vec();
        Arc::new(m)
    }

    pub fn set(&self, peers: &[PeerId]) {
        *self.peers.lock().unwrap() = peers.to_vec();
    }

    pub fn break_with(&self, reason: &str) {
        *self.broken.lock().unwrap() = Some(reason.to_string());
    }
}

#[async_trait]
impl Membership for ScriptedMembership {
    async fn current_peers(&self) -> Result<Vec<PeerId>, MembershipError> {
        if let Some(reason) = self.broken.lock().unwrap().clone() {
            return Err(MembershipError::Unavailable(reason));
        }
        Ok(self.peers.lock().unwrap().clone())
    }
}

/// How a scripted peer answers.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    After(Duration),
    Error,
    Never,
}

/// Prober with a scripted reply per peer. Unscripted peers never answer.
#[derive(Default)]
pub struct ScriptedProber {
    replies: Mutex<HashMap<PeerId, Reply>>,
    calls: Mutex<HashMap<PeerId, usize>>,
}

impl ScriptedProber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, peer: PeerId, reply: Reply) {
        self.replies.lock().unwrap().insert(peer, reply);
    }

    pub fn calls(&self, peer: &PeerId) -> usize {
        self.calls.lock().unwrap().get(peer).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, peer: &PeerId, deadline: Instant) -> Result<Duration, ProbeError> {
        *self.calls.lock().unwrap().entry(*peer).or_default() += 1;
        let reply = self.replies.lock().unwrap().get(peer).copied();
        match reply.unwrap_or(Reply::Never) {
            Reply::After(delay) => {
                tokio::time::sleep(delay).await;
                Ok(delay)
            }
            Reply::Error => Err(ProbeError::UnknownPeer(*peer)),
            Reply::Never => {
                tokio::time::sleep_until(deadline + Duration::from_secs(60)).await;
                Err(ProbeError::DeadlineElapsed)
            }
        }
    }
}

pub struct Node {
    pub id: PeerId,
    pub scheduler: ProbeScheduler,
    pub prober: Arc<ScriptedProber>,
    pub membership: Arc<ScriptedMembership>,
    pub gauges: Arc<GaugeRegistry>,
}

pub async fn start_node(config: ProbeConfig, peers: &[PeerId]) -> Node {
    let id = peer("self");
    let prober = ScriptedProber::new();
    let membership = ScriptedMembership::with_peers(peers);
    let gauges = Arc::new(rtt_gauges().expect("gauges should register"));
    let scheduler = ProbeScheduler::start(
        id,
        HOST,
        config,
        prober.clone(),
        membership.clone(),
        gauges.clone(),
    )
    .await
    .expect("scheduler should start");
    Node {
        id,
        scheduler,
        prober,
        membership,
        gauges,
    }
}

// ── Smoke ─────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_node_starts_ready_and_empty() {
    let node = start_node(fast_config(), &[]).await;
    assert!(node.scheduler.registry().is_ready());
    assert_eq!(node.scheduler.registry().len(), Ok(0));
    assert_eq!(node.scheduler.self_id(), node.id);
    assert_eq!(node.gauges.render().unwrap(), "");
}
