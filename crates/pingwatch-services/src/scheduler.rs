//! Probe scheduler: runs fixed-length probe rounds against every known peer.
//!
//! One round:
//!   1. snapshot the membership
//!   2. spawn one probe per peer (self excluded), all sharing one deadline
//!   3. each success refreshes the last-seen registry and sets the RTT gauges
//!   4. at the deadline, close the round and abort whatever is still running
//!
//! Failed or cancelled probes touch nothing. A peer that stops answering
//! simply stops being refreshed; the registry's sweep expires it, and the
//! eviction callback installed by `ProbeScheduler::start` deletes its
//! series. Gauges therefore live exactly as long as registry entries do.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio::time::Instant;

use pingwatch_core::{ConfigError, PeerId, ProbeConfig};

use crate::capability::{Membership, MembershipError, Prober};
use crate::last_seen::{EvictCallback, LastSeenError, PeerLastSeen};
use crate::metrics::{GaugeRegistry, Labels, MetricsError, MetricsSink};

/// Raw probe round-trip time, milliseconds.
pub const RTT_GAUGE: &str = "ping_rtt";
pub const RTT_GAUGE_HELP: &str = "Historical ping RTTs over time (ms)";

/// Exponentially weighted moving average of probe RTTs, milliseconds.
pub const EWMA_GAUGE: &str = "ping_ewma_rtt";
pub const EWMA_GAUGE_HELP: &str = "Exponentially weighted moving average of ping RTTs over time (ms)";

/// Label carrying the probed peer's id.
pub const TARGET_LABEL: &str = "targetHost";
/// Label carrying this node's host label.
pub const HOST_LABEL: &str = "host";

/// Weight of the newest sample in the RTT average.
const EWMA_SMOOTHING: f64 = 0.1;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] LastSeenError),

    #[error("membership enumeration failed: {0}")]
    Membership(#[from] MembershipError),

    #[error("peer registry went offline")]
    RegistryOffline,
}

/// How one probe task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Reply arrived in time and was recorded.
    Recorded,
    /// Reply arrived after the round closed and was dropped.
    Discarded,
    /// Prober returned an error.
    Failed,
    /// Deadline hit before the prober returned.
    TimedOut,
    /// Reply arrived but the registry refused the update.
    RegistryOffline,
}

/// Per-round tallies, mostly for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub probed: usize,
    pub recorded: usize,
    pub discarded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub aborted: usize,
}

impl RoundSummary {
    fn count(&mut self, outcome: ProbeOutcome) {
        match outcome {
            ProbeOutcome::Recorded => self.recorded += 1,
            ProbeOutcome::Discarded => self.discarded += 1,
            ProbeOutcome::Failed | ProbeOutcome::RegistryOffline => self.failed += 1,
            ProbeOutcome::TimedOut => self.timed_out += 1,
        }
    }
}

/// Open while a round is accepting results.
///
/// Probe tasks apply their side effects under the read lock, closing takes
/// the write lock. A result is therefore either fully applied before the
/// round closes or not applied at all.
#[derive(Clone)]
struct RoundGate(Arc<RwLock<bool>>);

impl RoundGate {
    fn open() -> Self {
        Self(Arc::new(RwLock::new(true)))
    }

    /// Run `f` if the round is still open. Returns None if it was closed.
    fn apply<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let open = self.0.read().unwrap_or_else(PoisonError::into_inner);
        if *open {
            Some(f())
        } else {
            None
        }
    }

    fn close(&self) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

/// What the scheduler keeps per peer next to its series.
#[derive(Debug, Clone, Copy)]
struct PeerSeries {
    ewma_ms: f64,
    /// Timestamp handed to the registry by the latest recorded reply.
    recorded_at: Instant,
}

type SeriesState = Arc<DashMap<PeerId, PeerSeries>>;

/// Writes probe results into the registry and the metrics sink.
#[derive(Clone)]
struct Recorder {
    registry: PeerLastSeen<PeerId>,
    metrics: Arc<dyn MetricsSink>,
    series: SeriesState,
    host_label: String,
}

impl Recorder {
    /// Holds the peer's state entry for the whole update, so an eviction
    /// callback for the same peer runs entirely before or after it.
    fn record(&self, peer: PeerId, rtt: Duration) -> ProbeOutcome {
        let now = Instant::now();
        let entry = self.series.entry(peer);

        if let Err(e) = self.registry.update_last_seen_at(peer, now) {
            tracing::warn!(peer = %peer, error = %e, "unable to update last seen");
            return ProbeOutcome::RegistryOffline;
        }

        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        let mut state = match entry {
            Entry::Occupied(e) => {
                let mut state = e.into_ref();
                state.ewma_ms = EWMA_SMOOTHING * rtt_ms + (1.0 - EWMA_SMOOTHING) * state.ewma_ms;
                state
            }
            Entry::Vacant(e) => e.insert(PeerSeries {
                ewma_ms: rtt_ms,
                recorded_at: now,
            }),
        };
        state.recorded_at = now;

        let labels = peer_labels(peer, &self.host_label);
        self.metrics.set(RTT_GAUGE, &labels, rtt_ms);
        self.metrics.set(EWMA_GAUGE, &labels, state.ewma_ms);

        tracing::trace!(peer = %peer.short(), rtt_ms, ewma_ms = state.ewma_ms, "probe ok");
        ProbeOutcome::Recorded
    }
}

/// The label set of a peer's gauges.
pub fn peer_labels(peer: PeerId, host_label: &str) -> Labels {
    Labels::new()
        .with(TARGET_LABEL, peer.to_string())
        .with(HOST_LABEL, host_label)
}

/// A gauge registry with `ping_rtt` and `ping_ewma_rtt` declared.
pub fn rtt_gauges() -> Result<GaugeRegistry, MetricsError> {
    let gauges = GaugeRegistry::new();
    gauges.describe(RTT_GAUGE, RTT_GAUGE_HELP, &[TARGET_LABEL, HOST_LABEL])?;
    gauges.describe(EWMA_GAUGE, EWMA_GAUGE_HELP, &[TARGET_LABEL, HOST_LABEL])?;
    Ok(gauges)
}

/// Eviction callback: drop the peer's smoothing state and both series.
/// Deletion is best-effort; a missing series is logged, not retried.
///
/// The callback runs some time after the registry evicted the peer. The
/// evicted timestamp was older than `ttl` at eviction and only gets older,
/// so state recorded within `ttl` belongs to a later reply and is kept.
fn expire_metrics(
    metrics: Arc<dyn MetricsSink>,
    series: SeriesState,
    host_label: String,
    ttl: Duration,
) -> EvictCallback<PeerId> {
    Arc::new(move |peer: PeerId| match series.entry(peer) {
        Entry::Occupied(e) if e.get().recorded_at.elapsed() <= ttl => {
            tracing::debug!(peer = %peer.short(), "peer recorded again since eviction, keeping series");
        }
        entry => {
            let labels = peer_labels(peer, &host_label);
            for name in [RTT_GAUGE, EWMA_GAUGE] {
                if !metrics.delete(name, &labels) {
                    tracing::warn!(peer = %peer, metric = name, "failed to delete gauge for expired peer");
                }
            }
            if let Entry::Occupied(e) = entry {
                e.remove();
            }
            tracing::info!(peer = %peer.short(), "peer expired");
        }
    })
}

/// Drives probe rounds for one node.
pub struct ProbeScheduler {
    self_id: PeerId,
    config: ProbeConfig,
    prober: Arc<dyn Prober>,
    membership: Arc<dyn Membership>,
    recorder: Recorder,
}

impl ProbeScheduler {
    /// Build the last-seen registry with gauge cleanup wired in as its
    /// eviction callback, and return a scheduler ready to run rounds.
    pub async fn start(
        self_id: PeerId,
        host_label: impl Into<String>,
        config: ProbeConfig,
        prober: Arc<dyn Prober>,
        membership: Arc<dyn Membership>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let host_label = host_label.into();

        let series = Arc::new(DashMap::new());
        let on_evict = expire_metrics(metrics.clone(), series.clone(), host_label.clone(), config.ttl);
        let registry =
            PeerLastSeen::with_sweep_interval(config.ttl, config.sweep_interval, Some(on_evict))
                .await?;

        tracing::info!(
            node = %self_id.short(),
            host = %host_label,
            ttl_secs = config.ttl.as_secs_f64(),
            round_ms = config.round_deadline.as_millis() as u64,
            "probe scheduler ready"
        );

        Ok(Self {
            self_id,
            config,
            prober,
            membership,
            recorder: Recorder {
                registry,
                metrics,
                series,
                host_label,
            },
        })
    }

    /// The registry this scheduler refreshes.
    pub fn registry(&self) -> &PeerLastSeen<PeerId> {
        &self.recorder.registry
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Run rounds back to back until one fails fatally.
    ///
    /// Only returns on error: membership enumeration failing or the
    /// registry going offline. Neither is retried here; the caller is
    /// expected to tear the component down.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        tracing::info!("starting RTT collection from peers");
        let mut round: u64 = 0;
        loop {
            round += 1;
            let summary = self.run_round().await?;
            tracing::debug!(
                round,
                probed = summary.probed,
                recorded = summary.recorded,
                failed = summary.failed,
                timed_out = summary.timed_out,
                discarded = summary.discarded,
                "probe round complete"
            );
        }
    }

    /// Run one round. Returns when the round deadline has passed and every
    /// probe task of the round has finished or been aborted.
    pub async fn run_round(&self) -> Result<RoundSummary, SchedulerError> {
        if !self.recorder.registry.is_ready() {
            tracing::error!("peer registry offline, stopping probe rounds");
            return Err(SchedulerError::RegistryOffline);
        }

        let deadline = Instant::now() + self.config.round_deadline;
        let peers: HashSet<PeerId> = self
            .membership
            .current_peers()
            .await?
            .into_iter()
            .filter(|peer| *peer != self.self_id)
            .collect();

        let gate = RoundGate::open();
        let mut tasks = JoinSet::new();
        for peer in peers {
            let prober = self.prober.clone();
            let recorder = self.recorder.clone();
            let gate = gate.clone();
            tasks.spawn(async move {
                match tokio::time::timeout_at(deadline, prober.probe(&peer, deadline)).await {
                    Ok(Ok(rtt)) => gate
                        .apply(|| recorder.record(peer, rtt))
                        .unwrap_or(ProbeOutcome::Discarded),
                    Ok(Err(e)) => {
                        tracing::debug!(peer = %peer.short(), error = %e, "failed to ping");
                        ProbeOutcome::Failed
                    }
                    Err(_) => {
                        tracing::debug!(peer = %peer.short(), "no reply before round deadline");
                        ProbeOutcome::TimedOut
                    }
                }
            });
        }

        let mut summary = RoundSummary {
            probed: tasks.len(),
            ..RoundSummary::default()
        };

        tokio::time::sleep_until(deadline).await;
        gate.close();
        tasks.abort_all();

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(outcome) => summary.count(outcome),
                Err(e) if e.is_cancelled() => summary.aborted += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "probe task panicked");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}
