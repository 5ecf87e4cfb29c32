pub mod capability;
pub mod last_seen;
pub mod metrics;
pub mod scheduler;

pub use capability::{Membership, MembershipError, ProbeError, Prober};
pub use last_seen::{EvictCallback, LastSeenError, PeerLastSeen};
pub use metrics::{GaugeRegistry, Labels, MetricsError, MetricsSink};
pub use scheduler::{
    peer_labels, rtt_gauges, ProbeScheduler, RoundSummary, SchedulerError, EWMA_GAUGE, EWMA_GAUGE_HELP,
    RTT_GAUGE, RTT_GAUGE_HELP,
};
