use crate::*;

use pingwatch_services::{peer_labels, SchedulerError, RTT_GAUGE};

// ══════════════════════════════════════════════════════════════════════════════
//  Failure containment
// ══════════════════════════════════════════════════════════════════════════════

/// One peer erroring and another hanging must not affect a third that
/// answers, and must not shorten or lengthen the round.
#[tokio::test(start_paused = true)]
async fn test_probe_failures_are_contained_per_peer() {
    let ok = peer("ok");
    let erroring = peer("erroring");
    let hanging = peer("hanging");
    let node = start_node(fast_config(), &[ok, erroring, hanging]).await;
    node.prober.script(ok, Reply::After(Duration::from_millis(50)));
    node.prober.script(erroring, Reply::Error);
    node.prober.script(hanging, Reply::Never);

    let started = Instant::now();
    let summary = node.scheduler.run_round().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1100));
    assert_eq!(summary.probed, 3);
    assert_eq!(summary.recorded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.timed_out + summary.aborted, 1);

    assert_eq!(node.gauges.series_count(RTT_GAUGE), 1);
    assert_eq!(node.gauges.get(RTT_GAUGE, &peer_labels(ok, HOST)), Some(50.0));
}

#[tokio::test(start_paused = true)]
async fn test_self_and_duplicates_are_probed_once_or_never() {
    let a = peer("a");
    let node = start_node(fast_config(), &[]).await;
    node.membership.set(&[a, node.id, a, a]);
    node.prober.script(a, Reply::After(Duration::from_millis(10)));
    node.prober.script(node.id, Reply::After(Duration::from_millis(10)));

    let summary = node.scheduler.run_round().await.unwrap();

    assert_eq!(summary.probed, 1);
    assert_eq!(node.prober.calls(&a), 1);
    assert_eq!(node.prober.calls(&node.id), 0);
    assert_eq!(node.scheduler.registry().last_seen(&node.id), Ok(None));
}

/// Membership enumeration failing is fatal: the run loop stops and hands
/// the error to the caller.
#[tokio::test(start_paused = true)]
async fn test_membership_failure_stops_the_scheduler() {
    let a = peer("a");
    let node = start_node(fast_config(), &[a]).await;
    node.prober.script(a, Reply::After(Duration::from_millis(10)));

    node.scheduler.run_round().await.unwrap();
    node.membership.break_with("peerstore closed");

    let err = node.scheduler.run().await.unwrap_err();
    assert!(matches!(err, SchedulerError::Membership(_)));
    assert!(err.to_string().contains("peerstore closed"));

    // The registry itself is unaffected.
    assert!(node.scheduler.registry().is_ready());
}

#[tokio::test]
async fn test_invalid_timings_are_rejected_up_front() {
    for config in [
        ProbeConfig { ttl: Duration::ZERO, ..fast_config() },
        ProbeConfig { sweep_interval: Duration::ZERO, ..fast_config() },
        ProbeConfig { round_deadline: Duration::ZERO, ..fast_config() },
    ] {
        let result = ProbeScheduler::start(
            peer("self"),
            HOST,
            config,
            ScriptedProber::new(),
            ScriptedMembership::with_peers(&[]),
            Arc::new(rtt_gauges().unwrap()),
        )
        .await;
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }
}
