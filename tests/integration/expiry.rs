use crate::*;

use pingwatch_services::{peer_labels, EWMA_GAUGE, RTT_GAUGE};

// ══════════════════════════════════════════════════════════════════════════════
//  Series lifetime follows last-seen TTL
// ══════════════════════════════════════════════════════════════════════════════

/// X answers for three rounds and then leaves the membership. Its series
/// must survive while its entry is within TTL, then disappear once the
/// sweep expires it. Y keeps answering throughout and is never touched.
#[tokio::test(start_paused = true)]
async fn test_departed_peer_series_expire_with_ttl() {
    let x = peer("x");
    let y = peer("y");
    let node = start_node(fast_config(), &[x, y]).await;
    node.prober.script(x, Reply::After(Duration::from_millis(10)));
    node.prober.script(y, Reply::After(Duration::from_millis(20)));

    let x_labels = peer_labels(x, HOST);
    let y_labels = peer_labels(y, HOST);

    for _ in 0..3 {
        let summary = node.scheduler.run_round().await.unwrap();
        assert_eq!(summary.recorded, 2);
    }
    assert_eq!(node.gauges.get(RTT_GAUGE, &x_labels), Some(10.0));
    assert!(node.gauges.get(EWMA_GAUGE, &x_labels).is_some());

    node.membership.set(&[y]);

    // Round 4: X last refreshed ~2s ago, still inside TTL.
    node.scheduler.run_round().await.unwrap();
    assert!(node.gauges.get(RTT_GAUGE, &x_labels).is_some());
    assert!(node.scheduler.registry().last_seen(&x).unwrap().is_some());

    // Round 5, then at most one more sweep interval.
    node.scheduler.run_round().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert_eq!(node.scheduler.registry().last_seen(&x), Ok(None));
    assert_eq!(node.gauges.get(RTT_GAUGE, &x_labels), None);
    assert_eq!(node.gauges.get(EWMA_GAUGE, &x_labels), None);

    assert_eq!(node.gauges.get(RTT_GAUGE, &y_labels), Some(20.0));
    assert_eq!(node.gauges.get(EWMA_GAUGE, &y_labels), Some(20.0));
    assert_eq!(node.gauges.series_count(RTT_GAUGE), 1);
    assert!(!node.gauges.render().unwrap().contains(&x.to_string()));
}

/// A peer that stays in the membership but stops answering expires the
/// same way as one that left.
#[tokio::test(start_paused = true)]
async fn test_unresponsive_member_expires() {
    let x = peer("x");
    let node = start_node(fast_config(), &[x]).await;
    node.prober.script(x, Reply::After(Duration::from_millis(10)));

    node.scheduler.run_round().await.unwrap();
    assert_eq!(node.gauges.series_count(RTT_GAUGE), 1);

    node.prober.script(x, Reply::Error);
    for _ in 0..3 {
        let summary = node.scheduler.run_round().await.unwrap();
        assert_eq!(summary.recorded, 0);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(node.prober.calls(&x), 4);
    assert_eq!(node.scheduler.registry().len(), Ok(0));
    assert_eq!(node.gauges.series_count(RTT_GAUGE), 0);
    assert_eq!(node.gauges.series_count(EWMA_GAUGE), 0);
}

/// After expiry, a returning peer starts a fresh series and a fresh
/// average rather than inheriting the old one.
#[tokio::test(start_paused = true)]
async fn test_returning_peer_starts_fresh() {
    let x = peer("x");
    let node = start_node(fast_config(), &[x]).await;
    let labels = peer_labels(x, HOST);

    node.prober.script(x, Reply::After(Duration::from_millis(500)));
    node.scheduler.run_round().await.unwrap();
    assert_eq!(node.gauges.get(EWMA_GAUGE, &labels), Some(500.0));

    node.membership.set(&[]);
    for _ in 0..4 {
        node.scheduler.run_round().await.unwrap();
    }
    assert_eq!(node.gauges.get(EWMA_GAUGE, &labels), None);

    node.membership.set(&[x]);
    node.prober.script(x, Reply::After(Duration::from_millis(100)));
    node.scheduler.run_round().await.unwrap();

    assert_eq!(node.gauges.get(RTT_GAUGE, &labels), Some(100.0));
    assert_eq!(node.gauges.get(EWMA_GAUGE, &labels), Some(100.0));
}

/// A reply that lands after the round deadline is never applied, not even
/// once the reply time itself has passed.
#[tokio::test(start_paused = true)]
async fn test_late_reply_never_creates_series() {
    let slow = peer("slow");
    let node = start_node(fast_config(), &[slow]).await;
    node.prober.script(slow, Reply::After(Duration::from_millis(1500)));

    let summary = node.scheduler.run_round().await.unwrap();
    assert_eq!(summary.recorded, 0);
    assert_eq!(summary.probed, 1);

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(node.scheduler.registry().last_seen(&slow), Ok(None));
    assert_eq!(node.gauges.series_count(RTT_GAUGE), 0);
    assert_eq!(node.gauges.series_count(EWMA_GAUGE), 0);
}
