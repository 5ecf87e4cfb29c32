//! Peer last-seen registry with autonomous TTL expiry.
//!
//! Maps each peer to the instant it was last refreshed. A background sweep
//! task removes entries older than the timeout and hands every removed peer
//! to an optional eviction callback.
//!
//! The data is only meaningful while the sweep is alive. The registry tracks
//! that with a `ready` flag: it is raised once when the sweep starts and
//! lowered once when the sweep exits for any reason (panic, abort). Every
//! operation checks it and fails with `NotReady` rather than serve entries
//! nobody is expiring. There is no way back to ready; the owner has to build
//! a new registry.
//!
//! Locking: one `RwLock` around the whole map. Updates and the sweep take it
//! exclusively, lookups share it. Eviction callbacks run after the sweep has
//! released it, so a callback may call back into the registry.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Sweep tick used by [`PeerLastSeen::start`].
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on eviction callbacks executing at the same time.
///
/// Each evicted peer gets its own lightweight task so the sweep never waits
/// on a callback. Those tasks queue on this many permits before running the
/// callback on the blocking pool, which keeps a mass expiry from fanning out
/// into hundreds of concurrent callbacks.
pub const MAX_CONCURRENT_CALLBACKS: usize = 16;

/// Invoked once for every peer the sweep removes.
pub type EvictCallback<K> = Arc<dyn Fn(K) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LastSeenError {
    #[error("peer timeout must be greater than zero")]
    InvalidTimeout,

    #[error("sweep interval must be greater than zero")]
    InvalidSweepInterval,

    #[error("background sweep task is offline")]
    NotReady,
}

/// State shared between the handles and the sweep task.
struct Shared<K> {
    last_seen: RwLock<HashMap<K, Instant>>,
    timeout: Duration,
    ready: AtomicBool,
    on_evict: Option<EvictCallback<K>>,
    callback_permits: Arc<Semaphore>,
    #[cfg(test)]
    scan_hooks: ScanHooks,
}

/// Fault injection and overlap accounting for sweep scans.
#[cfg(test)]
#[derive(Default)]
struct ScanHooks {
    panic_next: AtomicBool,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

#[cfg(test)]
struct ScanRunning<'a>(&'a AtomicUsize);

#[cfg(test)]
impl Drop for ScanRunning<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl ScanHooks {
    fn enter(&self) -> ScanRunning<'_> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        let guard = ScanRunning(&self.running);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("injected scan failure");
        }
        guard
    }
}

/// Aborts the sweep task when the last registry handle goes away.
struct SweepHandle(Option<AbortHandle>);

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Lowers the ready flag when the sweep task exits, however it exits.
///
/// Lives on the sweep task's stack: a normal return, a panic unwinding
/// through the loop, or an abort dropping the future all run this.
struct OfflineOnExit<K>(Arc<Shared<K>>);

impl<K> Drop for OfflineOnExit<K> {
    fn drop(&mut self) {
        self.0.ready.store(false, Ordering::Release);
    }
}

/// Concurrency-safe peer → last-refresh registry with TTL eviction.
///
/// Cheap to clone; all clones share one map and one sweep task.
pub struct PeerLastSeen<K> {
    shared: Arc<Shared<K>>,
    sweep: Arc<SweepHandle>,
}

impl<K> Clone for PeerLastSeen<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            sweep: self.sweep.clone(),
        }
    }
}

impl<K> Shared<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn new(timeout: Duration, on_evict: Option<EvictCallback<K>>) -> Result<Self, LastSeenError> {
        if timeout.is_zero() {
            return Err(LastSeenError::InvalidTimeout);
        }
        Ok(Self {
            last_seen: RwLock::new(HashMap::new()),
            timeout,
            ready: AtomicBool::new(false),
            on_evict,
            callback_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_CALLBACKS)),
            #[cfg(test)]
            scan_hooks: ScanHooks::default(),
        })
    }

    fn ensure_ready(&self) -> Result<(), LastSeenError> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(LastSeenError::NotReady)
        }
    }

    // A poisoned lock means a writer panicked mid-update; treat the map
    // the same as an offline sweep.
    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<K, Instant>>, LastSeenError> {
        self.last_seen.read().map_err(|_| LastSeenError::NotReady)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<K, Instant>>, LastSeenError> {
        self.last_seen.write().map_err(|_| LastSeenError::NotReady)
    }

    /// Remove every entry older than the timeout. Returns the removed peers.
    fn evict_expired(&self, now: Instant) -> Result<Vec<K>, LastSeenError> {
        let mut map = self.write()?;
        let mut evicted = Vec::new();
        map.retain(|peer, seen| {
            let keep = now.saturating_duration_since(*seen) <= self.timeout;
            if !keep {
                evicted.push(peer.clone());
            }
            keep
        });
        Ok(evicted)
    }

    /// Hand each evicted peer to the callback. Never blocks the caller.
    fn dispatch_evictions(&self, evicted: Vec<K>) {
        let Some(callback) = self.on_evict.as_ref() else {
            return;
        };
        for peer in evicted {
            let callback = callback.clone();
            let permits = self.callback_permits.clone();
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let label = format!("{peer:?}");
                if let Err(e) = tokio::task::spawn_blocking(move || callback(peer)).await {
                    tracing::warn!(peer = %label, error = %e, "eviction callback failed");
                }
            });
        }
    }
}

impl<K> PeerLastSeen<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create a registry with the default one-second sweep.
    ///
    /// Returns once the sweep task is running. Must be called from within a
    /// tokio runtime.
    pub async fn start(
        timeout: Duration,
        on_evict: Option<EvictCallback<K>>,
    ) -> Result<Self, LastSeenError> {
        Self::with_sweep_interval(timeout, DEFAULT_SWEEP_INTERVAL, on_evict).await
    }

    /// Create a registry whose sweep ticks every `sweep_interval`.
    ///
    /// Fails with `InvalidTimeout` / `InvalidSweepInterval` on zero
    /// durations, in which case no task is spawned. Otherwise spawns the
    /// sweep and waits for its readiness signal before returning.
    pub async fn with_sweep_interval(
        timeout: Duration,
        sweep_interval: Duration,
        on_evict: Option<EvictCallback<K>>,
    ) -> Result<Self, LastSeenError> {
        if sweep_interval.is_zero() {
            return Err(LastSeenError::InvalidSweepInterval);
        }
        let shared = Arc::new(Shared::new(timeout, on_evict)?);

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(sweep_loop(shared.clone(), sweep_interval, ready_tx));
        let registry = Self {
            shared,
            sweep: Arc::new(SweepHandle(Some(task.abort_handle()))),
        };

        // Sender dropped without firing = the task died before it came up.
        ready_rx.await.map_err(|_| LastSeenError::NotReady)?;

        tracing::debug!(
            timeout_secs = timeout.as_secs_f64(),
            sweep_interval_secs = sweep_interval.as_secs_f64(),
            "peer last-seen registry ready"
        );
        Ok(registry)
    }

    /// Record that `peer` was seen just now.
    pub fn update_last_seen(&self, peer: K) -> Result<(), LastSeenError> {
        self.update_last_seen_at(peer, Instant::now())
    }

    /// Record that `peer` was seen at `at`.
    ///
    /// An existing entry only moves forward: of two updates racing for the
    /// same peer, the later timestamp is the one that stays.
    pub fn update_last_seen_at(&self, peer: K, at: Instant) -> Result<(), LastSeenError> {
        self.shared.ensure_ready()?;
        let mut map = self.shared.write()?;
        let seen = map.entry(peer).or_insert(at);
        if at > *seen {
            *seen = at;
        }
        Ok(())
    }

    /// When `peer` was last refreshed. `Ok(None)` if it never was, or has
    /// since expired.
    pub fn last_seen(&self, peer: &K) -> Result<Option<Instant>, LastSeenError> {
        self.shared.ensure_ready()?;
        Ok(self.shared.read()?.get(peer).copied())
    }

    /// Snapshot of every tracked peer and its last refresh.
    pub fn snapshot(&self) -> Result<Vec<(K, Instant)>, LastSeenError> {
        self.shared.ensure_ready()?;
        Ok(self
            .shared
            .read()?
            .iter()
            .map(|(peer, seen)| (peer.clone(), *seen))
            .collect())
    }

    /// Number of tracked peers.
    pub fn len(&self) -> Result<usize, LastSeenError> {
        self.shared.ensure_ready()?;
        Ok(self.shared.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, LastSeenError> {
        Ok(self.len()? == 0)
    }

    /// Whether the sweep task is alive. Once false, stays false.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    #[cfg(test)]
    pub(crate) fn kill_sweep(&self) {
        if let Some(handle) = self.sweep.0.as_ref() {
            handle.abort();
        }
    }
}

/// The background sweep.
///
/// Each scan runs as its own task and the loop awaits it before taking the
/// next tick, so scans never overlap even when one outlasts the interval.
/// A scan that panics (or finds the map poisoned) ends the loop, which takes
/// the registry offline for good.
async fn sweep_loop<K>(shared: Arc<Shared<K>>, interval: Duration, ready_tx: oneshot::Sender<()>)
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    let _offline = OfflineOnExit(shared.clone());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    shared.ready.store(true, Ordering::Release);
    let _ = ready_tx.send(());

    loop {
        ticker.tick().await;

        let scan = tokio::spawn({
            let shared = shared.clone();
            async move {
                #[cfg(test)]
                let _running = shared.scan_hooks.enter();
                shared.evict_expired(Instant::now())
            }
        });

        let evicted = match scan.await {
            Ok(Ok(evicted)) => evicted,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "peer sweep found registry poisoned, going offline");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "peer sweep crashed, going offline");
                return;
            }
        };

        if !evicted.is_empty() {
            tracing::debug!(removed = evicted.len(), "expired peer last-seen entries");
            shared.dispatch_evictions(evicted);
        }
    }
}
