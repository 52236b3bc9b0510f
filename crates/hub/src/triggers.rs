//! Stats recomputation: the periodic poller and the delayed one-shot trigger.

use std::sync::Arc;

use chrono::Utc;
use kuyala_core::{BroadcastMessage, ClusterBackend, ClusterResult, ClusterStats};
use metrics::histogram;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcaster::Broadcaster;
use crate::timings::Timings;

/// List the gated resources and aggregate them.
pub async fn compute_stats(backend: &dyn ClusterBackend) -> ClusterResult<ClusterStats> {
    let t0 = std::time::Instant::now();
    let records = backend.list_records().await?;
    let stats = ClusterStats::from_records(&records, Utc::now());
    histogram!("kuyala_stats_compute_ms", t0.elapsed().as_secs_f64() * 1000.0);
    Ok(stats)
}

/// Validate the session, compute once and publish. Failures skip the cycle.
async fn recompute(backend: &dyn ClusterBackend, broadcaster: &Broadcaster, origin: &'static str) -> bool {
    if let Err(e) = backend.acquire().await {
        warn!(origin, error = %e, "stats cycle skipped: cluster session unavailable");
        return false;
    }
    match compute_stats(backend).await {
        Ok(stats) => {
            let report = broadcaster.publish(BroadcastMessage::Stats(stats));
            debug!(origin, delivered = report.delivered, dropped = report.dropped, "stats published");
            true
        }
        Err(e) => {
            warn!(origin, error = %e, "stats cycle skipped");
            false
        }
    }
}

/// Recompute stats every `stats_interval` until cancelled.
pub async fn run_stats_poller(
    backend: Arc<dyn ClusterBackend>,
    broadcaster: Arc<Broadcaster>,
    timings: Timings,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + timings.stats_interval, timings.stats_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(every_s = timings.stats_interval.as_secs(), "stats poller started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                recompute(backend.as_ref(), &broadcaster, "poller").await;
            }
        }
    }
    info!("stats poller stopped");
}

/// Producer side of the delayed one-shot trigger.
#[derive(Clone)]
pub struct StatsTrigger {
    tx: mpsc::UnboundedSender<()>,
}

impl StatsTrigger {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue one recomputation. Never blocks; a stopped consumer is ignored.
    pub fn signal(&self) {
        if self.tx.send(()).is_err() {
            debug!("stats trigger consumer gone; signal ignored");
        }
    }
}

/// Consume trigger signals one at a time: settle, then recompute.
/// Signals are not coalesced; each one yields its own delayed cycle.
pub async fn run_delayed_stats(
    mut signals: mpsc::UnboundedReceiver<()>,
    backend: Arc<dyn ClusterBackend>,
    broadcaster: Arc<Broadcaster>,
    timings: Timings,
    cancel: CancellationToken,
) {
    info!(settle_s = timings.settle_delay.as_secs(), "delayed stats trigger started");
    loop {
        let got = tokio::select! {
            _ = cancel.cancelled() => break,
            s = signals.recv() => s,
        };
        if got.is_none() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(timings.settle_delay) => {}
        }
        recompute(backend.as_ref(), &broadcaster, "delayed").await;
    }
    info!("delayed stats trigger stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use kuyala_core::{record_from_raw, MockCluster, ResourceRecord};
    use std::time::Duration;
    use tokio::time::Instant;

    fn rec(name: &str, current: u32) -> ResourceRecord {
        let raw = serde_json::json!({
            "metadata": {"name": name, "namespace": "ns1", "annotations": {"kuyala.enabled": "true"}},
            "status": {"replicas": current},
        });
        record_from_raw(&raw).unwrap().unwrap()
    }

    fn assert_at(start: Instant, secs: u64) {
        let e = start.elapsed();
        assert!(e >= Duration::from_secs(secs) && e < Duration::from_secs(secs) + Duration::from_millis(100), "{:?}", e);
    }

    fn stats_of(m: &BroadcastMessage) -> &ClusterStats {
        match m {
            BroadcastMessage::Stats(s) => s,
            other => panic!("expected stats, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poller_publishes_on_cadence() {
        let mock = Arc::new(MockCluster::new());
        mock.set_records(vec![rec("a", 2), rec("b", 0)]);
        let b = Arc::new(Broadcaster::default());
        let mut sub = b.register();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let task = tokio::spawn(run_stats_poller(mock.clone(), b.clone(), Timings::default(), cancel.clone()));

        let first = sub.inbound.recv().await.unwrap();
        assert_at(start, 30);
        assert_eq!(stats_of(&first).running, 1);
        sub.inbound.recv().await.unwrap();
        assert_at(start, 60);
        assert_eq!(mock.acquire_count(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn poller_skips_cycles_without_session() {
        let mock = Arc::new(MockCluster::unavailable());
        let b = Arc::new(Broadcaster::default());
        let mut sub = b.register();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_stats_poller(mock.clone(), b.clone(), Timings::default(), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(mock.acquire_count(), 3);
        assert!(sub.inbound.try_recv().is_err());

        mock.set_available(true);
        let msg = sub.inbound.recv().await.unwrap();
        assert_eq!(stats_of(&msg).total_enabled, 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn each_signal_gets_its_own_delayed_cycle() {
        let mock = Arc::new(MockCluster::new());
        let b = Arc::new(Broadcaster::default());
        let mut sub = b.register();
        let (trigger, rx) = StatsTrigger::channel();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let task = tokio::spawn(run_delayed_stats(rx, mock.clone(), b.clone(), Timings::default(), cancel.clone()));

        trigger.signal();
        trigger.signal();
        trigger.signal();

        for n in 1..=3u64 {
            sub.inbound.recv().await.unwrap();
            assert_at(start, 5 * n);
        }
        assert_eq!(mock.acquire_count(), 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_cycle_skips_when_listing_fails() {
        let mock = Arc::new(MockCluster::new());
        mock.fail_list(Some(kuyala_core::ClusterError::ApiError("boom".into())));
        let b = Arc::new(Broadcaster::default());
        let mut sub = b.register();
        let (trigger, rx) = StatsTrigger::channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_delayed_stats(rx, mock.clone(), b.clone(), Timings::default(), cancel.clone()));

        trigger.signal();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(sub.inbound.try_recv().is_err());
        assert_eq!(mock.acquire_count(), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
