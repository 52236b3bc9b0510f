//! One live subscriber: greeting, bounded-wait serving loop, heartbeat, teardown.

use std::sync::Arc;

use chrono::Utc;
use kuyala_core::{BroadcastMessage, ClusterBackend, ClusterStats, ConnectedInfo, HeartbeatInfo, ListResponse};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcaster::{Broadcaster, Registration, Shared, SubscriberId};
use crate::timings::Timings;

const WELCOME: &str = "Connected to Kuyala live updates";

/// Why a serving loop ended. Every variant is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Process shutdown or an explicit stop.
    Cancelled,
    /// The outbound side (the HTTP body) went away.
    PeerGone,
    /// The inbound queue closed underneath the session.
    Deregistered,
}

/// A registered subscriber and its private inbound queue.
///
/// Created by [`SubscriberSession::connect`], consumed by [`SubscriberSession::serve`].
/// Dropping it at any point deregisters it.
pub struct SubscriberSession {
    registration: Registration,
    inbound: mpsc::Receiver<Shared>,
}

impl SubscriberSession {
    pub fn connect(broadcaster: Arc<Broadcaster>) -> Self {
        let (registration, inbound) = Registration::new(broadcaster);
        Self { registration, inbound }
    }

    pub fn id(&self) -> SubscriberId {
        self.registration.id()
    }

    pub fn is_connected(&self) -> bool {
        self.registration.is_active()
    }

    /// Emit the greeting, then forward queued messages to `out` until the
    /// peer leaves or `cancel` fires. Teardown runs on every exit path.
    pub async fn serve(
        mut self,
        backend: &dyn ClusterBackend,
        out: mpsc::Sender<Shared>,
        timings: Timings,
        cancel: CancellationToken,
    ) -> SessionEnd {
        let id = self.id();
        info!(client = %id, "subscriber connected");
        let end = match self.greet(backend, &out, &cancel).await {
            Some(end) => end,
            None => self.pump(&out, timings, &cancel).await,
        };
        self.registration.release();
        info!(client = %id, reason = ?end, "subscriber closed");
        end
    }

    async fn greet(&self, backend: &dyn ClusterBackend, out: &mpsc::Sender<Shared>, cancel: &CancellationToken) -> Option<SessionEnd> {
        let identity = backend.status().identity;
        let connected = BroadcastMessage::Connected(ConnectedInfo {
            client_id: self.id().to_string(),
            message: WELCOME.to_string(),
            server_node_name: identity.as_ref().and_then(|i| i.control_plane_node_name.clone()),
            server_node_ip: identity.as_ref().and_then(|i| i.control_plane_node_ip.clone()),
        });
        if let Err(end) = emit(out, Arc::new(connected), cancel).await {
            return Some(end);
        }

        let records = match backend.list_records().await {
            Ok(r) => r,
            Err(e) => {
                warn!(client = %self.id(), error = %e, "initial data unavailable; greeting without it");
                return None;
            }
        };
        let stats = ClusterStats::from_records(&records, Utc::now());
        if let Err(end) = emit(out, Arc::new(BroadcastMessage::InitialData(ListResponse::success(records))), cancel).await {
            return Some(end);
        }
        emit(out, Arc::new(BroadcastMessage::Stats(stats)), cancel).await.err()
    }

    async fn pump(&mut self, out: &mpsc::Sender<Shared>, timings: Timings, cancel: &CancellationToken) -> SessionEnd {
        let mut last_emit = Instant::now();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                _ = out.closed() => return SessionEnd::PeerGone,
                r = tokio::time::timeout(timings.poll_wait, self.inbound.recv()) => r,
            };
            let msg = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => return SessionEnd::Deregistered,
                Err(_) if last_emit.elapsed() >= timings.heartbeat_after => {
                    debug!(client = %self.id(), "idle; heartbeat");
                    Arc::new(BroadcastMessage::Heartbeat(HeartbeatInfo::now()))
                }
                Err(_) => continue,
            };
            if let Err(end) = emit(out, msg, cancel).await {
                return end;
            }
            last_emit = Instant::now();
        }
    }
}

async fn emit(out: &mpsc::Sender<Shared>, msg: Shared, cancel: &CancellationToken) -> Result<(), SessionEnd> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionEnd::Cancelled),
        r = out.send(msg) => r.map_err(|_| SessionEnd::PeerGone),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kuyala_core::{EventName, MockCluster};
    use std::time::Duration;

    fn names(msgs: &[Shared]) -> Vec<EventName> {
        msgs.iter().map(|m| m.event_name()).collect()
    }

    async fn take(rx: &mut mpsc::Receiver<Shared>, n: usize) -> Vec<Shared> {
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(rx.recv().await.unwrap());
        }
        v
    }

    #[tokio::test(start_paused = true)]
    async fn greeting_then_broadcasts_in_order() {
        let mock = Arc::new(MockCluster::new());
        let b = Arc::new(Broadcaster::default());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let session = SubscriberSession::connect(b.clone());
        let id = session.id();
        let task = {
            let (mock, cancel) = (mock.clone(), cancel.clone());
            tokio::spawn(async move { session.serve(mock.as_ref(), tx, Timings::default(), cancel).await })
        };

        let greeting = take(&mut rx, 3).await;
        assert_eq!(names(&greeting), vec![EventName::Connected, EventName::InitialData, EventName::StatsUpdate]);
        match greeting[0].as_ref() {
            BroadcastMessage::Connected(c) => {
                assert_eq!(c.client_id, id.to_string());
                assert_eq!(c.server_node_ip.as_deref(), Some("10.0.0.1"));
            }
            other => panic!("unexpected {:?}", other),
        }

        b.publish(BroadcastMessage::Heartbeat(HeartbeatInfo { timestamp: 7.0 }));
        let m = rx.recv().await.unwrap();
        assert_eq!(m.data_json().unwrap(), r#"{"timestamp":7.0}"#);

        cancel.cancel();
        assert_eq!(task.await.unwrap(), SessionEnd::Cancelled);
        assert_eq!(b.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_cluster_greets_with_connected_only() {
        let mock = Arc::new(MockCluster::unavailable());
        let b = Arc::new(Broadcaster::default());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let session = SubscriberSession::connect(b.clone());
        let task = {
            let (mock, cancel) = (mock.clone(), cancel.clone());
            tokio::spawn(async move { session.serve(mock.as_ref(), tx, Timings::default(), cancel).await })
        };

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_name(), EventName::Connected);
        let next = rx.recv().await.unwrap();
        assert_eq!(next.event_name(), EventName::Heartbeat);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_after_idle_and_clock_resets() {
        let mock = Arc::new(MockCluster::new());
        let b = Arc::new(Broadcaster::default());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let session = SubscriberSession::connect(b.clone());
        let task = {
            let (mock, cancel) = (mock.clone(), cancel.clone());
            tokio::spawn(async move { session.serve(mock.as_ref(), tx, Timings::default(), cancel).await })
        };
        take(&mut rx, 3).await;
        let start = Instant::now();

        let hb = rx.recv().await.unwrap();
        assert_eq!(hb.event_name(), EventName::Heartbeat);
        let first_at = start.elapsed();
        assert!(first_at >= Duration::from_secs(30) && first_at <= Duration::from_secs(31), "{:?}", first_at);

        tokio::time::sleep(Duration::from_secs(10)).await;
        b.publish(BroadcastMessage::Heartbeat(HeartbeatInfo { timestamp: 1.0 }));
        let relayed = rx.recv().await.unwrap();
        assert_eq!(relayed.data_json().unwrap(), r#"{"timestamp":1.0}"#);
        let relayed_at = start.elapsed();

        let hb2 = rx.recv().await.unwrap();
        assert_eq!(hb2.event_name(), EventName::Heartbeat);
        let gap = start.elapsed() - relayed_at;
        assert!(gap >= Duration::from_secs(30) && gap <= Duration::from_secs(31), "{:?}", gap);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn peer_disconnect_tears_down() {
        let mock = Arc::new(MockCluster::new());
        let b = Arc::new(Broadcaster::default());
        let (tx, mut rx) = mpsc::channel(8);
        let session = SubscriberSession::connect(b.clone());
        assert!(session.is_connected());
        let task = {
            let mock = mock.clone();
            tokio::spawn(async move { session.serve(mock.as_ref(), tx, Timings::default(), CancellationToken::new()).await })
        };
        take(&mut rx, 3).await;
        assert_eq!(b.subscriber_count(), 1);
        drop(rx);
        assert_eq!(task.await.unwrap(), SessionEnd::PeerGone);
        assert_eq!(b.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropped_session_deregisters() {
        let b = Arc::new(Broadcaster::default());
        let session = SubscriberSession::connect(b.clone());
        assert_eq!(b.subscriber_count(), 1);
        drop(session);
        assert_eq!(b.subscriber_count(), 0);
    }
}
