//! Resource watch loop: acquire, stream, back off, repeat.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kuyala_core::{record_from_raw, BoxWatchStream, BroadcastMessage, ChangeEvent, ClusterBackend, WatchNotification};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcaster::Broadcaster;
use crate::timings::Timings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Authenticating,
    Streaming,
    Backoff(Duration),
}

pub struct WatchLoop {
    backend: Arc<dyn ClusterBackend>,
    broadcaster: Arc<Broadcaster>,
    timings: Timings,
    cancel: CancellationToken,
}

impl WatchLoop {
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        broadcaster: Arc<Broadcaster>,
        timings: Timings,
        cancel: CancellationToken,
    ) -> Self {
        Self { backend, broadcaster, timings, cancel }
    }

    /// Drive the state machine until cancelled. Failures only ever move
    /// the loop into backoff.
    pub async fn run(self) {
        info!("watch loop started");
        let mut state = WatchState::Idle;
        while !self.cancel.is_cancelled() {
            let next = self.step(state).await;
            debug!(from = ?state, to = ?next, "watch loop transition");
            state = next;
        }
        info!("watch loop stopped");
    }

    async fn step(&self, state: WatchState) -> WatchState {
        match state {
            WatchState::Idle => WatchState::Authenticating,
            WatchState::Authenticating => {
                let acquired = tokio::select! {
                    _ = self.cancel.cancelled() => return WatchState::Idle,
                    r = self.backend.acquire() => r,
                };
                match acquired {
                    Ok(identity) => {
                        info!(version = %identity.api_version, "watch loop authenticated");
                        WatchState::Streaming
                    }
                    Err(e) => {
                        warn!(error = %e, backoff_s = self.timings.auth_backoff.as_secs(), "watch loop cannot authenticate");
                        WatchState::Backoff(self.timings.auth_backoff)
                    }
                }
            }
            WatchState::Streaming => {
                let opened = tokio::select! {
                    _ = self.cancel.cancelled() => return WatchState::Idle,
                    r = self.backend.watch() => r,
                };
                match opened {
                    Ok(feed) => self.stream(feed).await,
                    Err(e) if e.is_unavailable() => {
                        warn!(error = %e, "session lost before opening watch feed");
                        WatchState::Backoff(self.timings.auth_backoff)
                    }
                    Err(e) => {
                        warn!(error = %e, "cannot open watch feed");
                        WatchState::Backoff(self.timings.stream_backoff)
                    }
                }
            }
            WatchState::Backoff(d) => {
                counter!("kuyala_watch_restarts_total", 1);
                tokio::select! {
                    _ = self.cancel.cancelled() => WatchState::Idle,
                    _ = tokio::time::sleep(d) => WatchState::Authenticating,
                }
            }
        }
    }

    async fn stream(&self, mut feed: BoxWatchStream) -> WatchState {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return WatchState::Idle,
                item = feed.next() => item,
            };
            match item {
                Some(Ok(n)) => self.forward(n),
                Some(Err(e)) => {
                    warn!(error = %e, backoff_s = self.timings.stream_backoff.as_secs(), "watch feed failed");
                    return WatchState::Backoff(self.timings.stream_backoff);
                }
                None => {
                    warn!(backoff_s = self.timings.stream_backoff.as_secs(), "watch feed ended");
                    return WatchState::Backoff(self.timings.stream_backoff);
                }
            }
        }
    }

    /// Gate, normalize and publish one notification. A malformed annotation
    /// drops this notification only.
    fn forward(&self, n: WatchNotification) {
        counter!("kuyala_watch_events_total", 1);
        match record_from_raw(&n.raw) {
            Ok(Some(record)) => {
                debug!(kind = ?n.kind, key = %record.key(), "deployment change");
                self.broadcaster.publish(BroadcastMessage::Change(ChangeEvent::new(n.kind, record)));
            }
            Ok(None) => {}
            Err(e) => {
                let name = n.raw.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or("");
                let ns = n.raw.pointer("/metadata/namespace").and_then(|v| v.as_str()).unwrap_or("");
                warn!(ns = %ns, name = %name, error = %e, "skipping change notification");
            }
        }
    }
}
