//! The seam between the concurrency core and the orchestration API.
//!
//! The kube-backed implementation lives in `kuyala-kubehub`; [`MockCluster`]
//! is an in-memory stand-in for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{ClusterError, ClusterResult};
use crate::record::{ResourceRecord, WatchNotification};

pub type BoxWatchStream = BoxStream<'static, ClusterResult<WatchNotification>>;

/// What a successful validation probe learned about the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterIdentity {
    pub api_version: String,
    pub control_plane_node_name: Option<String>,
    pub control_plane_node_ip: Option<String>,
}

/// Point-in-time view of the session for health reporting and page render.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub connected: bool,
    pub identity: Option<ClusterIdentity>,
    /// Set when no credential source could be resolved at all.
    pub config_error: Option<String>,
}

/// Read/patch capabilities over a (re)validated cluster session.
#[async_trait::async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Acquire and validate a session, publishing it on success.
    /// `AuthUnavailable`/`ValidationFailed` mean the session is unusable for this cycle.
    async fn acquire(&self) -> ClusterResult<ClusterIdentity>;

    /// Current published state without touching the network.
    fn status(&self) -> ClusterStatus;

    /// Every gated deployment across all namespaces.
    async fn list_records(&self) -> ClusterResult<Vec<ResourceRecord>>;

    /// Open a change feed over all namespaces. The stream ends or yields an
    /// error when the feed breaks; callers reconnect.
    async fn watch(&self) -> ClusterResult<BoxWatchStream>;

    /// Patch the replica count of one deployment.
    async fn scale(&self, namespace: &str, name: &str, replicas: u32) -> ClusterResult<()>;
}

enum Feed {
    Scripted(Vec<ClusterResult<WatchNotification>>),
    Live(mpsc::UnboundedReceiver<ClusterResult<WatchNotification>>),
}

struct MockState {
    available: bool,
    identity: ClusterIdentity,
    records: Vec<ResourceRecord>,
    list_error: Option<ClusterError>,
    scale_error: Option<ClusterError>,
    scale_calls: Vec<(String, String, u32)>,
    feeds: VecDeque<Feed>,
}

/// Simple in-memory cluster for tests.
///
/// Watch feeds are consumed in the order they were pushed, one per `watch()`
/// call; once exhausted, `watch()` returns a feed that never yields.
pub struct MockCluster {
    state: Mutex<MockState>,
    acquires: AtomicUsize,
    watch_opens: AtomicUsize,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState {
                available: true,
                identity: ClusterIdentity {
                    api_version: "v1.29.0".into(),
                    control_plane_node_name: Some("cp-0".into()),
                    control_plane_node_ip: Some("10.0.0.1".into()),
                },
                records: Vec::new(),
                list_error: None,
                scale_error: None,
                scale_calls: Vec::new(),
                feeds: VecDeque::new(),
            }),
            acquires: AtomicUsize::new(0),
            watch_opens: AtomicUsize::new(0),
        }
    }
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster for which no credential source resolves.
    pub fn unavailable() -> Self {
        let m = Self::default();
        m.set_available(false);
        m
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn set_records(&self, records: Vec<ResourceRecord>) {
        self.lock().records = records;
    }

    pub fn fail_list(&self, err: Option<ClusterError>) {
        self.lock().list_error = err;
    }

    pub fn fail_scale(&self, err: Option<ClusterError>) {
        self.lock().scale_error = err;
    }

    /// Queue a feed that yields the given items and then ends.
    pub fn push_feed(&self, items: Vec<ClusterResult<WatchNotification>>) {
        self.lock().feeds.push_back(Feed::Scripted(items));
    }

    /// Queue a feed driven by the returned sender; it ends when the sender drops.
    pub fn push_live_feed(&self) -> mpsc::UnboundedSender<ClusterResult<WatchNotification>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().feeds.push_back(Feed::Live(rx));
        tx
    }

    pub fn scale_calls(&self) -> Vec<(String, String, u32)> {
        self.lock().scale_calls.clone()
    }

    pub fn acquire_count(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn watch_opens(&self) -> usize {
        self.watch_opens.load(Ordering::SeqCst)
    }

    fn unavailable_error() -> ClusterError {
        ClusterError::AuthUnavailable("mock cluster has no credentials".into())
    }
}

#[async_trait::async_trait]
impl ClusterBackend for MockCluster {
    async fn acquire(&self) -> ClusterResult<ClusterIdentity> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        let st = self.lock();
        if st.available {
            Ok(st.identity.clone())
        } else {
            Err(Self::unavailable_error())
        }
    }

    fn status(&self) -> ClusterStatus {
        let st = self.lock();
        if st.available {
            ClusterStatus { connected: true, identity: Some(st.identity.clone()), config_error: None }
        } else {
            ClusterStatus { connected: false, identity: None, config_error: Some(Self::unavailable_error().to_string()) }
        }
    }

    async fn list_records(&self) -> ClusterResult<Vec<ResourceRecord>> {
        let st = self.lock();
        if !st.available {
            return Err(Self::unavailable_error());
        }
        match &st.list_error {
            Some(e) => Err(e.clone()),
            None => Ok(st.records.clone()),
        }
    }

    async fn watch(&self) -> ClusterResult<BoxWatchStream> {
        self.watch_opens.fetch_add(1, Ordering::SeqCst);
        let mut st = self.lock();
        if !st.available {
            return Err(Self::unavailable_error());
        }
        Ok(match st.feeds.pop_front() {
            Some(Feed::Scripted(items)) => stream::iter(items).boxed(),
            Some(Feed::Live(rx)) => stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed(),
            None => stream::pending::<ClusterResult<WatchNotification>>().boxed(),
        })
    }

    async fn scale(&self, namespace: &str, name: &str, replicas: u32) -> ClusterResult<()> {
        let mut st = self.lock();
        if !st.available {
            return Err(Self::unavailable_error());
        }
        if let Some(e) = &st.scale_error {
            return Err(e.clone());
        }
        st.scale_calls.push((namespace.to_string(), name.to_string(), replicas));
        Ok(())
    }
}
