//! Kuyala kubehub: credential discovery, session validation and the
//! deployment list/watch/scale calls behind [`kuyala_core::ClusterBackend`].

#![forbid(unsafe_code)]

pub mod credentials;
pub mod deployments;
pub mod session;

use kuyala_core::{BoxWatchStream, ClusterBackend, ClusterIdentity, ClusterResult, ClusterStatus, ResourceRecord};
use tracing::info;

pub use credentials::{CredentialSource, CredentialSources};
pub use deployments::{KindTracker, SharedTracker};
pub use session::{Acquired, ClusterHandle, ClusterSession};

/// Cluster backend over a live API server.
///
/// List and scale reuse the published handle when one exists and acquire
/// lazily otherwise; `watch` is only called by the reconcile loop right
/// after a fresh acquisition. Every feed shares one change tracker.
pub struct KubeCluster {
    session: ClusterSession,
    tracker: SharedTracker,
}

impl KubeCluster {
    pub fn new(sources: CredentialSources) -> Self {
        info!(
            in_cluster = sources.in_cluster,
            path = ?sources.path,
            content = sources.content.is_some(),
            "kube cluster backend configured"
        );
        Self { session: ClusterSession::new(sources), tracker: SharedTracker::default() }
    }
}

#[async_trait::async_trait]
impl ClusterBackend for KubeCluster {
    async fn acquire(&self) -> ClusterResult<ClusterIdentity> {
        match self.session.acquire().await {
            Acquired::Ready(h) => Ok(h.identity.clone()),
            Acquired::Unavailable(e) => Err(e),
        }
    }

    fn status(&self) -> ClusterStatus {
        self.session.status()
    }

    async fn list_records(&self) -> ClusterResult<Vec<ResourceRecord>> {
        let h = self.session.handle().await?;
        deployments::list_records(h.client.clone()).await
    }

    async fn watch(&self) -> ClusterResult<BoxWatchStream> {
        let h = self.session.handle().await?;
        Ok(deployments::deployment_feed(h.client.clone(), self.tracker.clone()))
    }

    async fn scale(&self, namespace: &str, name: &str, replicas: u32) -> ClusterResult<()> {
        let h = self.session.handle().await?;
        deployments::scale(h.client.clone(), namespace, name, replicas).await
    }
}
