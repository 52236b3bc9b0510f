//! Cluster session: resolve credentials, probe the API server, publish the handle.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;
use kuyala_core::{ClusterError, ClusterIdentity, ClusterResult, ClusterStatus};
use metrics::counter;
use tracing::{info, warn};

use crate::credentials::{CredentialSource, CredentialSources};

const CONTROL_PLANE_LABELS: [&str; 2] = ["node-role.kubernetes.io/control-plane", "node-role.kubernetes.io/master"];

/// A validated connection: only ever published after the probe succeeded.
pub struct ClusterHandle {
    pub client: Client,
    pub identity: ClusterIdentity,
    pub source: CredentialSource,
}

/// Outcome of [`ClusterSession::acquire`].
pub enum Acquired {
    Ready(Arc<ClusterHandle>),
    Unavailable(ClusterError),
}

pub struct ClusterSession {
    sources: CredentialSources,
    published: ArcSwapOption<ClusterHandle>,
    config_error: ArcSwapOption<String>,
}

impl ClusterSession {
    pub fn new(sources: CredentialSources) -> Self {
        Self { sources, published: ArcSwapOption::empty(), config_error: ArcSwapOption::empty() }
    }

    /// Resolve credentials, build a client and run the validation probe.
    ///
    /// Concurrent callers may validate concurrently; each success replaces the
    /// published handle, so the last one wins.
    pub async fn acquire(&self) -> Acquired {
        let (config, source) = match self.sources.resolve().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "cluster session unavailable");
                counter!("kuyala_session_acquire_failures_total", 1);
                self.config_error.store(Some(Arc::new(e.to_string())));
                self.published.store(None);
                return Acquired::Unavailable(e);
            }
        };
        self.config_error.store(None);

        let client = match Client::try_from(config) {
            Ok(c) => c,
            Err(e) => return self.discard(ClusterError::ValidationFailed(format!("building client: {}", e))),
        };
        match probe(&client).await {
            Ok(identity) => {
                info!(
                    source = %source,
                    version = %identity.api_version,
                    node = ?identity.control_plane_node_name,
                    "cluster session validated"
                );
                let handle = Arc::new(ClusterHandle { client, identity, source });
                self.published.store(Some(Arc::clone(&handle)));
                Acquired::Ready(handle)
            }
            Err(e) => self.discard(e),
        }
    }

    fn discard(&self, e: ClusterError) -> Acquired {
        warn!(error = %e, "discarding cluster handle");
        counter!("kuyala_session_acquire_failures_total", 1);
        self.published.store(None);
        Acquired::Unavailable(e)
    }

    /// Last published handle, if any, without re-validating.
    pub fn current(&self) -> Option<Arc<ClusterHandle>> {
        self.published.load_full()
    }

    /// Published handle, or a fresh acquisition when none is published.
    pub async fn handle(&self) -> ClusterResult<Arc<ClusterHandle>> {
        if let Some(h) = self.current() {
            return Ok(h);
        }
        match self.acquire().await {
            Acquired::Ready(h) => Ok(h),
            Acquired::Unavailable(e) => Err(e),
        }
    }

    pub fn status(&self) -> ClusterStatus {
        let current = self.current();
        ClusterStatus {
            connected: current.is_some(),
            identity: current.map(|h| h.identity.clone()),
            config_error: self.config_error.load_full().map(|s| s.as_ref().clone()),
        }
    }
}

/// Read the server version and locate a control-plane node.
async fn probe(client: &Client) -> ClusterResult<ClusterIdentity> {
    let info = client
        .apiserver_version()
        .await
        .map_err(|e| ClusterError::ValidationFailed(format!("reading server version: {}", e)))?;
    let nodes: Api<Node> = Api::all(client.clone());
    let list = nodes
        .list(&ListParams::default())
        .await
        .map_err(|e| ClusterError::ValidationFailed(format!("listing nodes: {}", e)))?;
    let (name, ip) = control_plane_identity(&list.items);
    Ok(ClusterIdentity { api_version: info.git_version, control_plane_node_name: name, control_plane_node_ip: ip })
}

/// Name and InternalIP of the first node carrying a control-plane role label.
/// Managed clusters often hide these nodes, in which case both are `None`.
pub(crate) fn control_plane_identity(nodes: &[Node]) -> (Option<String>, Option<String>) {
    let is_cp = |n: &&Node| {
        n.metadata
            .labels
            .as_ref()
            .map(|l| CONTROL_PLANE_LABELS.iter().any(|k| l.contains_key(*k)))
            .unwrap_or(false)
    };
    let Some(node) = nodes.iter().find(is_cp) else {
        return (None, None);
    };
    let ip = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
        .map(|a| a.address.clone());
    (node.metadata.name.clone(), ip)
}
