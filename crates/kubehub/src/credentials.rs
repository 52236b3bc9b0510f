//! Credential discovery: the ordered list of places a kube configuration may come from.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Config;
use kuyala_core::{ClusterError, ClusterResult};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Service account mounted into the pod.
    InCluster,
    /// `$HOME/.kube/config`.
    DefaultFile,
    /// Kubeconfig path taken from the environment.
    PathFromEnv,
    /// Raw kubeconfig YAML taken from the environment.
    ContentFromEnv,
}

impl std::fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CredentialSource::InCluster => "in-cluster",
            CredentialSource::DefaultFile => "default-file",
            CredentialSource::PathFromEnv => "path-from-env",
            CredentialSource::ContentFromEnv => "content-from-env",
        };
        f.write_str(s)
    }
}

/// Inputs for each credential source; resolution tries them in declaration order.
#[derive(Debug, Clone, Default)]
pub struct CredentialSources {
    pub in_cluster: bool,
    pub default_path: Option<PathBuf>,
    pub path: Option<PathBuf>,
    pub content: Option<String>,
}

impl CredentialSources {
    /// In-cluster plus `$HOME/.kube/config`; env-provided sources are added by the caller.
    pub fn standard() -> Self {
        let default_path = std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".kube").join("config"));
        Self { in_cluster: true, default_path, path: None, content: None }
    }

    pub fn with_path(mut self, path: Option<PathBuf>) -> Self {
        self.path = path;
        self
    }

    pub fn with_content(mut self, content: Option<String>) -> Self {
        self.content = content.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn without_in_cluster(mut self) -> Self {
        self.in_cluster = false;
        self
    }

    /// First source that yields a configuration wins. Each failed attempt is
    /// logged; if none succeed the result is `AuthUnavailable`.
    pub async fn resolve(&self) -> ClusterResult<(Config, CredentialSource)> {
        let mut tried: Vec<String> = Vec::new();

        if self.in_cluster {
            match Config::incluster() {
                Ok(cfg) => return Ok(found(cfg, CredentialSource::InCluster)),
                Err(e) => {
                    debug!(error = %e, "in-cluster credentials unavailable");
                    tried.push(format!("{}: {}", CredentialSource::InCluster, e));
                }
            }
        }

        if let Some(p) = &self.default_path {
            if p.exists() {
                match from_file(p).await {
                    Ok(cfg) => return Ok(found(cfg, CredentialSource::DefaultFile)),
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "default kubeconfig unusable");
                        tried.push(format!("{}: {:#}", CredentialSource::DefaultFile, e));
                    }
                }
            } else {
                debug!(path = %p.display(), "no default kubeconfig");
            }
        }

        if let Some(p) = &self.path {
            match from_file(p).await {
                Ok(cfg) => return Ok(found(cfg, CredentialSource::PathFromEnv)),
                Err(e) => {
                    warn!(path = %p.display(), error = %e, "configured kubeconfig path unusable");
                    tried.push(format!("{}: {:#}", CredentialSource::PathFromEnv, e));
                }
            }
        }

        if let Some(content) = &self.content {
            match from_content(content).await {
                Ok(cfg) => return Ok(found(cfg, CredentialSource::ContentFromEnv)),
                Err(e) => {
                    warn!(error = %e, "kubeconfig content unusable");
                    tried.push(format!("{}: {:#}", CredentialSource::ContentFromEnv, e));
                }
            }
        }

        let detail = if tried.is_empty() { "no credential source configured".to_string() } else { tried.join("; ") };
        Err(ClusterError::AuthUnavailable(detail))
    }
}

fn found(cfg: Config, source: CredentialSource) -> (Config, CredentialSource) {
    info!(source = %source, url = %cfg.cluster_url, "credentials resolved");
    (cfg, source)
}

async fn from_file(path: &Path) -> Result<Config> {
    let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
    Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
        .await
        .context("building client config from kubeconfig file")
}

async fn from_content(content: &str) -> Result<Config> {
    let kc = Kubeconfig::from_yaml(content).context("parsing kubeconfig content")?;
    Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
        .await
        .context("building client config from kubeconfig content")
}
