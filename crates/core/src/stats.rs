use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::record::ResourceRecord;
use crate::unix_seconds;

/// Aggregate snapshot over the gated deployments (`stats_update` payload).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStats {
    pub total_enabled: usize,
    pub running: usize,
    pub stopped: usize,
    pub total_replicas: u64,
    pub namespaces: usize,
    pub timestamp: f64,
}

impl ClusterStats {
    pub fn from_records(records: &[ResourceRecord], at: DateTime<Utc>) -> Self {
        let running = records.iter().filter(|r| r.is_running()).count();
        let namespaces: BTreeSet<&str> = records.iter().map(|r| r.namespace.as_str()).collect();
        Self {
            total_enabled: records.len(),
            running,
            stopped: records.len() - running,
            total_replicas: records.iter().map(|r| r.replicas_current as u64).sum(),
            namespaces: namespaces.len(),
            timestamp: unix_seconds(at),
        }
    }
}
