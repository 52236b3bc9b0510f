//! Units moved through the broadcaster and their wire payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::ResourceRecord;
use crate::stats::ClusterStats;
use crate::unix_seconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// A gated, normalized change observed on the watch feed. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: ResourceRecord,
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, record: ResourceRecord) -> Self {
        Self { kind, record, observed_at: Utc::now() }
    }
}

/// `deployment_update` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentUpdate<'a> {
    #[serde(rename = "type")]
    kind: ChangeKind,
    namespace: &'a str,
    name: &'a str,
    application_name: &'a str,
    background_color: &'a str,
    text_color: &'a str,
    replicas_off: u32,
    replicas_on: u32,
    replicas_current: u32,
    timestamp: f64,
}

impl Serialize for ChangeEvent {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let r = &self.record;
        DeploymentUpdate {
            kind: self.kind,
            namespace: &r.namespace,
            name: &r.name,
            application_name: &r.display_name,
            background_color: &r.colors.background_color,
            text_color: &r.colors.text_color,
            replicas_off: r.replicas_off,
            replicas_on: r.replicas_on,
            replicas_current: r.replicas_current,
            timestamp: unix_seconds(self.observed_at),
        }
        .serialize(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectedInfo {
    pub client_id: String,
    pub message: String,
    pub server_node_name: Option<String>,
    pub server_node_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatInfo {
    pub timestamp: f64,
}

impl HeartbeatInfo {
    pub fn now() -> Self {
        Self { timestamp: unix_seconds(Utc::now()) }
    }
}

/// Success body of the list operation; also the `initial_data` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListResponse {
    pub status: &'static str,
    pub data: Vec<ResourceRecord>,
}

impl ListResponse {
    pub fn success(data: Vec<ResourceRecord>) -> Self {
        Self { status: "success", data }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Connected,
    InitialData,
    StatsUpdate,
    DeploymentUpdate,
    Heartbeat,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Connected => "connected",
            EventName::InitialData => "initial_data",
            EventName::StatsUpdate => "stats_update",
            EventName::DeploymentUpdate => "deployment_update",
            EventName::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named server-push message. The event name is derived from the payload
/// so the two can never disagree.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastMessage {
    Connected(ConnectedInfo),
    InitialData(ListResponse),
    Stats(ClusterStats),
    Change(ChangeEvent),
    Heartbeat(HeartbeatInfo),
}

impl BroadcastMessage {
    pub fn event_name(&self) -> EventName {
        match self {
            BroadcastMessage::Connected(_) => EventName::Connected,
            BroadcastMessage::InitialData(_) => EventName::InitialData,
            BroadcastMessage::Stats(_) => EventName::StatsUpdate,
            BroadcastMessage::Change(_) => EventName::DeploymentUpdate,
            BroadcastMessage::Heartbeat(_) => EventName::Heartbeat,
        }
    }

    /// JSON body of the payload (the `data:` line of a server-push frame).
    pub fn data_json(&self) -> serde_json::Result<String> {
        match self {
            BroadcastMessage::Connected(v) => serde_json::to_string(v),
            BroadcastMessage::InitialData(v) => serde_json::to_string(v),
            BroadcastMessage::Stats(v) => serde_json::to_string(v),
            BroadcastMessage::Change(v) => serde_json::to_string(v),
            BroadcastMessage::Heartbeat(v) => serde_json::to_string(v),
        }
    }
}
