//! Kuyala core types: annotation-gated resource records, change events,
//! broadcast messages and the cluster backend seam.

#![forbid(unsafe_code)]

pub mod backend;
pub mod error;
pub mod message;
pub mod record;
pub mod stats;

pub use backend::{BoxWatchStream, ClusterBackend, ClusterIdentity, ClusterStatus, MockCluster};
pub use error::{ClusterError, ClusterResult};
pub use message::{BroadcastMessage, ChangeEvent, ChangeKind, ConnectedInfo, EventName, HeartbeatInfo, ListResponse};
pub use record::{record_from_raw, ColorHints, Condition, ResourceRecord, WatchNotification};
pub use stats::ClusterStats;

/// Annotation keys understood on watched deployments.
pub mod annotations {
    /// Gate: only resources carrying this key are materialized.
    pub const ENABLED: &str = "kuyala.enabled";
    pub const REPLICAS_OFF: &str = "kuyala.replicasOff";
    pub const REPLICAS_ON: &str = "kuyala.replicasOn";
    pub const APPLICATION_NAME: &str = "kuyala.applicationName";
    pub const BACKGROUND_COLOR: &str = "kuyala.backgroundColor";
    pub const TEXT_COLOR: &str = "kuyala.textColor";
    /// Older single-colour hint; used as background when `BACKGROUND_COLOR` is absent.
    pub const COLOR: &str = "kuyala.color";
}

/// Unix seconds (fractional) for a wall-clock instant, the unit every wire timestamp uses.
pub fn unix_seconds(ts: chrono::DateTime<chrono::Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

pub mod prelude {
    pub use super::{
        BroadcastMessage, ChangeEvent, ChangeKind, ClusterBackend, ClusterError, ClusterResult, ClusterStats,
        EventName, ResourceRecord, WatchNotification,
    };
}
