//! Deployment list, watch and scale against a validated client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::watcher::{self, Event};
use kube::Client;
use kuyala_core::{annotations, record_from_raw, BoxWatchStream, ChangeKind, ClusterError, ClusterResult, ResourceRecord, WatchNotification};
use metrics::counter;
use tracing::{debug, info, warn};

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

fn raw_of(d: &Deployment) -> ClusterResult<serde_json::Value> {
    let mut raw = serde_json::to_value(d).map_err(|e| ClusterError::ApiError(format!("serializing deployment: {}", e)))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn key_of(raw: &serde_json::Value) -> String {
    let ns = raw.pointer("/metadata/namespace").and_then(|v| v.as_str()).unwrap_or("");
    let name = raw.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or("");
    format!("{}/{}", ns, name)
}

fn resource_version(raw: &serde_json::Value) -> Option<&str> {
    raw.pointer("/metadata/resourceVersion").and_then(|v| v.as_str())
}

/// All deployments across namespaces that pass the annotation gate.
/// A malformed numeric annotation on any of them fails the whole list.
pub async fn list_records(client: Client) -> ClusterResult<Vec<ResourceRecord>> {
    let api: Api<Deployment> = Api::all(client);
    let list = api
        .list(&ListParams::default())
        .await
        .map_err(|e| ClusterError::ApiError(format!("listing deployments: {}", e)))?;
    let mut out = Vec::new();
    for d in list.items.iter() {
        if let Some(rec) = record_from_raw(&raw_of(d)?)? {
            out.push(rec);
        }
    }
    debug!(total = list.items.len(), gated = out.len(), "deployments listed");
    Ok(out)
}

pub async fn scale(client: Client, namespace: &str, name: &str, replicas: u32) -> ClusterResult<()> {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    let payload = serde_json::json!({"spec": {"replicas": replicas}});
    api.patch_scale(name, &PatchParams::default(), &Patch::Merge(&payload))
        .await
        .map_err(|e| ClusterError::ApiError(format!("scaling {}/{}: {}", namespace, name, e)))?;
    counter!("kuyala_scale_actions_total", 1);
    info!(ns = %namespace, name = %name, replicas, "deployment scaled");
    Ok(())
}

/// What the tracker keeps per key: the resourceVersion, plus the object
/// itself only when it carries the enabled annotation, so a deletion found on
/// re-list can still be announced.
struct Seen {
    version: Option<String>,
    gated: Option<serde_json::Value>,
}

impl Seen {
    fn of(raw: &serde_json::Value) -> Self {
        let gated = raw
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(annotations::ENABLED))
            .is_some()
            .then(|| raw.clone());
        Self { version: resource_version(raw).map(str::to_string), gated }
    }
}

/// Classifies runtime watcher events into added/modified/deleted notifications.
///
/// The runtime watcher reports creations and updates alike as `Applied` and
/// re-lists as `Restarted`; tracking the keys already seen recovers the
/// distinction and turns vanished keys into deletions. One tracker outlives
/// individual feeds, so the re-list after a reconnect is diffed against what
/// clients were last told.
#[derive(Default)]
pub struct KindTracker {
    seen: HashMap<String, Seen>,
}

pub type SharedTracker = Arc<Mutex<KindTracker>>;

impl KindTracker {
    pub(crate) fn applied(&mut self, raw: serde_json::Value) -> WatchNotification {
        let kind = match self.seen.insert(key_of(&raw), Seen::of(&raw)) {
            Some(_) => ChangeKind::Modified,
            None => ChangeKind::Added,
        };
        WatchNotification { kind, raw }
    }

    pub(crate) fn deleted(&mut self, raw: serde_json::Value) -> WatchNotification {
        self.seen.remove(&key_of(&raw));
        WatchNotification { kind: ChangeKind::Deleted, raw }
    }

    /// Re-list: unseen keys are added, changed ones modified, missing gated ones deleted.
    /// Objects whose resourceVersion did not move are not re-announced.
    pub(crate) fn restarted(&mut self, list: Vec<serde_json::Value>) -> Vec<WatchNotification> {
        let mut previous = std::mem::take(&mut self.seen);
        let mut out = Vec::with_capacity(list.len());
        for raw in list {
            let key = key_of(&raw);
            let version = resource_version(&raw);
            match previous.remove(&key) {
                None => out.push(WatchNotification { kind: ChangeKind::Added, raw: raw.clone() }),
                Some(old) if old.version.as_deref() != version || version.is_none() => {
                    out.push(WatchNotification { kind: ChangeKind::Modified, raw: raw.clone() })
                }
                Some(_) => {}
            }
            self.seen.insert(key, Seen::of(&raw));
        }
        for (_, old) in previous {
            if let Some(raw) = old.gated {
                out.push(WatchNotification { kind: ChangeKind::Deleted, raw });
            }
        }
        out
    }
}

fn notifications(tracker: &SharedTracker, ev: Event<Deployment>) -> ClusterResult<Vec<WatchNotification>> {
    let mut tracker = tracker.lock().unwrap_or_else(PoisonError::into_inner);
    match ev {
        Event::Applied(d) => Ok(vec![tracker.applied(raw_of(&d)?)]),
        Event::Deleted(d) => Ok(vec![tracker.deleted(raw_of(&d)?)]),
        Event::Restarted(list) => {
            debug!(count = list.len(), "deployment watch restart");
            let raws = list.iter().map(raw_of).collect::<ClusterResult<Vec<_>>>()?;
            Ok(tracker.restarted(raws))
        }
    }
}

/// Change feed over deployments in every namespace.
///
/// The first error ends the feed; reconnecting is the caller's job. Pass the
/// same tracker to every feed of one backend.
pub fn deployment_feed(client: Client, tracker: SharedTracker) -> BoxWatchStream {
    let api: Api<Deployment> = Api::all(client);
    info!("deployment watch started");
    watcher::watcher(api, watcher::Config::default())
        .map(move |res| match res {
            Ok(ev) => notifications(&tracker, ev),
            Err(e) => {
                warn!(error = %e, "deployment watch failed");
                Err(ClusterError::StreamError(e.to_string()))
            }
        })
        .scan(false, |failed, res| {
            if *failed {
                return futures::future::ready(None);
            }
            *failed = res.is_err();
            futures::future::ready(Some(res))
        })
        .flat_map(|res| match res {
            Ok(batch) => stream::iter(batch.into_iter().map(Ok).collect::<Vec<ClusterResult<WatchNotification>>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn dep(ns: &str, name: &str, rv: &str) -> serde_json::Value {
        json!({"metadata": {
            "namespace": ns, "name": name, "resourceVersion": rv,
            "annotations": {"kuyala.enabled": "true"}
        }})
    }

    fn plain(ns: &str, name: &str, rv: &str) -> serde_json::Value {
        json!({"metadata": {"namespace": ns, "name": name, "resourceVersion": rv}})
    }

    fn deployment(name: &str, rv: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                namespace: Some("ns1".into()),
                name: Some(name.into()),
                resource_version: Some(rv.into()),
                annotations: Some(BTreeMap::from([("kuyala.enabled".to_string(), "true".to_string())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn kinds(v: &[WatchNotification]) -> Vec<ChangeKind> {
        v.iter().map(|n| n.kind).collect()
    }

    #[test]
    fn first_apply_is_added_then_modified() {
        let mut t = KindTracker::default();
        assert_eq!(t.applied(dep("a", "x", "1")).kind, ChangeKind::Added);
        assert_eq!(t.applied(dep("a", "x", "2")).kind, ChangeKind::Modified);
        assert_eq!(t.applied(dep("b", "x", "3")).kind, ChangeKind::Added);
    }

    #[test]
    fn delete_forgets_key() {
        let mut t = KindTracker::default();
        t.applied(dep("a", "x", "1"));
        assert_eq!(t.deleted(dep("a", "x", "2")).kind, ChangeKind::Deleted);
        assert_eq!(t.applied(dep("a", "x", "3")).kind, ChangeKind::Added);
    }

    #[test]
    fn initial_list_is_all_added() {
        let mut t = KindTracker::default();
        let out = t.restarted(vec![dep("a", "x", "1"), dep("a", "y", "1")]);
        assert_eq!(kinds(&out), vec![ChangeKind::Added, ChangeKind::Added]);
    }

    #[test]
    fn relist_diffs_against_seen_state() {
        let mut t = KindTracker::default();
        t.restarted(vec![dep("a", "keep", "1"), dep("a", "bump", "1"), dep("a", "gone", "1")]);
        let out = t.restarted(vec![dep("a", "keep", "1"), dep("a", "bump", "2"), dep("a", "new", "1")]);
        assert_eq!(kinds(&out), vec![ChangeKind::Modified, ChangeKind::Added, ChangeKind::Deleted]);
        assert_eq!(out[2].raw["metadata"]["name"], "gone");
        assert_eq!(t.applied(dep("a", "new", "2")).kind, ChangeKind::Modified);
    }

    #[test]
    fn ungated_objects_keep_only_their_version() {
        let mut t = KindTracker::default();
        t.restarted(vec![plain("a", "other", "1"), dep("a", "svc", "1")]);
        assert!(t.seen["a/other"].gated.is_none());
        assert_eq!(t.seen["a/other"].version.as_deref(), Some("1"));
        assert!(t.seen["a/svc"].gated.is_some());

        assert!(t.restarted(vec![plain("a", "other", "1"), dep("a", "svc", "1")]).is_empty());
        let out = t.restarted(vec![]);
        assert_eq!(kinds(&out), vec![ChangeKind::Deleted]);
        assert_eq!(out[0].raw["metadata"]["name"], "svc");
    }

    #[test]
    fn reconnect_relist_reports_deletions_made_while_disconnected() {
        let tracker = SharedTracker::default();
        let first = notifications(&tracker, Event::Restarted(vec![deployment("a", "1"), deployment("b", "1")])).unwrap();
        assert_eq!(kinds(&first), vec![ChangeKind::Added, ChangeKind::Added]);

        // A later feed reuses the tracker; "b" vanished between the two.
        let second = notifications(&tracker, Event::Restarted(vec![deployment("a", "1")])).unwrap();
        assert_eq!(kinds(&second), vec![ChangeKind::Deleted]);
        assert_eq!(second[0].raw["metadata"]["name"], "b");
    }

    #[test]
    fn managed_fields_are_stripped() {
        let mut v = json!({"metadata": {"name": "x", "managedFields": [{"manager": "kubectl"}]}});
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
        assert_eq!(v["metadata"]["name"], "x");
    }
}
