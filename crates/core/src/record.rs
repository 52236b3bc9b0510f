//! Annotation gate and normalization of raw deployment JSON into [`ResourceRecord`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use smallvec::SmallVec;

use crate::annotations;
use crate::error::{ClusterError, ClusterResult};
use crate::message::ChangeKind;

/// One raw change notification from the watch feed, before the annotation gate.
#[derive(Debug, Clone)]
pub struct WatchNotification {
    pub kind: ChangeKind,
    /// Raw object as served by the API (`metadata`, `spec`, `status`).
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorHints {
    pub background_color: String,
    pub text_color: String,
}

/// A deployment that passed the annotation gate, shaped for clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub namespace: String,
    pub name: String,
    #[serde(rename = "applicationName")]
    pub display_name: String,
    pub annotations: BTreeMap<String, String>,
    #[serde(rename = "creationDate")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "condition", serialize_with = "conditions_or_null")]
    pub conditions: SmallVec<[Condition; 4]>,
    #[serde(flatten)]
    pub colors: ColorHints,
    pub replicas_off: u32,
    pub replicas_on: u32,
    pub replicas_current: u32,
}

impl ResourceRecord {
    /// `namespace/name`, the identity clients key cards by.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_running(&self) -> bool {
        self.replicas_current > 0
    }
}

fn conditions_or_null<S: Serializer>(conds: &SmallVec<[Condition; 4]>, s: S) -> Result<S::Ok, S::Error> {
    if conds.is_empty() {
        s.serialize_none()
    } else {
        s.collect_seq(conds.iter())
    }
}

/// Parse a numeric annotation. Absent keys take `default`; present but
/// non-numeric values are an error rather than silently defaulted.
fn replica_annotation(annos: &BTreeMap<String, String>, key: &str, default: u32) -> ClusterResult<u32> {
    match annos.get(key) {
        None => Ok(default),
        Some(v) => v.trim().parse::<u32>().map_err(|_| ClusterError::MalformedAnnotation {
            key: key.to_string(),
            value: v.clone(),
        }),
    }
}

/// Normalize a raw deployment object.
///
/// Returns `Ok(None)` when the object lacks the enabled annotation, so callers
/// can discard it at the boundary.
pub fn record_from_raw(raw: &serde_json::Value) -> ClusterResult<Option<ResourceRecord>> {
    let mut annos: BTreeMap<String, String> = BTreeMap::new();
    if let Some(obj) = raw.pointer("/metadata/annotations").and_then(|v| v.as_object()) {
        for (k, v) in obj.iter() {
            if let Some(val) = v.as_str() {
                annos.insert(k.clone(), val.to_string());
            }
        }
    }
    if !annos.contains_key(annotations::ENABLED) {
        return Ok(None);
    }

    let name = raw.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let namespace = raw.pointer("/metadata/namespace").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let creation_timestamp = raw
        .pointer("/metadata/creationTimestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let replicas_off = replica_annotation(&annos, annotations::REPLICAS_OFF, 0)?;
    let replicas_on = replica_annotation(&annos, annotations::REPLICAS_ON, 1)?;
    let replicas_current = raw
        .pointer("/status/replicas")
        .and_then(|v| v.as_u64())
        .map(|n| n.min(u32::MAX as u64) as u32)
        .unwrap_or(0);

    let mut conditions = SmallVec::new();
    if let Some(conds) = raw.pointer("/status/conditions").and_then(|v| v.as_array()) {
        for c in conds {
            let type_ = c.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let status = c.get("status").and_then(|v| v.as_str()).unwrap_or("").to_string();
            conditions.push(Condition { type_, status });
        }
    }

    let display_name = annos.get(annotations::APPLICATION_NAME).cloned().unwrap_or_else(|| name.clone());
    let colors = ColorHints {
        background_color: annos
            .get(annotations::BACKGROUND_COLOR)
            .or_else(|| annos.get(annotations::COLOR))
            .cloned()
            .unwrap_or_default(),
        text_color: annos.get(annotations::TEXT_COLOR).cloned().unwrap_or_default(),
    };

    Ok(Some(ResourceRecord {
        namespace,
        name,
        display_name,
        annotations: annos,
        creation_timestamp,
        conditions,
        colors,
        replicas_off,
        replicas_on,
        replicas_current,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(annos: serde_json::Value, status: serde_json::Value) -> serde_json::Value {
        json!({
            "metadata": {
                "name": "svc-a",
                "namespace": "ns1",
                "creationTimestamp": "2024-05-01T10:00:00Z",
                "annotations": annos,
            },
            "status": status,
        })
    }

    #[test]
    fn missing_gate_annotation_is_discarded() {
        let raw = deployment(json!({"kuyala.replicasOn": "3", "kuyala.applicationName": "A"}), json!({"replicas": 3}));
        assert_eq!(record_from_raw(&raw).unwrap(), None);
        let bare = json!({"metadata": {"name": "x", "namespace": "y"}});
        assert_eq!(record_from_raw(&bare).unwrap(), None);
    }

    #[test]
    fn absent_fields_take_defaults() {
        let raw = deployment(json!({"kuyala.enabled": "true"}), json!({}));
        let rec = record_from_raw(&raw).unwrap().expect("gated in");
        assert_eq!(rec.replicas_off, 0);
        assert_eq!(rec.replicas_on, 1);
        assert_eq!(rec.replicas_current, 0);
        assert_eq!(rec.display_name, "svc-a");
        assert_eq!(rec.colors, ColorHints::default());
        assert!(rec.conditions.is_empty());
    }

    #[test]
    fn annotations_and_status_are_projected() {
        let raw = deployment(
            json!({
                "kuyala.enabled": "true",
                "kuyala.replicasOff": "0",
                "kuyala.replicasOn": " 3 ",
                "kuyala.applicationName": "Billing",
                "kuyala.color": "#123456",
                "kuyala.textColor": "white",
            }),
            json!({"replicas": 3, "conditions": [{"type": "Available", "status": "True"}]}),
        );
        let rec = record_from_raw(&raw).unwrap().unwrap();
        assert_eq!(rec.key(), "ns1/svc-a");
        assert_eq!(rec.display_name, "Billing");
        assert_eq!(rec.replicas_on, 3);
        assert_eq!(rec.replicas_current, 3);
        assert!(rec.is_running());
        assert_eq!(rec.colors.background_color, "#123456");
        assert_eq!(rec.colors.text_color, "white");
        assert_eq!(rec.conditions.len(), 1);
        assert_eq!(rec.creation_timestamp.map(|t| t.timestamp()), Some(1_714_557_600));
    }

    #[test]
    fn malformed_count_is_an_error_not_a_default() {
        let raw = deployment(json!({"kuyala.enabled": "true", "kuyala.replicasOn": "three"}), json!({}));
        let err = record_from_raw(&raw).unwrap_err();
        assert_eq!(
            err,
            ClusterError::MalformedAnnotation { key: "kuyala.replicasOn".into(), value: "three".into() }
        );
        let negative = deployment(json!({"kuyala.enabled": "", "kuyala.replicasOff": "-1"}), json!({}));
        assert!(record_from_raw(&negative).is_err());
    }

    #[test]
    fn wire_shape_uses_client_field_names() {
        let raw = deployment(json!({"kuyala.enabled": "true", "kuyala.backgroundColor": "red"}), json!({"replicas": 1}));
        let rec = record_from_raw(&raw).unwrap().unwrap();
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["applicationName"], "svc-a");
        assert_eq!(v["creationDate"], "2024-05-01T10:00:00Z");
        assert_eq!(v["condition"], serde_json::Value::Null);
        assert_eq!(v["backgroundColor"], "red");
        assert_eq!(v["textColor"], "");
        assert_eq!(v["replicasOff"], 0);
        assert_eq!(v["replicasOn"], 1);
        assert_eq!(v["replicasCurrent"], 1);
        assert_eq!(v["annotations"]["kuyala.enabled"], "true");
    }
}
