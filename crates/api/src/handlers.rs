//! JSON and server-push handlers.

use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONNECTION};
use axum::http::HeaderName;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::StreamExt;
use kuyala_core::{BroadcastMessage, ListResponse};
use kuyala_hub::SubscriberSession;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::AppContext;

/// Frames buffered between a serving loop and its HTTP body. Kept at one so
/// a stalled peer is bounded by its subscriber queue, not by this channel.
const OUTBOUND_BUFFER: usize = 1;

static X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

fn to_event(msg: &BroadcastMessage) -> Event {
    let data = msg.data_json().unwrap_or_else(|e| {
        warn!(event = %msg.event_name(), error = %e, "payload serialization failed");
        "{}".to_string()
    });
    Event::default().event(msg.event_name().as_str()).data(data)
}

/// GET /events
///
/// Registers a subscriber and spawns its serving loop; the loop ends when
/// this body is dropped.
pub async fn events(State(ctx): State<AppContext>) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let session = SubscriberSession::connect(ctx.broadcaster.clone());
    let backend = ctx.backend.clone();
    let cancel = ctx.shutdown.child_token();
    let timings = ctx.timings;
    tokio::spawn(async move {
        session.serve(backend.as_ref(), tx, timings, cancel).await;
    });

    let stream = ReceiverStream::new(rx).map(|msg| Ok::<_, Infallible>(to_event(&msg)));
    (
        [(CACHE_CONTROL, "no-cache"), (X_ACCEL_BUFFERING.clone(), "no"), (CONNECTION, "keep-alive")],
        Sse::new(stream),
    )
}

/// Body of POST /action. Fields are optional here so that a missing one
/// becomes a 400 with the standard error body.
#[derive(Debug, Default, Deserialize)]
pub struct ActionRequest {
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub scale: Option<Value>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ActionResponse {
    pub status: &'static str,
    pub scaled_to: u32,
    pub namespace: String,
    pub name: String,
}

/// Replica count as a JSON number or numeric string.
fn parse_scale(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn required(field: &'static str, v: Option<String>) -> Result<String, ApiError> {
    v.filter(|s| !s.is_empty()).ok_or_else(|| ApiError::BadRequest(format!("missing required field: {}", field)))
}

/// POST /action
pub async fn action(
    State(ctx): State<AppContext>,
    body: Result<Json<ActionRequest>, JsonRejection>,
) -> Result<Json<ActionResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let namespace = required("namespace", req.namespace)?;
    let name = required("name", req.name)?;
    let raw_scale = req.scale.ok_or_else(|| ApiError::BadRequest("missing required field: scale".into()))?;
    let scale = parse_scale(&raw_scale)
        .ok_or_else(|| ApiError::BadRequest(format!("scale must be a non-negative integer, got {}", raw_scale)))?;

    ctx.backend.scale(&namespace, &name, scale).await?;
    ctx.stats_trigger.signal();
    info!(ns = %namespace, name = %name, scale, "scale action applied");
    Ok(Json(ActionResponse { status: "success", scaled_to: scale, namespace, name }))
}

/// GET /list
pub async fn list(State(ctx): State<AppContext>) -> Result<Json<ListResponse>, ApiError> {
    let records = ctx.backend.list_records().await?;
    Ok(Json(ListResponse::success(records)))
}

#[derive(Debug, Serialize)]
pub struct KubernetesHealth {
    pub connected: bool,
    pub version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connected_clients: usize,
    pub kubernetes: KubernetesHealth,
    pub server_node_name: Option<String>,
    pub server_node_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_error: Option<String>,
}

/// GET /health
pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    let st = ctx.backend.status();
    let identity = st.identity.unwrap_or_default();
    Json(HealthResponse {
        status: "healthy",
        connected_clients: ctx.broadcaster.subscriber_count(),
        kubernetes: KubernetesHealth {
            connected: st.connected,
            version: Some(identity.api_version).filter(|v| !v.is_empty()),
        },
        server_node_name: identity.control_plane_node_name,
        server_node_ip: identity.control_plane_node_ip,
        config_error: st.config_error,
    })
}
