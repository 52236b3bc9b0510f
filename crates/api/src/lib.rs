//! Kuyala HTTP surface.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | Index page |
//! | GET | `/events` | Server-push stream of live updates |
//! | POST | `/action` | Scale one deployment |
//! | GET | `/list` | All gated deployments |
//! | GET | `/health` | Liveness and cluster connectivity |

#![forbid(unsafe_code)]

pub mod error;
pub mod handlers;
pub mod page;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use kuyala_core::ClusterBackend;
use kuyala_hub::{Broadcaster, StatsTrigger, Timings};
use tokio_util::sync::CancellationToken;

pub use error::ApiError;

/// Everything a handler or background task needs, built once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub backend: Arc<dyn ClusterBackend>,
    pub broadcaster: Arc<Broadcaster>,
    pub stats_trigger: StatsTrigger,
    pub timings: Timings,
    /// Fires on shutdown; subscriber sessions watch a child of it.
    pub shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(backend: Arc<dyn ClusterBackend>, stats_trigger: StatsTrigger, shutdown: CancellationToken) -> Self {
        Self {
            backend,
            broadcaster: Arc::new(Broadcaster::default()),
            stats_trigger,
            timings: Timings::default(),
            shutdown,
        }
    }
}

pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(page::index))
        .route("/events", get(handlers::events))
        .route("/action", post(handlers::action))
        .route("/list", get(handlers::list))
        .route("/health", get(handlers::health))
        .with_state(ctx)
}
