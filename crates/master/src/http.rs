//! Read-only statistics over HTTP.
//!
//! - `GET /stats`: system counters plus every running problem
//! - `GET /stats/problems/{id}`: one running problem

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use farmhand_core::{ProblemId, ProblemStatistics, SystemStatistics};

use crate::dispatcher::Dispatcher;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub system: SystemStatistics,
    pub problems: Vec<ProblemStatistics>,
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/stats", get(stats_handler))
        .route("/stats/problems/{id}", get(problem_handler))
        .with_state(dispatcher)
}

async fn stats_handler(State(dispatcher): State<Arc<Dispatcher>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        system: dispatcher.system_statistics(),
        problems: dispatcher.all_problem_statistics(),
    })
}

async fn problem_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProblemStatistics>, StatusCode> {
    dispatcher
        .problem_statistics(ProblemId(id))
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Serve the statistics endpoints until `shutdown` flips to `true`.
pub fn spawn_stats_server(
    port: u16,
    dispatcher: Arc<Dispatcher>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(dispatcher);
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(port, error = %e, "failed to bind stats HTTP server");
                return;
            }
        };

        tracing::info!(port, "stats HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = shutdown;
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .ok();

        tracing::info!("stats HTTP server stopped");
    })
}
