//! Admin HTTP surface: health, stats, and a minimal message ingress.

use crate::services::{DataMartStore, Scheduler};
use crate::sources::EngineClient;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// State shared across admin handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<DataMartStore>,
    pub engine: Arc<EngineClient>,
    pub scheduler: Arc<Scheduler>,
    /// Channel feeding the message consumer.
    pub ingest_tx: mpsc::Sender<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    database: bool,
    engine: bool,
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let database = state.store.ping();
    let engine = state.engine.ping().await;
    Json(HealthResponse {
        status: if database { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database,
        engine,
    })
}

async fn stats(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.table_counts() {
        Ok(tables) => (
            StatusCode::OK,
            Json(json!({
                "queueDepth": state.scheduler.depth(),
                "inFlightKeys": state.scheduler.in_flight(),
                "tables": tables,
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// Accept one raw affected-entity message and hand it to the consumer.
async fn post_message(State(state): State<ApiState>, body: String) -> impl IntoResponse {
    if body.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "empty message body" })),
        );
    }
    match state.ingest_tx.send(body).await {
        Ok(()) => {
            debug!("enqueued ingest message");
            (StatusCode::ACCEPTED, Json(json!({ "status": "queued" })))
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": format!("ingest channel closed: {e}") })),
        ),
    }
}

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/messages", post(post_message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> (ApiState, mpsc::Receiver<String>) {
        let (scheduler, _task_rx) = Scheduler::new(16, 8, 2);
        let (ingest_tx, ingest_rx) = mpsc::channel(4);
        let state = ApiState {
            store: Arc::new(DataMartStore::new_in_memory().unwrap()),
            engine: Arc::new(EngineClient::fixture()),
            scheduler,
            ingest_tx,
        };
        (state, ingest_rx)
    }

    #[tokio::test]
    async fn test_health_handler() {
        let (state, _rx) = test_state();
        let Json(response) = health(State(state)).await;
        assert_eq!(response.status, "ok");
        assert!(response.database);
        assert!(response.engine);
    }

    #[tokio::test]
    async fn test_post_message_enqueues_body() {
        let (state, mut rx) = test_state();
        post_message(State(state), r#"{"ENTITY_ID": 1}"#.to_string()).await;
        assert_eq!(rx.recv().await.unwrap(), r#"{"ENTITY_ID": 1}"#);
    }
}
