//! Routes and application state for the HTTP harness.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::GenerationOptions;
use crate::pipeline::pool::MultiPipelinePool;

pub struct AppState {
    pub pool: Arc<MultiPipelinePool>,
    pub start_time: Instant,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default = "default_model_id")]
    pub model_id: String,
    pub prompt: String,
    #[serde(default)]
    pub options: Option<GenerationOptions>,
}

fn default_model_id() -> String {
    "default".to_string()
}

/// `POST /generate`: runs one generation to completion and re-emits each
/// decoded chunk as an SSE event, terminated by a `done` event.
async fn generate(State(state): State<Arc<AppState>>, Json(req): Json<GenerateRequest>) -> impl IntoResponse {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(32);
    let pool = Arc::clone(&state.pool);
    let options = req.options.unwrap_or_default();

    tokio::spawn(async move {
        match pool.execute(&req.model_id, &req.prompt, options, None).await {
            Ok(chunks) => {
                for chunk in chunks {
                    if tx.send(Ok(Event::default().event("token").data(chunk))).await.is_err() {
                        return;
                    }
                }
                let _ = tx.send(Ok(Event::default().event("done").data(""))).await;
            }
            Err(e) => {
                error!(error = %e, model_id = %req.model_id, "generation failed");
                let _ = tx.send(Ok(Event::default().event("error").data(e.to_string()))).await;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    uptime_secs: u64,
}

/// `GET /stats`: process-level stats. Per-pipeline stats are fetched via
/// `Pipeline::get_stats` once a model id is loaded; this endpoint reports
/// only what is available without one.
async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    info!("stats requested");
    Json(StatsResponse {
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}
