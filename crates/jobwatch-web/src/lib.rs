//! Axum JSON surface for jobwatch: on-demand cycles, sweeps and listing inspection.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use jobwatch_core::{CycleFailure, CycleOutcome, Listing, SubscriberId};
use jobwatch_sync::Pipeline;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "jobwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Serialize)]
struct CycleResponse {
    subscriber_id: SubscriberId,
    #[serde(flatten)]
    outcome: CycleOutcome,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListingsResponse {
    subscriber_id: SubscriberId,
    total: usize,
    pending: usize,
    listings: Vec<Listing>,
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    subscriber_id: SubscriberId,
    deleted: u64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/subscribers/{id}/cycle", post(cycle_handler))
        .route(
            "/subscribers/{id}/listings",
            get(listings_handler).delete(clear_handler),
        )
        .route("/sweep", post(sweep_handler))
        .route("/retention", post(retention_handler))
        .with_state(Arc::new(state))
}

pub fn web_port_from_env() -> u16 {
    std::env::var("JOBWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(pipeline: Arc<Pipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

pub async fn serve_from_env(pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    serve(pipeline, web_port_from_env()).await
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn cycle_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    let subscriber_id = SubscriberId(id);
    let outcome = state.pipeline.trigger_cycle(subscriber_id).await;
    let status = match &outcome {
        CycleOutcome::Failed {
            reason: CycleFailure::UnknownSubscriber(_),
        } => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    let message = outcome.subscriber_message();
    (
        status,
        Json(CycleResponse {
            subscriber_id,
            outcome,
            message,
        }),
    )
        .into_response()
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    let subscriber_id = SubscriberId(id);
    match state.pipeline.listings(subscriber_id).await {
        Ok(listings) => Json(ListingsResponse {
            subscriber_id,
            total: listings.len(),
            pending: listings.iter().filter(|l| !l.delivered).count(),
            listings,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn clear_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    let subscriber_id = SubscriberId(id);
    match state.pipeline.clear_subscriber(subscriber_id).await {
        Ok(deleted) => Json(ClearResponse {
            subscriber_id,
            deleted,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn sweep_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.trigger_sweep_all().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

async fn retention_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_retention().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
