// src/server.rs

//! HTTP surface for triggers, status, and baseline management.
//!
//! Thin glue over the detection pipeline: triggers enqueue background runs
//! and return immediately; reads come straight from the stores.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{Baseline, ChangeSummary, DetectionMethod, EvolutionType};
use crate::pipeline::{run_all, run_site, DetectionContext};
use crate::storage::{timestamp_slug, BaselineStore, ReportWriter};

// ── Config ──

pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
}

// ── App State ──

struct AppState {
    ctx: DetectionContext,
}

impl AppState {
    fn config(&self) -> &Config {
        &self.ctx.config
    }
}

// ── Error Handling ──

struct ApiError(AppError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::UnknownSite(_) | AppError::BaselineNotFound { .. } => StatusCode::NOT_FOUND,
            AppError::BusySite { .. } => StatusCode::CONFLICT,
            AppError::Config(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

// ── Entrypoint ──

/// Serve the HTTP API until the process is stopped.
pub async fn serve(config: Arc<Config>, serve_config: ServeConfig) -> Result<()> {
    let app = router(config);
    let addr = format!("{}:{}", serve_config.bind, serve_config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router (exposed separately for tests).
pub fn router(config: Arc<Config>) -> Router {
    let state = Arc::new(AppState {
        ctx: DetectionContext::new(config),
    });

    Router::new()
        .route("/trigger/all", post(trigger_all))
        .route("/trigger/:site_id", post(trigger_site))
        .route("/status", get(get_status))
        .route("/sites/:site_id", get(get_site))
        .route("/changes/:site_id", get(get_changes))
        .route("/baselines/:site_id", get(get_baselines))
        .route("/baselines/:site_id/rollback", post(post_rollback))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Triggers ──

#[derive(Serialize)]
struct TriggerResponse {
    run_id: String,
    site_ids: Vec<String>,
}

#[derive(Deserialize, Default)]
struct TriggerParams {
    #[serde(default)]
    revalidate: bool,
}

async fn trigger_site(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
    Query(params): Query<TriggerParams>,
) -> std::result::Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let site = state.config().site(&site_id)?.clone();
    let now = Utc::now();
    let run_id = format!("{}_{}", site.id, timestamp_slug(now));

    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        let output_root = task_state.config().options.output_root.clone();
        let writer = match ReportWriter::create(&output_root, now).await {
            Ok(writer) => writer,
            Err(e) => {
                error!(site = %site.id, error = %e, "cannot create run directory");
                return;
            }
        };
        if let Err(e) = run_site(&task_state.ctx, &site, &writer, params.revalidate).await {
            error!(site = %site.id, error = %e, "triggered run failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            run_id,
            site_ids: vec![site_id],
        }),
    ))
}

async fn trigger_all(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let now = Utc::now();
    let run_id = format!("all_{}", timestamp_slug(now));
    let site_ids: Vec<String> = state
        .config()
        .active_sites()
        .map(|s| s.id.clone())
        .collect();

    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        let output_root = task_state.config().options.output_root.clone();
        let writer = match ReportWriter::create(&output_root, now).await {
            Ok(writer) => writer,
            Err(e) => {
                error!(error = %e, "cannot create run directory");
                return;
            }
        };
        run_all(&task_state.ctx, &writer).await;
    });

    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { run_id, site_ids })))
}

// ── GET /status ──

#[derive(Serialize)]
struct StatusResponse {
    sites_configured: usize,
    sites_active: usize,
    progress: Vec<crate::pipeline::SiteProgress>,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        sites_configured: state.config().sites.len(),
        sites_active: state.config().active_sites().count(),
        progress: state.ctx.progress.snapshot(),
    })
}

// ── Baseline summaries ──

#[derive(Serialize)]
struct BaselineSummary {
    id: String,
    created_at: DateTime<Utc>,
    evolution_type: EvolutionType,
    method: DetectionMethod,
    total_urls: usize,
    total_content_hashes: usize,
    change_summary: ChangeSummary,
}

impl BaselineSummary {
    fn from_baseline(baseline: &Baseline) -> Result<Self> {
        Ok(Self {
            id: BaselineStore::identifier_for(baseline)?,
            created_at: baseline.created_at,
            evolution_type: baseline.evolution_type,
            method: baseline.metadata.method,
            total_urls: baseline.urls.len(),
            total_content_hashes: baseline.content_hashes.len(),
            change_summary: baseline.change_summary,
        })
    }
}

// ── GET /sites/{site_id} ──

#[derive(Serialize)]
struct SiteResponse {
    site_id: String,
    name: String,
    url: String,
    methods: Vec<DetectionMethod>,
    active: bool,
    latest_baseline: Option<BaselineSummary>,
    recent_change_files: Vec<String>,
}

async fn get_site(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
) -> std::result::Result<Json<SiteResponse>, ApiError> {
    let site = state.config().site(&site_id)?.clone();

    let latest_baseline = match state.ctx.store.latest(&site.id).await? {
        Some(baseline) => Some(BaselineSummary::from_baseline(&baseline)?),
        None => None,
    };

    let recent_change_files =
        ReportWriter::list_change_files(&state.config().options.output_root, &site.id, 5)
            .await?
            .into_iter()
            .filter_map(|p| p.to_str().map(|s| s.to_string()))
            .collect();

    Ok(Json(SiteResponse {
        site_id: site.id,
        name: site.name,
        url: site.url,
        methods: site.methods,
        active: site.active,
        latest_baseline,
        recent_change_files,
    }))
}

// ── GET /changes/{site_id} ──

#[derive(Deserialize)]
struct ChangesParams {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct ChangesResponse {
    site_id: String,
    count: usize,
    reports: Vec<serde_json::Value>,
}

async fn get_changes(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
    Query(params): Query<ChangesParams>,
) -> std::result::Result<Json<ChangesResponse>, ApiError> {
    state.config().site(&site_id)?;
    let limit = params.limit.unwrap_or(10).clamp(1, 100);

    let files =
        ReportWriter::list_change_files(&state.config().options.output_root, &site_id, limit)
            .await?;

    let mut reports = Vec::with_capacity(files.len());
    for file in files {
        let raw = tokio::fs::read(&file).await.map_err(AppError::from)?;
        let report: serde_json::Value = serde_json::from_slice(&raw).map_err(AppError::from)?;
        reports.push(report);
    }

    Ok(Json(ChangesResponse {
        site_id,
        count: reports.len(),
        reports,
    }))
}

// ── GET /baselines/{site_id} ──

#[derive(Serialize)]
struct BaselinesResponse {
    site_id: String,
    baselines: Vec<BaselineSummary>,
}

async fn get_baselines(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
) -> std::result::Result<Json<BaselinesResponse>, ApiError> {
    state.config().site(&site_id)?;

    let mut baselines = Vec::new();
    for id in state.ctx.store.list(&site_id).await? {
        let baseline = state.ctx.store.load(&site_id, &id).await?;
        let mut summary = BaselineSummary::from_baseline(&baseline)?;
        // Keep the on-disk identifier even if re-serialization would differ.
        summary.id = id;
        baselines.push(summary);
    }

    Ok(Json(BaselinesResponse { site_id, baselines }))
}

// ── POST /baselines/{site_id}/rollback ──

#[derive(Deserialize)]
struct RollbackRequest {
    baseline_id: String,
}

#[derive(Serialize)]
struct RollbackResponse {
    site_id: String,
    new_baseline: String,
}

async fn post_rollback(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> std::result::Result<Json<RollbackResponse>, ApiError> {
    state.config().site(&site_id)?;

    // Rollbacks contend with detection runs like any other baseline write.
    let lock_wait = state.config().options.lock_wait();
    let _lock = state.ctx.store.lock_site(&site_id, lock_wait).await?;

    let new_baseline = state
        .ctx
        .store
        .rollback(&site_id, &request.baseline_id, Utc::now())
        .await?;

    Ok(Json(RollbackResponse {
        site_id,
        new_baseline,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_config() -> Arc<Config> {
        let raw = r#"
            [options]
            baseline_root = "/tmp/driftwatch-test-baselines"
            output_root = "/tmp/driftwatch-test-output"

            [[sites]]
            id = "example"
            name = "Example"
            url = "https://example.com"
        "#;
        Arc::new(toml::from_str(raw).unwrap())
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let app = router(make_config());
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_trigger_unknown_site_is_404() {
        let app = router(make_config());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/trigger/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_site_lookup_is_404() {
        let app = router(make_config());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sites/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
