//! Axum HTTP API for dispatching sections and reading report state.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use solrep_core::{PipelineError, Report, SectionName, SectionRecord, SectionStatus};
use solrep_pipeline::{Dispatcher, PipelineServices};
use solrep_storage::SectionStore;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "solrep-web";

#[derive(Clone)]
pub struct AppState {
    pub store: SectionStore,
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(store: SectionStore, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }

    pub fn from_services(services: &PipelineServices) -> Self {
        Self::new(services.store.clone(), services.dispatcher.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
struct DispatchParams {
    #[serde(default)]
    force: bool,
}

/// A report as stored plus its reduced overall status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportView {
    #[serde(flatten)]
    pub report: Report,
    pub overall_status: SectionStatus,
}

impl From<Report> for ReportView {
    fn from(report: Report) -> Self {
        Self {
            overall_status: report.overall_status(),
            report,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/reports/{report_id}", get(report_handler))
        .route(
            "/reports/{report_id}/sections/{section}",
            get(section_handler).post(dispatch_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let services = PipelineServices::connect_from_env().await?;
    let port = services.config.web_port;
    serve(AppState::from_services(&services), port).await
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    Path((report_id, section)): Path<(String, String)>,
    Query(params): Query<DispatchParams>,
) -> Response {
    let section = match parse_section(&section) {
        Ok(section) => section,
        Err(resp) => return resp,
    };
    match state
        .dispatcher
        .dispatch(&report_id, section, params.force)
        .await
    {
        Ok(outcome) => {
            let status = if outcome.enqueued {
                StatusCode::ACCEPTED
            } else {
                StatusCode::OK
            };
            (status, Json(outcome)).into_response()
        }
        Err(err) => pipeline_error(err),
    }
}

async fn report_handler(
    State(state): State<Arc<AppState>>,
    Path(report_id): Path<String>,
) -> Response {
    match state.store.require_report(&report_id).await {
        Ok(report) => Json(ReportView::from(report)).into_response(),
        Err(err) => pipeline_error(err.into()),
    }
}

async fn section_handler(
    State(state): State<Arc<AppState>>,
    Path((report_id, section)): Path<(String, String)>,
) -> Response {
    let section = match parse_section(&section) {
        Ok(section) => section,
        Err(resp) => return resp,
    };
    match state.store.require_report(&report_id).await {
        Ok(report) => {
            let record = report.section(section).cloned().unwrap_or_default();
            Json::<SectionRecord>(record).into_response()
        }
        Err(err) => pipeline_error(err.into()),
    }
}

fn parse_section(raw: &str) -> Result<SectionName, Response> {
    raw.parse::<SectionName>().map_err(|err| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "UnknownSection", "message": err.to_string()})),
        )
            .into_response()
    })
}

fn pipeline_error(err: PipelineError) -> Response {
    let status = match &err {
        PipelineError::ReportNotFound { .. } => StatusCode::NOT_FOUND,
        PipelineError::PrerequisitesNotMet { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(kind = err.kind(), error = %err, "request failed");
    }
    let mut body = json!({"error": err.kind(), "message": err.to_string()});
    if let PipelineError::PrerequisitesNotMet { missing, .. } = &err {
        body["missing"] = json!(missing);
    }
    (status, Json(body)).into_response()
}
