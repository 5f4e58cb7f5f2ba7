//! Health and administrative endpoints.

use crate::auth::require_auth;
use crate::error::{ApiError, ApiResult};
use crate::reaper::ReaperRunReport;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Query, Request, State};
use ferry_metadata::models::ReaperRunRow;
use ferry_metadata::repos::ReaperStats;
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub storage_backend: &'static str,
}

/// GET /v1/health - Health check.
///
/// Intentionally unauthenticated for load balancer and orchestrator probes.
/// Returns only non-sensitive information.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;
    state.storage.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        storage_backend: state.storage.backend_name(),
    }))
}

/// POST /v1/admin/reaper/run - Run the cleanup reaper once.
pub async fn run_reaper(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<ReaperRunReport>> {
    require_auth(&req)?.require_admin()?;
    Ok(Json(state.reaper.run_once().await?))
}

/// Reaper run as returned by the admin API.
#[derive(Debug, Serialize)]
pub struct ReaperRunResponse {
    pub run_id: String,
    pub state: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub stats: Option<ReaperStats>,
}

impl TryFrom<ReaperRunRow> for ReaperRunResponse {
    type Error = ApiError;

    fn try_from(row: ReaperRunRow) -> ApiResult<Self> {
        let format = |t: time::OffsetDateTime| {
            t.format(&time::format_description::well_known::Rfc3339)
                .map_err(|e| ApiError::Internal(format!("failed to format timestamp: {e}")))
        };
        let stats = match row.stats_json.as_deref() {
            Some(json) => match serde_json::from_str(json) {
                Ok(stats) => Some(stats),
                Err(e) => {
                    tracing::warn!(run_id = %row.run_id, error = %e, "unreadable reaper stats");
                    None
                }
            },
            None => None,
        };
        Ok(Self {
            run_id: row.run_id.to_string(),
            state: row.state,
            started_at: format(row.started_at)?,
            finished_at: row.finished_at.map(format).transpose()?,
            stats,
        })
    }
}

/// Query parameters for listing reaper runs.
#[derive(Debug, Deserialize)]
pub struct ListReaperRunsParams {
    /// Maximum number of runs to return (default: 20, max: 100).
    pub limit: Option<u32>,
}

/// GET /v1/admin/reaper/runs - List recent reaper runs.
pub async fn list_reaper_runs(
    State(state): State<AppState>,
    Query(params): Query<ListReaperRunsParams>,
    req: Request,
) -> ApiResult<Json<Vec<ReaperRunResponse>>> {
    require_auth(&req)?.require_admin()?;

    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let runs = state
        .metadata
        .get_recent_reaper_runs(limit)
        .await?
        .into_iter()
        .map(ReaperRunResponse::try_from)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(runs))
}
