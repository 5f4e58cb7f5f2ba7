//! Upload control plane handlers.

use crate::auth::require_auth;
use crate::error::{ApiError, ApiResult};
use crate::metrics::record_upload_error;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_LENGTH;
use ferry_core::UploadId;
use ferry_core::upload::{
    AbortUploadResponse, CompleteUploadResponse, InitUploadRequest, InitUploadResponse,
    OngoingUploadsResponse, QuotaUsageResponse, UploadStatusResponse, WriteChunkResponse,
};

/// Header carrying the hex SHA-256 of a chunk body.
pub const CHUNK_SHA256_HEADER: &str = "x-chunk-sha256";

/// Maximum request body size for init requests (64 KiB).
const MAX_INIT_BODY_SIZE: usize = 64 * 1024;

/// POST /v1/uploads - Create an upload session.
pub async fn create_upload(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<InitUploadResponse>)> {
    let auth = require_auth(&req)?.clone();

    let body: InitUploadRequest = {
        let bytes = axum::body::to_bytes(req.into_body(), MAX_INIT_BODY_SIZE)
            .await
            .map_err(|e| ApiError::Validation(format!("failed to read body: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::Validation(format!("invalid JSON: {e}")))?
    };

    let response = state
        .coordinator
        .init(&auth.owner, body)
        .await
        .inspect_err(|e| record_upload_error(e.code()))?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// PUT /v1/uploads/{upload_id}/chunks/{chunk_index} - Write one chunk.
///
/// The body is the raw chunk. `Content-Length` is the declared byte length
/// and `X-Chunk-Sha256` the declared hash.
#[tracing::instrument(skip(state, req), fields(upload_id = %upload_id, chunk_index = %chunk_index))]
pub async fn write_chunk(
    State(state): State<AppState>,
    Path((upload_id, chunk_index)): Path<(String, String)>,
    req: Request,
) -> ApiResult<Json<WriteChunkResponse>> {
    let auth = require_auth(&req)?.clone();
    let upload_id = UploadId::parse(&upload_id)?;
    let chunk_index: u64 = chunk_index
        .parse()
        .map_err(|_| ApiError::Validation(format!("invalid chunk index {chunk_index:?}")))?;

    let chunk_sha256 = req
        .headers()
        .get(CHUNK_SHA256_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ApiError::Validation(format!("missing {CHUNK_SHA256_HEADER} header")))?;
    let declared_len = req
        .headers()
        .get(CONTENT_LENGTH)
        .map(|v| {
            v.to_str()
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| ApiError::Validation("invalid content-length".to_string()))
        })
        .transpose()?;

    let limit = state.config.server.max_chunk_size as usize;
    let data = axum::body::to_bytes(req.into_body(), limit)
        .await
        .map_err(|e| ApiError::Validation(format!("failed to read chunk: {e}")))?;
    let declared_len = declared_len.unwrap_or(data.len() as u64);

    let response = state
        .coordinator
        .write_chunk(
            &auth.owner,
            upload_id,
            chunk_index,
            &chunk_sha256,
            data,
            declared_len,
        )
        .await
        .inspect_err(|e| record_upload_error(e.code()))?;
    Ok(Json(response))
}

/// GET /v1/uploads/{upload_id} - Get upload status.
pub async fn get_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    req: Request,
) -> ApiResult<Json<UploadStatusResponse>> {
    let auth = require_auth(&req)?;
    let upload_id = UploadId::parse(&upload_id)?;
    Ok(Json(state.coordinator.status(&auth.owner, upload_id).await?))
}

/// POST /v1/uploads/{upload_id}/complete - Verify and complete an upload.
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    req: Request,
) -> ApiResult<Json<CompleteUploadResponse>> {
    let auth = require_auth(&req)?;
    let upload_id = UploadId::parse(&upload_id)?;
    let response = state
        .coordinator
        .complete(&auth.owner, upload_id)
        .await
        .inspect_err(|e| record_upload_error(e.code()))?;
    Ok(Json(response))
}

/// DELETE /v1/uploads/{upload_id} - Abort an upload.
pub async fn abort_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    req: Request,
) -> ApiResult<Json<AbortUploadResponse>> {
    let auth = require_auth(&req)?;
    let upload_id = UploadId::parse(&upload_id)?;
    Ok(Json(state.coordinator.abort(&auth.owner, upload_id).await?))
}

/// GET /v1/uploads - List the caller's live uploads.
pub async fn list_uploads(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<OngoingUploadsResponse>> {
    let auth = require_auth(&req)?;
    Ok(Json(state.coordinator.list_ongoing(&auth.owner).await?))
}

/// GET /v1/quota - Caller's quota usage.
pub async fn get_quota(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<QuotaUsageResponse>> {
    let auth = require_auth(&req)?;
    Ok(Json(state.coordinator.quota_usage(&auth.owner).await?))
}
