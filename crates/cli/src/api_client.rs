//! HTTP client for the upload API.

use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::upload::{
    AbortUploadResponse, CompleteUploadResponse, ErrorResponse, InitUploadRequest,
    InitUploadResponse, OngoingUploadsResponse, QuotaUsageResponse, UploadStatusResponse,
    WriteChunkResponse,
};
use ferry_core::{ContentHash, UploadId};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;

/// Header carrying the hex SHA-256 of a chunk body.
pub const CHUNK_SHA256_HEADER: &str = "x-chunk-sha256";

/// Session operations the uploader drives.
#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn init(&self, request: &InitUploadRequest) -> ClientResult<InitUploadResponse>;

    async fn write_chunk(
        &self,
        upload_id: UploadId,
        chunk_index: u64,
        chunk_sha256: &ContentHash,
        data: Bytes,
    ) -> ClientResult<WriteChunkResponse>;

    async fn status(&self, upload_id: UploadId) -> ClientResult<UploadStatusResponse>;

    async fn complete(&self, upload_id: UploadId) -> ClientResult<CompleteUploadResponse>;

    async fn abort(&self, upload_id: UploadId) -> ClientResult<AbortUploadResponse>;

    async fn list(&self) -> ClientResult<OngoingUploadsResponse>;
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: &str, token: &str) -> ClientResult<Self> {
        // The trailing slash keeps a path prefix such as `/ferry` when joining.
        let base_url = format!("{}/", normalize_base_url(base_url)?);
        let base_url =
            Url::parse(&base_url).map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.to_string(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> ClientResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::InvalidUrl(format!("{path}: {e}")))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> ClientResult<T> {
        let response = req.bearer_auth(&self.token).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Caller's quota usage.
    pub async fn quota(&self) -> ClientResult<QuotaUsageResponse> {
        let url = self.url("/v1/quota")?;
        self.send_json(self.http.get(url)).await
    }
}

#[async_trait]
impl UploadApi for ApiClient {
    async fn init(&self, request: &InitUploadRequest) -> ClientResult<InitUploadResponse> {
        let url = self.url("/v1/uploads")?;
        self.send_json(self.http.post(url).json(request)).await
    }

    async fn write_chunk(
        &self,
        upload_id: UploadId,
        chunk_index: u64,
        chunk_sha256: &ContentHash,
        data: Bytes,
    ) -> ClientResult<WriteChunkResponse> {
        let url = self.url(&format!("/v1/uploads/{upload_id}/chunks/{chunk_index}"))?;
        let req = self
            .http
            .put(url)
            .header(CHUNK_SHA256_HEADER, chunk_sha256.to_hex())
            .body(data);
        self.send_json(req).await
    }

    async fn status(&self, upload_id: UploadId) -> ClientResult<UploadStatusResponse> {
        let url = self.url(&format!("/v1/uploads/{upload_id}"))?;
        self.send_json(self.http.get(url)).await
    }

    async fn complete(&self, upload_id: UploadId) -> ClientResult<CompleteUploadResponse> {
        let url = self.url(&format!("/v1/uploads/{upload_id}/complete"))?;
        self.send_json(self.http.post(url)).await
    }

    async fn abort(&self, upload_id: UploadId) -> ClientResult<AbortUploadResponse> {
        let url = self.url(&format!("/v1/uploads/{upload_id}"))?;
        self.send_json(self.http.delete(url)).await
    }

    async fn list(&self) -> ClientResult<OngoingUploadsResponse> {
        let url = self.url("/v1/uploads")?;
        self.send_json(self.http.get(url)).await
    }
}

/// Turn a failed response into [`ClientError::Api`].
///
/// Bodies that are not an `ErrorResponse` (proxies, load balancers) keep the
/// raw text as the message.
fn api_error(status: StatusCode, body: &str) -> ClientError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) => ClientError::Api {
            code: err.code,
            status: status.as_u16(),
            message: err.message,
            details: err.details,
        },
        Err(_) => ClientError::Api {
            code: "http_error".to_string(),
            status: status.as_u16(),
            message: if body.is_empty() {
                status.to_string()
            } else {
                body.to_string()
            },
            details: None,
        },
    }
}

pub fn normalize_base_url(url: &str) -> ClientResult<String> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ClientError::InvalidUrl(
            "server URL must start with http:// or https://".to_string(),
        ));
    }
    Ok(url.trim_end_matches('/').to_string())
}
