//! Bearer token authentication middleware.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use ferry_core::config::AuthConfig;
use ferry_core::{ContentHash, OwnerId};
use std::collections::HashMap;
use tracing::Instrument;
use uuid::Uuid;

/// Maximum length for trace IDs.
/// Longer trace IDs are truncated to prevent log bloat and log injection.
const MAX_TRACE_ID_LEN: usize = 128;

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a trace ID from a client-provided value.
    ///
    /// Truncated to `MAX_TRACE_ID_LEN` characters; non-printable characters
    /// are dropped.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated request extension.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub owner: OwnerId,
    pub admin: bool,
}

impl AuthenticatedUser {
    /// Require an admin token.
    pub fn require_admin(&self) -> ApiResult<()> {
        if self.admin {
            Ok(())
        } else {
            Err(ApiError::Forbidden("admin token required".to_string()))
        }
    }
}

/// Configured tokens keyed by their SHA-256 hex digest.
#[derive(Clone, Debug, Default)]
pub struct TokenIndex {
    by_hash: HashMap<String, AuthenticatedUser>,
}

impl TokenIndex {
    pub fn from_config(config: &AuthConfig) -> Self {
        let by_hash = config
            .tokens
            .iter()
            .map(|t| {
                (
                    t.token_hash.to_ascii_lowercase(),
                    AuthenticatedUser {
                        owner: OwnerId::new(t.owner.clone()),
                        admin: t.admin,
                    },
                )
            })
            .collect();
        Self { by_hash }
    }

    /// Resolve a raw bearer token.
    pub fn lookup(&self, token: &str) -> Option<&AuthenticatedUser> {
        self.by_hash.get(&hash_token(token))
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

/// Extract bearer token from Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(&v[7..])
            } else {
                None
            }
        })
}

/// Extract trace ID from X-Trace-Id header or generate a new one.
fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_else(TraceId::new)
}

fn hash_token(token: &str) -> String {
    ContentHash::compute(token.as_bytes()).to_hex()
}

/// Authentication middleware that validates tokens and sets up trace context.
///
/// Requests without a token pass through unauthenticated; handlers that need
/// a caller use [`require_auth`]. An unknown token is rejected outright.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(&req);
    let trace_id_str = trace_id.0.clone();
    req.extensions_mut().insert(trace_id);

    if let Some(token) = extract_bearer_token(&req) {
        let user = state
            .tokens
            .lookup(token)
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("unknown token".to_string()))?;
        req.extensions_mut().insert(user);
    }

    let response = next
        .run(req)
        .instrument(tracing::info_span!("request", trace_id = %trace_id_str))
        .await;

    Ok(response)
}

/// Require authentication (token must be present).
pub fn require_auth(req: &Request) -> ApiResult<&AuthenticatedUser> {
    req.extensions()
        .get::<AuthenticatedUser>()
        .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
}
