//! Wire envelope, error mapping, and request payload types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use reach_dispatch::DispatchError;
use reach_store::StoreError;

use crate::auth::AuthError;

/// API failure carried to the wire as `{ok: false, error: {code, message}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn auth_invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "auth_invalid", message)
    }

    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "auth_expired", message)
    }

    pub fn scope_missing(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "auth_scope_missing", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn admission_denied(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "admission_denied", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "ok": false,
                "error": {"code": self.code, "message": self.message},
            })),
        )
            .into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match &error {
            AuthError::TokenExpired => Self::auth_expired(error.to_string()),
            AuthError::ScopeMissing(_) => Self::scope_missing(error.to_string()),
            AuthError::TokenInvalid | AuthError::ClaimsInvalid(_) => {
                Self::auth_invalid(error.to_string())
            }
            AuthError::KeyFileRead(_)
            | AuthError::KeyFileParse(_)
            | AuthError::UnknownScope { .. } => Self::internal(error.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match &error {
            StoreError::MissionNotFound(_)
            | StoreError::TaskNotFound(_)
            | StoreError::ContactedLeadNotFound(_)
            | StoreError::UnsubscribeNotFound(_) => Self::not_found(error.to_string()),
            StoreError::MissionAlreadyExists(_)
            | StoreError::TaskAlreadyExists(_)
            | StoreError::ContactedLeadAlreadyExists(_)
            | StoreError::MissionNotActive { .. }
            | StoreError::RetryNotAllowed { .. }
            | StoreError::InvalidMissionTransition { .. }
            | StoreError::InvalidTaskTransition { .. } => Self::bad_request(error.to_string()),
            _ => Self::internal(error.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::Store(error) => Self::from(error),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Success envelope: `{ok: true, data}`.
pub fn ok_response(data: Value) -> Response {
    (StatusCode::OK, Json(json!({"ok": true, "data": data}))).into_response()
}

/// Body of `POST /auth/exchange`.
#[derive(Debug, Deserialize)]
pub(crate) struct ExchangeRequest {
    pub api_key: String,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// Query for `GET /missions`.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct MissionListQuery {
    pub status: Option<String>,
    pub q: Option<String>,
    pub limit: Option<usize>,
}

/// Query for `GET /unsubscribes`.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct UnsubscribeListQuery {
    pub limit: Option<usize>,
}

/// Query for `GET /quota/status`. Absent limits fall back to the defaults.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct QuotaStatusQuery {
    pub user: Option<String>,
    pub limit_search: Option<u32>,
    pub limit_enrich: Option<u32>,
    pub limit_investigate: Option<u32>,
    pub limit_contact: Option<u32>,
}

/// Query for `GET /tracking/click`.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct TrackingClickQuery {
    pub id: Option<String>,
    pub url: Option<String>,
}

/// Query for `GET /agent/due-tasks`.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct DueTasksQuery {
    pub provider: Option<String>,
    pub limit: Option<usize>,
}

/// Body of `POST /agent/task-complete`.
#[derive(Debug, Deserialize)]
pub(crate) struct TaskCompleteRequest {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}
