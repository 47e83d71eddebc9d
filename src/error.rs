use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// ApiError
///
/// The error taxonomy shared by the repository and handler layers. Every
/// failure in this core is a deterministic function of current state and
/// input, so there are no retryable/transient variants.
///
/// Status mapping (applied by `IntoResponse`):
/// - `Validation`       → 400
/// - `NotFound`         → 404
/// - `Conflict`         → 409
/// - `Forbidden`        → 403 (operation structurally disallowed, e.g. protected module)
/// - `PermissionDenied` → 403 (caller's role does not satisfy the operation)
/// - `Internal`         → 500
///
/// `Forbidden` and `PermissionDenied` share a status code but are distinct
/// kinds: the former is independent of caller identity, the latter is an
/// access-control failure. Callers and tests can tell them apart by the body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or malformed required input, detected before any store access.
    #[error("validation error: {0}")]
    Validation(String),

    /// The referenced user, module, or permission does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Uniqueness violation: duplicate module name or duplicate grant.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Structurally disallowed regardless of who asks (protected modules).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The caller's identity/role does not satisfy the operation's requirement.
    #[error("permission denied")]
    PermissionDenied,

    /// Database or other infrastructure failure.
    #[error("internal error")]
    Internal,
}

/// Convenience alias used throughout the repository and handler layers.
pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// The error kind as a stable machine-readable tag, included in the
    /// JSON body so clients can distinguish `forbidden` from
    /// `permission_denied` despite the shared 403 status.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::PermissionDenied => "permission_denied",
            ApiError::Internal => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Forbidden(_) | ApiError::PermissionDenied => StatusCode::FORBIDDEN,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Infrastructure failures are logged with detail but surfaced opaquely.
        if matches!(self, ApiError::Internal) {
            tracing::error!("internal error surfaced to client");
        }

        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    /// Maps storage-layer failures onto the taxonomy. Unique-constraint
    /// violations become `Conflict` — this is how racing `grant()` calls are
    /// serialized: the loser sees the constraint error, never a duplicate row.
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => ApiError::NotFound("record"),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                ApiError::Conflict("unique constraint violation".to_string())
            }
            _ => {
                tracing::error!("database error: {:?}", err);
                ApiError::Internal
            }
        }
    }
}
