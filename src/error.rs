use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// key: problem-taxonomy -> rfc7807 carrier shared across layers
#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(sqlx::Error),
    #[error("{detail}")]
    Validation { code: &'static str, detail: String },
    #[error("request body exceeds the configured limit")]
    PayloadTooLarge,
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound { code: &'static str },
    #[error("{detail}")]
    InvalidTransition { code: &'static str, detail: String },
    #[error("{detail}")]
    Conflict { code: &'static str, detail: String },
    #[error("plan limit reached for {feature}")]
    PlanLimitExceeded {
        feature: &'static str,
        limit: i64,
        observed: i64,
    },
    #[error("provider error: {detail}")]
    External { provider: &'static str, detail: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(code: &'static str, detail: impl Into<String>) -> Self {
        AppError::Validation {
            code,
            detail: detail.into(),
        }
    }

    pub fn not_found(code: &'static str) -> Self {
        AppError::NotFound { code }
    }

    pub fn invalid_transition(code: &'static str, detail: impl Into<String>) -> Self {
        AppError::InvalidTransition {
            code,
            detail: detail.into(),
        }
    }

    pub fn conflict(code: &'static str, detail: impl Into<String>) -> Self {
        AppError::Conflict {
            code,
            detail: detail.into(),
        }
    }

    pub fn external(provider: &'static str, detail: impl Into<String>) -> Self {
        AppError::External {
            provider,
            detail: detail.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::InvalidTransition { .. } | AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::PlanLimitExceeded { .. } => StatusCode::FORBIDDEN,
            AppError::External { .. } => StatusCode::BAD_GATEWAY,
            AppError::Db(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation { code, .. }
            | AppError::NotFound { code }
            | AppError::InvalidTransition { code, .. }
            | AppError::Conflict { code, .. } => code,
            AppError::PayloadTooLarge => "request.body_too_large",
            AppError::Unauthenticated => "auth.unauthenticated",
            AppError::Forbidden => "auth.forbidden",
            AppError::PlanLimitExceeded { .. } => "billing.plan_limit_exceeded",
            AppError::External { provider, .. } => provider,
            AppError::Db(_) | AppError::Internal(_) => "internal",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => "Request validation failed",
            AppError::PayloadTooLarge => "Payload too large",
            AppError::Unauthenticated => "Authentication required",
            AppError::Forbidden => "Forbidden",
            AppError::NotFound { .. } => "Resource not found",
            AppError::InvalidTransition { .. } => "Invalid state transition",
            AppError::Conflict { .. } => "Conflict",
            AppError::PlanLimitExceeded { .. } => "Plan limit exceeded",
            AppError::External { .. } => "Upstream provider error",
            AppError::Db(_) | AppError::Internal(_) => "Internal server error",
        }
    }

    fn extensions(&self) -> Map<String, Value> {
        let mut ext = Map::new();
        if let AppError::PlanLimitExceeded {
            feature,
            limit,
            observed,
        } = self
        {
            ext.insert("feature".into(), json!(feature));
            ext.insert("limit".into(), json!(limit));
            ext.insert("observed".into(), json!(observed));
        }
        ext
    }
}

// Row misses surface as not_found and unique violations as conflict so that
// callers never inspect driver errors directly.
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::not_found("resource.not_found"),
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                AppError::conflict("storage.unique_violation", "a conflicting record exists")
            }
            _ => AppError::Db(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let mut body = Map::new();
        body.insert(
            "type".into(),
            json!(format!("https://kyora.dev/problems/{code}")),
        );
        body.insert("title".into(), json!(self.title()));
        body.insert("status".into(), json!(status.as_u16()));
        body.insert("code".into(), json!(code));
        let detail = match &self {
            AppError::Validation { detail, .. }
            | AppError::InvalidTransition { detail, .. }
            | AppError::Conflict { detail, .. }
            | AppError::External { detail, .. } => Some(detail.clone()),
            AppError::PlanLimitExceeded { feature, .. } => {
                Some(format!("the current plan does not allow more {feature}"))
            }
            _ => None,
        };
        if let Some(detail) = detail {
            body.insert("detail".into(), json!(detail));
        }
        for (key, value) in self.extensions() {
            body.insert(key, value);
        }
        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
            #[cfg(debug_assertions)]
            body.insert("error".into(), json!(self.to_string()));
        }
        (status, Json(Value::Object(body))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_row_not_found_maps_to_not_found() {
        let err = AppError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "resource.not_found");
    }

    #[test]
    fn plan_limit_carries_extension_members() {
        let err = AppError::PlanLimitExceeded {
            feature: "maxTeamMembers",
            limit: 3,
            observed: 3,
        };
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        let ext = err.extensions();
        assert_eq!(ext.get("limit"), Some(&json!(3)));
        assert_eq!(ext.get("observed"), Some(&json!(3)));
    }

    #[test]
    fn transition_errors_are_conflicts() {
        let err = AppError::invalid_transition(
            "recurring_expense.invalid_transition",
            "cannot move from ended to paused",
        );
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }
}
