//! Error taxonomy for the HTTP surface.

use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::auth::AuthError;
use crate::directory::DirectoryError;

/// Every way a request can fail, mapped to a status and a stable `error` kind.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token lacks the required scope")]
    InsufficientScope,

    #[error("Admin access required")]
    Forbidden,

    #[error("Token does not identify the caller")]
    MissingClaims,

    #[error("Unknown status filter: {0}")]
    InvalidStatus(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found")]
    NotFound,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingToken | ApiError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            ApiError::InsufficientScope | ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::MissingClaims | ApiError::InvalidStatus(_) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::UpstreamUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind used as the `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::MissingToken => "missing_token",
            ApiError::InvalidToken(_) => "invalid_token",
            ApiError::InsufficientScope => "insufficient_scope",
            ApiError::Forbidden => "forbidden",
            ApiError::MissingClaims => "missing_claims",
            ApiError::InvalidStatus(_) => "invalid_status",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound => "not_found",
            ApiError::MethodNotAllowed => "method_not_allowed",
            ApiError::UpstreamUnavailable(_) => "upstream_unavailable",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Token failures carry a short diagnostic. Upstream messages can hold
        // driver or network internals, so they only go to the log.
        let body = match &self {
            ApiError::InvalidToken(reason) => json!({ "error": self.kind(), "detail": reason }),
            ApiError::UpstreamUnavailable(message) => {
                tracing::error!("Upstream failure: {}", message);
                json!({ "error": self.kind() })
            }
            ApiError::BadRequest(message) => {
                tracing::debug!("Rejected request: {}", message);
                json!({ "error": self.kind() })
            }
            _ => json!({ "error": self.kind() }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken => ApiError::MissingToken,
            AuthError::InvalidToken(reason) => ApiError::InvalidToken(reason),
            AuthError::InsufficientScope => ApiError::InsufficientScope,
            AuthError::JwksFetchError(message) => ApiError::UpstreamUnavailable(message),
        }
    }
}

impl From<DirectoryError> for ApiError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound(_) => ApiError::NotFound,
            other => ApiError::UpstreamUnavailable(other.to_string()),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[rstest]
    #[case(ApiError::MissingToken, StatusCode::UNAUTHORIZED, "missing_token")]
    #[case(ApiError::InvalidToken("expired".into()), StatusCode::UNAUTHORIZED, "invalid_token")]
    #[case(ApiError::InsufficientScope, StatusCode::FORBIDDEN, "insufficient_scope")]
    #[case(ApiError::Forbidden, StatusCode::FORBIDDEN, "forbidden")]
    #[case(ApiError::MissingClaims, StatusCode::BAD_REQUEST, "missing_claims")]
    #[case(ApiError::InvalidStatus("x".into()), StatusCode::BAD_REQUEST, "invalid_status")]
    #[case(ApiError::BadRequest("duplicate field".into()), StatusCode::BAD_REQUEST, "bad_request")]
    #[case(ApiError::NotFound, StatusCode::NOT_FOUND, "not_found")]
    #[case(ApiError::MethodNotAllowed, StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed")]
    #[case(ApiError::UpstreamUnavailable("db".into()), StatusCode::INTERNAL_SERVER_ERROR, "upstream_unavailable")]
    fn test_status_and_kind(
        #[case] err: ApiError,
        #[case] status: StatusCode,
        #[case] kind: &str,
    ) {
        assert_eq!(err.status(), status);
        assert_eq!(err.kind(), kind);
    }

    #[tokio::test]
    async fn test_invalid_token_body_has_detail() {
        let (status, body) = body_json(ApiError::InvalidToken("ExpiredSignature".into())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_token");
        assert_eq!(body["detail"], "ExpiredSignature");
    }

    #[tokio::test]
    async fn test_upstream_body_hides_message() {
        let (status, body) =
            body_json(ApiError::UpstreamUnavailable("password authentication failed".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "error": "upstream_unavailable" }));
    }

    #[tokio::test]
    async fn test_bad_request_body_hides_message() {
        let (status, body) =
            body_json(ApiError::BadRequest("Failed to deserialize query string".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "bad_request" }));
    }

    #[test]
    fn test_from_auth_error() {
        assert!(matches!(ApiError::from(AuthError::MissingToken), ApiError::MissingToken));
        assert!(matches!(
            ApiError::from(AuthError::JwksFetchError("timeout".into())),
            ApiError::UpstreamUnavailable(_)
        ));
    }

    #[test]
    fn test_from_directory_error() {
        assert!(matches!(
            ApiError::from(DirectoryError::NotFound("S1".into())),
            ApiError::NotFound
        ));
        assert!(matches!(
            ApiError::from(DirectoryError::Timeout),
            ApiError::UpstreamUnavailable(_)
        ));
    }
}
