pub mod admin;
pub mod health;
pub mod session;
pub mod users;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::CorsConfig;
use crate::error::ApiError;
use crate::logging::request_logger;
use crate::AppState;

/// Whether a browser `Origin` may call the API.
///
/// Accepts the configured front-end origin, loopback origins on any port
/// when enabled, and `https` preview hosts under the configured suffix.
pub fn origin_allowed(cors: &CorsConfig, origin: &str) -> bool {
    let origin = origin.trim_end_matches('/');
    if origin.is_empty() {
        return false;
    }

    let frontend = cors.frontend_origin.trim().trim_end_matches('/');
    if !frontend.is_empty() && origin.eq_ignore_ascii_case(frontend) {
        return true;
    }

    if cors.allow_localhost && is_loopback(origin) {
        return true;
    }

    let suffix = cors.preview_suffix.trim();
    if !suffix.is_empty() {
        if let Some(host) = origin.strip_prefix("https://") {
            let host = host.to_ascii_lowercase();
            let valid_host = host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
            return valid_host
                && host.len() > suffix.len()
                && host.ends_with(&suffix.to_ascii_lowercase());
        }
    }

    false
}

fn is_loopback(origin: &str) -> bool {
    ["http://localhost", "http://127.0.0.1"].iter().any(|base| {
        origin.strip_prefix(base).is_some_and(|rest| {
            rest.is_empty()
                || rest
                    .strip_prefix(':')
                    .is_some_and(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
        })
    })
}

pub fn cors_layer(cors: &CorsConfig) -> CorsLayer {
    let cors = cors.clone();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts| {
                origin
                    .to_str()
                    .is_ok_and(|origin| origin_allowed(&cors, origin))
            },
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(600))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" })))
}

/// Method routers answer a wrong verb with an empty 405; give it the JSON
/// error body every other failure carries. The `Allow` header is kept.
async fn json_method_not_allowed(request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    if response.status() != StatusCode::METHOD_NOT_ALLOWED {
        return response;
    }

    let mut json = ApiError::MethodNotAllowed.into_response();
    if let Some(allow) = response.headers().get(header::ALLOW) {
        json.headers_mut().insert(header::ALLOW, allow.clone());
    }
    json
}

/// Assemble the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .merge(health::router())
        .merge(session::router())
        .merge(users::router())
        .merge(admin::router(state.clone()));

    if state.config.server.debug_routes {
        tracing::warn!("Debug routes enabled");
        app = app.merge(session::debug_router());
    }

    app.fallback(not_found)
        .layer(middleware::from_fn(json_method_not_allowed))
        .layer(middleware::from_fn(request_logger))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.cors))
        .with_state(state)
}
