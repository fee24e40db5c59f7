//! Self-service registration for signed-in callers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::auth::{display_name_from_claims, resolve_email};
use crate::error::{ApiError, Result};
use crate::models::{AppUser, UserStatus};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct InitResponse {
    pub ok: bool,
    pub status: UserStatus,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub ok: bool,
    pub user: AppUser,
}

/// POST /api/users/init - register the caller as pending, or refresh their
/// email and name. An existing status is never changed here.
async fn init(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<InitResponse>> {
    let verified = state.jwks_client.authenticate(&headers).await?;
    let subject = verified.subject().ok_or(ApiError::MissingClaims)?;
    let email = resolve_email(&verified, &state.directory)
        .await?
        .ok_or(ApiError::MissingClaims)?;
    let display_name = display_name_from_claims(&verified.claims, &email);

    let user = state
        .directory
        .upsert_pending(subject, &email, display_name.as_deref())
        .await?;

    Ok(Json(InitResponse {
        ok: true,
        status: user.status,
    }))
}

/// GET /api/users/me
async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>> {
    let verified = state.jwks_client.authenticate(&headers).await?;
    let subject = verified.subject().ok_or(ApiError::MissingClaims)?;

    let user = state
        .directory
        .get_by_subject(subject)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(MeResponse { ok: true, user }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/users/init", post(init))
        .route("/api/users/me", get(me))
}
