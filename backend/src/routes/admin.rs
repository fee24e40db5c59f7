//! Admin API routes.
//!
//! Provides:
//! - User listing with optional status filter (`/api/admin/users`)
//! - Approve / reject (`/api/admin/users/:subject/{approve,reject}`)
//! - Per-user audit history (`/api/admin/users/:subject/audit`)
//!
//! Every route sits behind [`require_admin`], which runs before the handler
//! so non-admins never reach a directory query beyond identity resolution.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, Request, State,
    },
    http::HeaderMap,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::auth::resolve_email;
use crate::error::{ApiError, Result};
use crate::models::{AppUser, AuditEntry, UserStatus};
use crate::AppState;

/// Resolved email of the admin performing the request.
#[derive(Debug, Clone)]
pub struct AdminActor(pub String);

/// Middleware that requires an authenticated admin user.
async fn require_admin(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authorize(&state, request.headers()).await {
        Ok(actor) => {
            request.extensions_mut().insert(actor);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<AdminActor> {
    let verified = state.jwks_client.authenticate(headers).await?;
    let email = resolve_email(&verified, &state.directory).await?;

    match email {
        Some(email) if state.admin_gate.is_admin(&email) => Ok(AdminActor(email)),
        _ => {
            tracing::warn!(
                "Admin access denied for subject {}",
                verified.subject().unwrap_or("<none>")
            );
            Err(ApiError::Forbidden)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UsersResponse {
    pub ok: bool,
    pub users: Vec<AppUser>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub ok: bool,
    pub status: UserStatus,
}

#[derive(Debug, Serialize)]
pub struct AuditResponse {
    pub ok: bool,
    pub entries: Vec<AuditEntry>,
}

/// Blank means no filter; anything else must name a status.
fn parse_filter(raw: Option<&str>) -> Result<Option<UserStatus>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ApiError::InvalidStatus(value.to_string())),
    }
}

/// GET /api/admin/users?status=pending
async fn list_users(
    State(state): State<Arc<AppState>>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<UsersResponse>> {
    let Query(query) = query?;
    let filter = parse_filter(query.status.as_deref())?;
    let users = state.directory.list(filter).await?;
    Ok(Json(UsersResponse { ok: true, users }))
}

async fn set_status(
    state: &AppState,
    subject: &str,
    status: UserStatus,
    actor: &AdminActor,
) -> Result<Json<StatusResponse>> {
    let user = state.directory.set_status(subject, status, &actor.0).await?;
    Ok(Json(StatusResponse {
        ok: true,
        status: user.status,
    }))
}

/// POST /api/admin/users/:subject/approve
async fn approve(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AdminActor>,
    subject: std::result::Result<Path<String>, PathRejection>,
) -> Result<Json<StatusResponse>> {
    let Path(subject) = subject?;
    set_status(&state, &subject, UserStatus::Approved, &actor).await
}

/// POST /api/admin/users/:subject/reject
async fn reject(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AdminActor>,
    subject: std::result::Result<Path<String>, PathRejection>,
) -> Result<Json<StatusResponse>> {
    let Path(subject) = subject?;
    set_status(&state, &subject, UserStatus::Rejected, &actor).await
}

/// GET /api/admin/users/:subject/audit
async fn audit(
    State(state): State<Arc<AppState>>,
    subject: std::result::Result<Path<String>, PathRejection>,
) -> Result<Json<AuditResponse>> {
    let Path(subject) = subject?;
    let entries = state.directory.audit_for_subject(&subject).await?;
    Ok(Json(AuditResponse { ok: true, entries }))
}

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/admin/users", get(list_users))
        .route("/api/admin/users/:subject/approve", post(approve))
        .route("/api/admin/users/:subject/reject", post(reject))
        .route("/api/admin/users/:subject/audit", get(audit))
        .route_layer(middleware::from_fn_with_state(state, require_admin))
}
