//! Token introspection for the signed-in caller.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::auth::{email_from_claims, resolve_email};
use crate::error::Result;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub ok: bool,
    pub sub: Option<String>,
    pub username: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WhoAmIResponse {
    pub ok: bool,
    pub sub: Option<String>,
    pub derived_email: Option<String>,
    pub is_admin: bool,
    pub scp: Option<String>,
    pub kid: String,
    pub issuer: String,
}

/// GET /api/ping - verify the token and echo who it belongs to
async fn ping(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<PingResponse>> {
    let verified = state.jwks_client.authenticate(&headers).await?;

    Ok(Json(PingResponse {
        ok: true,
        sub: verified.subject().map(String::from),
        username: email_from_claims(&verified.claims),
        scope: verified.scope().map(String::from),
    }))
}

/// GET /debug/whoami - identity resolution as the server sees it
async fn whoami(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<WhoAmIResponse>> {
    let verified = state.jwks_client.authenticate(&headers).await?;
    let derived_email = resolve_email(&verified, &state.directory).await?;
    let is_admin = derived_email
        .as_deref()
        .is_some_and(|email| state.admin_gate.is_admin(email));

    Ok(Json(WhoAmIResponse {
        ok: true,
        sub: verified.subject().map(String::from),
        derived_email,
        is_admin,
        scp: verified.scope().map(String::from),
        kid: verified.kid,
        issuer: verified.issuer,
    }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/ping", get(ping))
}

pub fn debug_router() -> Router<Arc<AppState>> {
    Router::new().route("/debug/whoami", get(whoami))
}
