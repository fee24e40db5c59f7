#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::Router;
use http::{HeaderMap, Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use approvals_backend::config::Config;
use approvals_backend::directory::UserDirectory;
use approvals_backend::test_util;
use approvals_backend::{routes, AppState};

pub const JWKS_PATH: &str = "/test-tenant/discovery/v2.0/keys";

/// Identity platform stand-in serving the test key set.
pub async fn jwks_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(test_util::jwks_json()))
        .mount(&server)
        .await;
    server
}

pub fn config_for(server: &MockServer) -> Config {
    test_util::test_config_with_jwks(&format!("{}{}", server.uri(), JWKS_PATH))
}

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    pub jwks: MockServer,
}

impl TestApp {
    pub async fn new() -> Self {
        let jwks = jwks_server().await;
        Self::with_config(config_for(&jwks), jwks)
    }

    pub fn with_config(config: Config, jwks: MockServer) -> Self {
        let directory = UserDirectory::open_in_memory().unwrap();
        Self::with_directory(config, directory, jwks)
    }

    pub fn with_directory(config: Config, directory: UserDirectory, jwks: MockServer) -> Self {
        let state = Arc::new(AppState::new(config, directory).unwrap());
        let app = routes::router(state.clone());
        Self { app, state, jwks }
    }

    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let (status, body, _) = self.request_with_origin(method, uri, token, None).await;
        (status, body)
    }

    pub async fn request_with_origin(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        origin: Option<&str>,
    ) -> (StatusCode, Value, HeaderMap) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(origin) = origin {
            builder = builder.header("Origin", origin);
        }

        let response = self
            .app
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body, headers)
    }
}
