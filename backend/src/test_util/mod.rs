//! Fixtures shared by unit and integration tests: a fixed RS256 key pair,
//! its JWKS representation, and helpers that sign tokens with it.

use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};

use crate::config::{AdminConfig, AuthConfig, Config, CorsConfig, DatabaseConfig};
use crate::directory::UserDirectory;
use crate::AppState;

pub const TEST_KID: &str = "test-key";
pub const TEST_PRIVATE_KEY_PEM: &str = include_str!("test_key.pem");
/// Base64url modulus of the key in `test_key.pem`.
pub const TEST_KEY_N: &str = "oBS6XSsr-xu_QKEz5BESiJqQXXuJ_VudMWZeSNXJAvUhH8nUf8Rcx4LpDj6aZniXrkUJtGGHZeURjtEvzkcqWrA1fB3a8Se8oSVQLGECbJq0hto7ANuKsdmntuofSXFyKIHurBNhfz8JIaXtgYI9bKToHziepYjYal5PNu1cTTOq1A5aRxLs7fZULBj9-nU0K3lbKc9bf6DsaWzw6tRJIhXuRSrvvNHIpfkBKpWNQp9I8xKr6U4F41h22Xfpt4hdBUDegeHpa21U8ljg7wJahlSbFeloxbq6PEovojotGRMX_gHMZWl_rwUZQRnfcPb-wn5jq9IEgo_6aalifDzDDQ";
pub const TEST_KEY_E: &str = "AQAB";

pub const TEST_AUDIENCE: &str = "api://approvals-test";
pub const TEST_TENANT: &str = "test-tenant";
pub const TEST_DOMAIN: &str = "login.test.example";
pub const TEST_ADMIN_EMAIL: &str = "boss@example.com";
pub const TEST_FRONTEND_ORIGIN: &str = "https://app.example.com";
pub const TEST_SCOPE: &str = "access_as_user";

pub fn test_config() -> Config {
    Config {
        auth: AuthConfig {
            audience: TEST_AUDIENCE.to_string(),
            tenant_id: TEST_TENANT.to_string(),
            domain: TEST_DOMAIN.to_string(),
            ..Default::default()
        },
        admin: AdminConfig {
            email: TEST_ADMIN_EMAIL.to_string(),
        },
        cors: CorsConfig {
            frontend_origin: TEST_FRONTEND_ORIGIN.to_string(),
            ..Default::default()
        },
        database: DatabaseConfig {
            url: ":memory:".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Test configuration whose key set is served from `jwks_url`.
pub fn test_config_with_jwks(jwks_url: &str) -> Config {
    let mut config = test_config();
    config.auth.jwks_url = Some(jwks_url.to_string());
    config
}

/// The tenant-subdomain issuer accepted by [`test_config`].
pub fn test_issuer() -> String {
    format!("https://{TEST_TENANT}.ciamlogin.com/{TEST_TENANT}/v2.0")
}

pub fn test_jwk() -> Value {
    json!({
        "kty": "RSA",
        "use": "sig",
        "alg": "RS256",
        "kid": TEST_KID,
        "n": TEST_KEY_N,
        "e": TEST_KEY_E,
    })
}

pub fn jwks_json() -> Value {
    json!({ "keys": [test_jwk()] })
}

/// Claims a well-formed access token for `sub` would carry.
pub fn test_claims(sub: &str, email: Option<&str>) -> Value {
    let now = Utc::now();
    let mut claims = json!({
        "sub": sub,
        "aud": TEST_AUDIENCE,
        "iss": test_issuer(),
        "iat": now.timestamp(),
        "nbf": now.timestamp(),
        "exp": (now + Duration::hours(1)).timestamp(),
        "scp": TEST_SCOPE,
    });
    if let Some(email) = email {
        claims["email"] = json!(email);
    }
    claims
}

/// Sign arbitrary claims with the test key under [`TEST_KID`].
pub fn sign_claims(claims: &Value) -> String {
    sign_claims_with_kid(claims, TEST_KID)
}

pub fn sign_claims_with_kid(claims: &Value, kid: &str) -> String {
    let key = EncodingKey::from_rsa_pem(TEST_PRIVATE_KEY_PEM.as_bytes())
        .expect("Invalid test key");
    let header = Header {
        alg: Algorithm::RS256,
        kid: Some(kid.to_string()),
        ..Default::default()
    };

    encode(&header, claims, &key).expect("Failed to encode JWT")
}

pub fn generate_test_jwt(sub: &str, email: Option<&str>) -> String {
    sign_claims(&test_claims(sub, email))
}

pub fn generate_expired_jwt(sub: &str) -> String {
    let now = Utc::now();
    let mut claims = test_claims(sub, None);
    claims["iat"] = json!((now - Duration::hours(2)).timestamp());
    claims["nbf"] = json!((now - Duration::hours(2)).timestamp());
    claims["exp"] = json!((now - Duration::hours(1)).timestamp());
    sign_claims(&claims)
}

/// State over a fresh in-memory directory.
pub fn create_test_state(config: Config) -> Arc<AppState> {
    let directory = UserDirectory::open_in_memory().expect("Failed to open test directory");
    Arc::new(AppState::new(config, directory).expect("Failed to build test state"))
}

/// Hold the directory's connection from another thread for `hold`, so every
/// call in the meantime finds it busy. Returns once the lock is taken.
pub fn stall_directory(
    directory: &UserDirectory,
    hold: std::time::Duration,
) -> std::thread::JoinHandle<()> {
    let conn = Arc::clone(&directory.conn);
    let (locked_tx, locked_rx) = std::sync::mpsc::channel();

    let handle = std::thread::spawn(move || {
        let _guard = conn.lock().expect("Connection lock poisoned");
        let _ = locked_tx.send(());
        std::thread::sleep(hold);
    });

    locked_rx.recv().expect("Stall thread exited early");
    handle
}
