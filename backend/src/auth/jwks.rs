use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};

use crate::config::AuthConfig;

/// Claims of a token that passed verification.
#[derive(Debug, Clone)]
pub struct VerifiedClaims {
    /// Decoded payload, exactly as issued.
    pub claims: Map<String, Value>,
    /// Key that verified the signature. Diagnostics only.
    pub kid: String,
    /// Allowed issuer that matched. Diagnostics only.
    pub issuer: String,
}

impl VerifiedClaims {
    /// Trimmed `sub` claim, if present and non-empty.
    pub fn subject(&self) -> Option<&str> {
        self.claims
            .get("sub")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Raw `scp` claim (space-separated delegated scopes).
    pub fn scope(&self) -> Option<&str> {
        self.claims.get("scp").and_then(Value::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Token lacks the required scope")]
    InsufficientScope,
    #[error("JWKS fetch error: {0}")]
    JwksFetchError(String),
}

/// JWKS key set response.
#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

/// Keep RSA keys that carry a `kid`; everything else is unusable for RS256.
fn decoding_keys(jwks: JwksResponse) -> HashMap<String, DecodingKey> {
    let mut keys = HashMap::new();

    for jwk in jwks.keys {
        if jwk.kty != "RSA" {
            continue;
        }
        let (Some(kid), Some(n), Some(e)) = (&jwk.kid, &jwk.n, &jwk.e) else {
            continue;
        };
        match DecodingKey::from_rsa_components(n, e) {
            Ok(key) => {
                keys.insert(kid.clone(), key);
            }
            Err(e) => {
                tracing::warn!("Failed to parse RSA key {}: {}", kid, e);
            }
        }
    }

    keys
}

#[derive(Default)]
struct KeyCache {
    keys: HashMap<String, DecodingKey>,
    /// Last successful fetch.
    fetched_at: Option<Instant>,
    /// Last fetch attempt, successful or not.
    attempted_at: Option<Instant>,
}

impl KeyCache {
    fn needs_refresh(&self, kid: &str, ttl: Duration, min_interval: Duration) -> bool {
        if self
            .attempted_at
            .is_some_and(|at| at.elapsed() < min_interval)
        {
            return false;
        }
        let stale = self.fetched_at.map_or(true, |at| at.elapsed() >= ttl);
        stale || !self.keys.contains_key(kid)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
///
/// The scheme is matched case-insensitively. A missing header, another
/// scheme, or an empty token all count as no token.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.map(str::trim).unwrap_or_default();
    let (scheme, token) = value
        .split_once(char::is_whitespace)
        .ok_or(AuthError::MissingToken)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MissingToken);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

/// Short, key-free description of a verification failure.
fn describe(err: &jsonwebtoken::errors::Error) -> String {
    match err.kind() {
        ErrorKind::ExpiredSignature => "token expired".to_string(),
        ErrorKind::ImmatureSignature => "token not yet valid".to_string(),
        ErrorKind::InvalidSignature => "signature mismatch".to_string(),
        ErrorKind::InvalidIssuer => "issuer not accepted".to_string(),
        ErrorKind::InvalidAudience => "audience mismatch".to_string(),
        ErrorKind::InvalidAlgorithm => "algorithm not accepted".to_string(),
        ErrorKind::MissingRequiredClaim(claim) => format!("missing claim: {claim}"),
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => "malformed token".to_string(),
        _ => "verification failed".to_string(),
    }
}

/// Signing keys fetched from the JWKS endpoint, shared with background
/// refresh tasks.
struct KeyStore {
    http_client: Client,
    jwks_uri: String,
    cache: RwLock<KeyCache>,
    refresh_lock: Arc<Mutex<()>>,
    cache_ttl: Duration,
    min_refresh_interval: Duration,
}

impl KeyStore {
    async fn refresh(&self) -> Result<usize, AuthError> {
        tracing::info!("Fetching JWKS from {}", self.jwks_uri);

        let fetched = self.fetch().await;

        let mut cache = self.cache.write().await;
        cache.attempted_at = Some(Instant::now());

        let keys = fetched?;
        let count = keys.len();
        cache.keys = keys;
        cache.fetched_at = cache.attempted_at;

        tracing::info!("Loaded {} JWKS keys", count);
        Ok(count)
    }

    async fn fetch(&self) -> Result<HashMap<String, DecodingKey>, AuthError> {
        let response: JwksResponse = self
            .http_client
            .get(&self.jwks_uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::JwksFetchError(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::JwksFetchError(e.to_string()))?;

        Ok(decoding_keys(response))
    }

    /// Start a refresh on the runtime unless one is already running.
    fn spawn_refresh(self: &Arc<Self>) {
        let Ok(refreshing) = Arc::clone(&self.refresh_lock).try_lock_owned() else {
            return;
        };
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let _refreshing = refreshing;
            if let Err(e) = store.refresh().await {
                tracing::warn!("Background JWKS refresh failed, keeping cached keys: {}", e);
            }
        });
    }

    /// Key for `kid`.
    ///
    /// A cached key is returned immediately; when the cache is due for a
    /// refresh, that refresh runs in the background. Only a `kid` missing
    /// from the cache waits on the network.
    async fn decoding_key(self: &Arc<Self>, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let cache = self.cache.read().await;
            let refresh_due = cache.needs_refresh(kid, self.cache_ttl, self.min_refresh_interval);
            if let Some(key) = cache.keys.get(kid) {
                if refresh_due {
                    self.spawn_refresh();
                }
                return Ok(key.clone());
            }
            if !refresh_due {
                return Self::lookup(&cache, kid);
            }
        }

        let _refreshing = self.refresh_lock.lock().await;

        // Another request may have refreshed while we waited.
        {
            let cache = self.cache.read().await;
            if !cache.needs_refresh(kid, self.cache_ttl, self.min_refresh_interval) {
                return Self::lookup(&cache, kid);
            }
        }

        let refreshed = self.refresh().await;
        let cache = self.cache.read().await;
        match (Self::lookup(&cache, kid), refreshed) {
            (Ok(key), _) => Ok(key),
            (Err(_), Err(e)) => Err(e),
            (Err(e), Ok(_)) => Err(e),
        }
    }

    fn lookup(cache: &KeyCache, kid: &str) -> Result<DecodingKey, AuthError> {
        if let Some(key) = cache.keys.get(kid) {
            return Ok(key.clone());
        }
        if cache.fetched_at.is_none() {
            return Err(AuthError::JwksFetchError("signing keys unavailable".to_string()));
        }
        Err(AuthError::InvalidToken("unknown signing key".to_string()))
    }
}

/// Verifies bearer tokens against the identity platform's published keys.
///
/// Keys are cached for `jwks_cache_ttl_secs` and refreshed in the background
/// once stale. An unknown `kid` triggers a refresh, but never more often
/// than `jwks_min_refresh_secs`. Only one refresh runs at a time.
pub struct JwksClient {
    keys: Arc<KeyStore>,
    issuers: Vec<String>,
    audience: String,
    leeway: u64,
    required_scope: Option<String>,
}

impl JwksClient {
    /// Build a client. No network traffic happens until the first refresh.
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| AuthError::JwksFetchError(e.to_string()))?;

        Ok(Self {
            keys: Arc::new(KeyStore {
                http_client,
                jwks_uri: config.jwks_uri(),
                cache: RwLock::new(KeyCache::default()),
                refresh_lock: Arc::new(Mutex::new(())),
                cache_ttl: Duration::from_secs(config.jwks_cache_ttl_secs),
                min_refresh_interval: Duration::from_secs(config.jwks_min_refresh_secs),
            }),
            issuers: config.allowed_issuers(),
            audience: config.audience.trim().to_string(),
            leeway: config.clock_skew_secs,
            required_scope: config
                .required_scope
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
        })
    }

    pub fn jwks_uri(&self) -> &str {
        &self.keys.jwks_uri
    }

    pub fn issuers(&self) -> &[String] {
        &self.issuers
    }

    /// Fetch the key set and replace the cache. On failure the previous keys
    /// stay in place. Returns the number of usable keys.
    pub async fn refresh_keys(&self) -> Result<usize, AuthError> {
        let _refreshing = self.keys.refresh_lock.lock().await;
        self.keys.refresh().await
    }

    /// Verify a compact JWT: RS256 signature, issuer allow-list, audience,
    /// expiry and not-before (with clock-skew leeway), then the optional scope.
    pub async fn verify(&self, token: &str) -> Result<VerifiedClaims, AuthError> {
        if self.audience.is_empty() {
            return Err(AuthError::InvalidToken("audience not configured".to_string()));
        }

        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(describe(&e)))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::InvalidToken("algorithm not accepted".to_string()));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("missing kid in token header".to_string()))?;

        let key = self.keys.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = self.leeway;
        validation.validate_nbf = true;
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(self.issuers.as_slice());
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let token_data = decode::<Map<String, Value>>(token, &key, &validation)
            .map_err(|e| AuthError::InvalidToken(describe(&e)))?;

        let verified = VerifiedClaims {
            issuer: token_data
                .claims
                .get("iss")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            claims: token_data.claims,
            kid,
        };

        if let Some(required) = &self.required_scope {
            let granted = verified
                .scope()
                .is_some_and(|scp| scp.split_whitespace().any(|s| s == required));
            if !granted {
                return Err(AuthError::InsufficientScope);
            }
        }

        Ok(verified)
    }

    /// Authenticate a request by validating its Bearer token.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<VerifiedClaims, AuthError> {
        let header = match headers.get(AUTHORIZATION) {
            Some(value) => Some(value.to_str().map_err(|_| {
                AuthError::InvalidToken("authorization header is not valid text".to_string())
            })?),
            None => None,
        };

        let token = bearer_token(header)?;
        let result = self.verify(token).await;
        if let Err(e) = &result {
            tracing::warn!("Bearer verification failed: {}", e);
        }
        result
    }
}
