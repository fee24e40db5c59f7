//! Configuration for the approvals API.

use std::collections::HashMap;

use config::{Config as ConfigLoader, Environment, File};
use serde::Deserialize;

/// Flat environment variables used by existing deployments, mapped onto
/// their structured keys. These take precedence over everything else.
const FLAT_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("API_AUDIENCE", "auth.audience"),
    ("CIAM_TENANT_ID", "auth.tenant_id"),
    ("CIAM_DOMAIN", "auth.domain"),
    ("REQUIRED_SCOPE", "auth.required_scope"),
    ("ADMIN_EMAIL", "admin.email"),
    ("SWA_ORIGIN", "cors.frontend_origin"),
    ("PORT", "server.port"),
    ("DATABASE_URL", "database.url"),
    ("LOG_LEVEL", "logging.level"),
];

/// Application configuration, built once at startup and shared by reference.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Mount `/debug/whoami`.
    #[serde(default)]
    pub debug_routes: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug_routes: false,
        }
    }
}

/// Identity platform settings used by the token verifier.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// API application identifier expected in `aud`.
    #[serde(default)]
    pub audience: String,
    /// Directory (tenant) ID of the CIAM tenant.
    #[serde(default)]
    pub tenant_id: String,
    /// Branded CIAM host, e.g. `contoso.ciamlogin.com`.
    #[serde(default)]
    pub domain: String,
    /// Overrides the JWKS location derived from `domain` and `tenant_id`.
    #[serde(default)]
    pub jwks_url: Option<String>,
    /// Issuers accepted in addition to the two CIAM host forms.
    #[serde(default)]
    pub extra_issuers: Vec<String>,
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,
    #[serde(default = "default_jwks_cache_ttl")]
    pub jwks_cache_ttl_secs: u64,
    /// Minimum spacing between refreshes triggered by an unknown `kid`.
    #[serde(default = "default_jwks_min_refresh")]
    pub jwks_min_refresh_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// When set, the `scp` claim must contain this scope.
    #[serde(default)]
    pub required_scope: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            audience: String::new(),
            tenant_id: String::new(),
            domain: String::new(),
            jwks_url: None,
            extra_issuers: vec![],
            clock_skew_secs: default_clock_skew(),
            jwks_cache_ttl_secs: default_jwks_cache_ttl(),
            jwks_min_refresh_secs: default_jwks_min_refresh(),
            http_timeout_secs: default_http_timeout(),
            required_scope: None,
        }
    }
}

impl AuthConfig {
    /// JWKS endpoint: explicit override, else the branded-domain discovery keys.
    pub fn jwks_uri(&self) -> String {
        match self.jwks_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => format!(
                "https://{}/{}/discovery/v2.0/keys",
                self.domain.trim(),
                self.tenant_id.trim()
            ),
        }
    }

    /// Accepted `iss` values. CIAM presents either the tenant-ID host or the
    /// branded host depending on how the token was requested.
    pub fn allowed_issuers(&self) -> Vec<String> {
        let tenant = self.tenant_id.trim();
        let domain = self.domain.trim();
        let mut issuers = Vec::new();

        if !tenant.is_empty() {
            issuers.push(format!("https://{tenant}.ciamlogin.com/{tenant}/v2.0"));
            if !domain.is_empty() {
                issuers.push(format!("https://{domain}/{tenant}/v2.0"));
            }
        }

        for extra in &self.extra_issuers {
            let extra = extra.trim();
            if !extra.is_empty() && !issuers.iter().any(|i| i == extra) {
                issuers.push(extra.to_string());
            }
        }

        issuers
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdminConfig {
    /// The single administrator, compared against the caller's resolved email.
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// Canonical front-end origin.
    #[serde(default)]
    pub frontend_origin: String,
    #[serde(default = "default_true")]
    pub allow_localhost: bool,
    /// Host suffix accepted for preview deployments.
    #[serde(default = "default_preview_suffix")]
    pub preview_suffix: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            frontend_origin: String::new(),
            allow_localhost: true,
            preview_suffix: default_preview_suffix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite location, `sqlite:` prefix optional. `:memory:` for tests.
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            query_timeout_ms: default_query_timeout(),
            run_migrations: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_clock_skew() -> u64 {
    60
}
fn default_jwks_cache_ttl() -> u64 {
    3600
}
fn default_jwks_min_refresh() -> u64 {
    30
}
fn default_http_timeout() -> u64 {
    5
}
fn default_true() -> bool {
    true
}
fn default_preview_suffix() -> String {
    ".azurestaticapps.net".to_string()
}
fn default_database_url() -> String {
    "sqlite:./data/approvals.db".to_string()
}
fn default_query_timeout() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl Config {
    /// Load configuration from `config.toml` and the process environment.
    ///
    /// Sources (in order of precedence):
    /// 1. Flat deployment variables (`API_AUDIENCE`, `ADMIN_EMAIL`, ...)
    /// 2. `APPROVALS__SECTION__KEY` environment variables
    /// 3. config.toml file (if present)
    /// 4. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Some("config"), std::env::vars().collect())
    }

    /// Same as [`Config::load`] with an explicit file stem and environment.
    pub fn load_from(
        config_file: Option<&str>,
        env: HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigLoader::builder();

        if let Some(name) = config_file {
            builder = builder.add_source(File::with_name(name).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("APPROVALS")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("auth.extra_issuers")
                .try_parsing(true)
                .source(Some(env.clone())),
        );

        for (var, key) in FLAT_ENV_OVERRIDES {
            let value = env
                .get(*var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
            builder = builder.set_override_option(*key, value)?;
        }

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Human-readable problems that will make the service misbehave.
    /// Logged at startup; none of them prevent the server from starting.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.auth.audience.trim().is_empty() {
            warnings.push("auth.audience (API_AUDIENCE) is not set; every bearer token will be rejected".to_string());
        }
        if self.auth.tenant_id.trim().is_empty() {
            warnings.push("auth.tenant_id (CIAM_TENANT_ID) is not set; no issuer can match".to_string());
        }
        if self.auth.domain.trim().is_empty() && self.auth.jwks_url.is_none() {
            warnings.push("auth.domain (CIAM_DOMAIN) is not set; signing keys cannot be fetched".to_string());
        }
        if self.admin.email.trim().is_empty() {
            warnings.push("admin.email (ADMIN_EMAIL) is not set; admin routes will deny everyone".to_string());
        }
        if self.cors.frontend_origin.trim().is_empty() {
            warnings.push("cors.frontend_origin (SWA_ORIGIN) is not set; only localhost and preview origins are allowed".to_string());
        }

        warnings
    }
}
