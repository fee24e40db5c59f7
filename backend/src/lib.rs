pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod logging;
pub mod models;
pub mod routes;
pub mod test_util;

pub use auth::{AdminGate, AuthError, JwksClient, VerifiedClaims};
pub use config::Config;
pub use directory::{DirectoryError, UserDirectory};
pub use error::ApiError;
pub use models::{AppUser, AuditAction, AuditEntry, UserStatus};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Bearer token verifier with its signing-key cache.
    pub jwks_client: JwksClient,
    pub directory: UserDirectory,
    pub admin_gate: AdminGate,
}

impl AppState {
    pub fn new(config: Config, directory: UserDirectory) -> Result<Self, AuthError> {
        let jwks_client = JwksClient::new(&config.auth)?;
        let admin_gate = AdminGate::new(&config.admin.email);

        Ok(Self {
            config,
            jwks_client,
            directory,
            admin_gate,
        })
    }
}
