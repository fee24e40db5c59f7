pub mod admin;
pub mod identity;
pub mod jwks;

pub use admin::AdminGate;
pub use identity::{display_name_from_claims, email_from_claims, resolve_email};
pub use jwks::{bearer_token, AuthError, JwksClient, VerifiedClaims};
