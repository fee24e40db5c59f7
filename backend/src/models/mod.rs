pub mod audit;
pub mod user;

pub use audit::{AuditAction, AuditEntry};
pub use user::{AppUser, UserStatus};
