pub mod migrations;
pub mod sqlite;

pub use migrations::{MigrationError, MigrationReport};
pub use sqlite::{DbHealth, UserDirectory, LIST_LIMIT};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("User not found: {0}")]
    NotFound(String),
    #[error("Database query timed out")]
    Timeout,
    #[error("Database connection lock poisoned")]
    Poisoned,
    #[error("Database task failed: {0}")]
    Task(String),
}
