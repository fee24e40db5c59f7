//! Ordered schema migrations with checksum tracking.
//!
//! Each migration is applied once, inside its own transaction, and recorded
//! in `schema_migrations` with the SHA-256 of its SQL. Editing an applied
//! migration is an error rather than a silent re-run.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

/// Embedded migrations, applied in order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "001_app_user.sql",
        sql: include_str!("../../migrations/001_app_user.sql"),
    },
    Migration {
        name: "002_app_user_audit.sql",
        sql: include_str!("../../migrations/002_app_user_audit.sql"),
    },
];

const SCHEMA_MIGRATIONS_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    checksum TEXT NOT NULL,
    applied_at TEXT NOT NULL
)";

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Migration {name} failed: {source}")]
    Failed {
        name: String,
        source: rusqlite::Error,
    },
    #[error("Migration {name} changed after being applied (recorded {recorded}, now {current})")]
    ChecksumMismatch {
        name: String,
        recorded: String,
        current: String,
    },
}

/// Outcome of a migration run.
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub applied: Vec<&'static str>,
    pub skipped: Vec<&'static str>,
}

/// Hex SHA-256 of a migration's SQL text.
pub fn checksum(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}

/// Apply the embedded migrations.
pub fn run(conn: &mut Connection) -> Result<MigrationReport, MigrationError> {
    apply(conn, MIGRATIONS)
}

pub fn apply(
    conn: &mut Connection,
    migrations: &[Migration],
) -> Result<MigrationReport, MigrationError> {
    conn.execute_batch(SCHEMA_MIGRATIONS_DDL)?;

    let mut report = MigrationReport::default();

    for migration in migrations {
        let current = checksum(migration.sql);
        let recorded: Option<String> = conn
            .query_row(
                "SELECT checksum FROM schema_migrations WHERE name = ?1",
                params![migration.name],
                |row| row.get(0),
            )
            .optional()?;

        match recorded {
            Some(recorded) if recorded == current => {
                tracing::debug!("Skipping migration {} (already applied)", migration.name);
                report.skipped.push(migration.name);
            }
            Some(recorded) => {
                return Err(MigrationError::ChecksumMismatch {
                    name: migration.name.to_string(),
                    recorded,
                    current,
                });
            }
            None => {
                let tx = conn.transaction()?;
                tx.execute_batch(migration.sql)
                    .map_err(|source| MigrationError::Failed {
                        name: migration.name.to_string(),
                        source,
                    })?;
                tx.execute(
                    "INSERT INTO schema_migrations (name, checksum, applied_at) VALUES (?1, ?2, ?3)",
                    params![migration.name, current, Utc::now().to_rfc3339()],
                )?;
                tx.commit()?;

                tracing::info!("Applied migration {}", migration.name);
                report.applied.push(migration.name);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_checksum_is_hex_sha256() {
        assert_eq!(
            checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_run_creates_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        let report = run(&mut conn).unwrap();

        assert_eq!(report.applied, vec!["001_app_user.sql", "002_app_user_audit.sql"]);
        assert!(report.skipped.is_empty());
        assert!(table_exists(&conn, "app_user"));
        assert!(table_exists(&conn, "app_user_audit"));
        assert!(table_exists(&conn, "schema_migrations"));
    }

    #[test]
    fn test_second_run_skips_everything() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        let report = run(&mut conn).unwrap();

        assert!(report.applied.is_empty());
        assert_eq!(report.skipped.len(), MIGRATIONS.len());
    }

    #[test]
    fn test_edited_migration_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply(
            &mut conn,
            &[Migration { name: "001_t.sql", sql: "CREATE TABLE t (x INTEGER);" }],
        )
        .unwrap();

        let err = apply(
            &mut conn,
            &[Migration { name: "001_t.sql", sql: "CREATE TABLE t (x TEXT);" }],
        )
        .unwrap_err();
        assert!(matches!(err, MigrationError::ChecksumMismatch { name, .. } if name == "001_t.sql"));
    }

    #[test]
    fn test_failed_migration_rolls_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        let err = apply(
            &mut conn,
            &[Migration {
                name: "001_broken.sql",
                sql: "CREATE TABLE half (x INTEGER); SELEC nonsense;",
            }],
        )
        .unwrap_err();

        assert!(matches!(err, MigrationError::Failed { .. }));
        assert!(!table_exists(&conn, "half"));
        let recorded: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(recorded, 0);
    }

    #[test]
    fn test_audit_table_is_append_only() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO app_user_audit (subject, action, created_at) VALUES ('S1', 'created', '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        assert!(conn
            .execute("UPDATE app_user_audit SET action = 'approved'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM app_user_audit", []).is_err());
    }
}
